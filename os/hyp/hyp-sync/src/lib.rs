//! # Hypervisor synchronization primitives
//!
//! - [`SpinLock`]: fair ticket lock guarding short, non-blocking critical sections.
//! - [`PerCpu`]: one slot per CPU, addressed through a [`CpuId`] provider.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod per_cpu;
mod spin_lock;

pub use per_cpu::{CpuId, PerCpu};
pub use spin_lock::{SpinLock, SpinLockGuard};
