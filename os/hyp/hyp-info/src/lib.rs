//! # Hypervisor Configuration
//!
//! Compile-time constants shared by the hypervisor's memory management
//! crates. Everything here is a `const`, so a misconfiguration is caught by
//! the assertions at the bottom of [`memory`] rather than at run time.
//!
//! ## Page granule
//!
//! The hypervisor runs with a single translation granule, selected by
//! [`memory::HypPageSize`]. All other crates derive their page arithmetic
//! from it:
//!
//! ```rust
//! # use hyp_info::memory::{PAGE_SIZE, PAGE_SHIFT};
//! assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
//! ```
//!
//! ## Per-CPU state
//!
//! Per-CPU arrays are sized by [`memory::MAX_CPUS`]. CPU ids handed out by
//! the platform must stay below that bound.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
