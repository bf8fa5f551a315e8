//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses used by the hypervisor's memory
//! management code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | An address in the hypervisor's own translation regime. |
//! | [`PhysicalAddress`] | A physical address; never dereferenced directly. |
//!
//! ## Page Sizes
//!
//! The three arm64 translation granules are available as marker types
//! implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB granule
//! - [`Size16K`]: 16 KiB granule
//! - [`Size64K`]: 64 KiB granule
//!
//! All alignment helpers are generic over the granule so that the page size
//! is explicit at every call site:
//!
//! ```rust
//! # use hyp_memory_addresses::*;
//! let va = VirtualAddress::new(0x1_0000_0010);
//! assert!(!va.is_aligned::<Size4K>());
//! assert_eq!(va.align_down::<Size4K>() + Size4K::SIZE, va.align_up::<Size4K>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size4K, Size16K, Size64K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round a byte count up to whole pages of granule `S`.
#[inline]
#[must_use]
pub const fn page_align<S: PageSize>(bytes: u64) -> u64 {
    align_up(bytes, S::SIZE)
}
