//! # Hypervisor Memory Plumbing
//!
//! The contracts the hypervisor's dynamic allocators are built against, and
//! the page cache that feeds them.
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────┐
//! │  host memcache (host-owned)  │─admit─▶│  per-CPU Memcache (hyp)  │
//! └──────────────────────────────┘        └────────────┬─────────────┘
//!               ▲                                pop   │   ▲ push
//!               │ donate back                          ▼   │
//!               │                         ┌──────────────────────────┐
//!               └─────────────────────────│  private VA mappings     │
//!                                         └──────────────────────────┘
//! ```
//!
//! ## Contracts
//!
//! * [`PhysMapper`]: maps a physical page to its hypervisor alias.
//! * [`PrivateMapper`]: reserves private VA ranges and installs/removes
//!   single-page mappings in them.
//! * [`HostDonation`]: transfers page ownership between host and hypervisor
//!   and performs cache maintenance so the host observes page contents.
//! * [`HypPlatform`]: everything above plus [`CpuId`], i.e. what an
//!   allocator needs from the surrounding hypervisor.
//!
//! ## Memcache
//!
//! [`Memcache`] is a LIFO of free pages linked **in-band**: each cached page
//! stores the head word of the page below it. It therefore needs no storage
//! of its own beyond two words, and pushing or popping touches exactly one
//! page.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod error;
mod memcache;

pub use error::{DonationError, MapError, MemcacheError};
pub use hyp_sync::CpuId;
pub use memcache::{Memcache, MemcacheHead};

use hyp_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Linear-map translation of pages the hypervisor can see.
pub trait PhysMapper {
    /// Hypervisor alias of `pa`.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;
}

/// Page-table operations on the hypervisor's private VA space.
pub trait PrivateMapper {
    /// Reserve an unmapped, naturally aligned VA region of `size` bytes.
    ///
    /// # Errors
    /// [`MapError::NoMemory`] if the private VA space is exhausted.
    fn alloc_private_va_range(&self, size: u64) -> Result<VirtualAddress, MapError>;

    /// Install one page mapping `va → pa`.
    ///
    /// # Errors
    /// Any [`MapError`]; nothing is installed on failure.
    fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress) -> Result<(), MapError>;

    /// Remove every mapping in `[start, end)` and synchronize the TLB.
    fn unmap_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// Physical address currently backing the private VA `va`.
    fn private_range_pa(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}

/// Ownership transfers with the untrusted host.
pub trait HostDonation {
    /// Hand `nr_pages` pages starting at frame `pfn` back to the host.
    ///
    /// # Errors
    /// [`DonationError`] if the hypervisor does not own the range.
    fn hyp_donate_host(&self, pfn: u64, nr_pages: u64) -> Result<(), DonationError>;

    /// Take ownership of `nr_pages` host pages starting at frame `pfn`.
    ///
    /// # Errors
    /// [`DonationError`] if the host does not own the range.
    fn host_donate_hyp(&self, pfn: u64, nr_pages: u64) -> Result<(), DonationError>;

    /// Clean `[va, va + len)` to the point of coherency.
    fn flush_dcache_to_poc(&self, va: VirtualAddress, len: u64);
}

/// Everything a hypervisor allocator consumes from its environment.
pub trait HypPlatform: PhysMapper + PrivateMapper + HostDonation + CpuId {}

impl<T> HypPlatform for T where T: PhysMapper + PrivateMapper + HostDonation + CpuId {}
