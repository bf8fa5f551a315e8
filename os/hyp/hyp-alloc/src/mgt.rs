//! Uniform management surface for the hypervisor's allocators.
//!
//! The host drives memory pressure through three calls per allocator:
//! push pages in, ask how many could come back, and take them back.
//! [`AllocatorOps`] captures those so a management layer can hold several
//! allocators side by side.

use crate::{HypAllocError, HypAllocator};
use core::ptr::NonNull;
use hyp_info::memory::HOST_REQUEST_PAGE_SIZE;
use hyp_mm::{HypPlatform, Memcache};

/// Operations a memory-management layer runs on a hypervisor allocator.
pub trait AllocatorOps {
    type Error;

    /// Admit the pages of `host_mc`.
    ///
    /// # Errors
    /// Implementation defined; pages admitted before the error stay.
    ///
    /// # Safety
    /// `host_mc` must be a valid memcache of host-donated pages.
    unsafe fn refill(&self, host_mc: &mut Memcache) -> Result<(), Self::Error>;

    /// Give up to `target` pages back through `host_mc`; returns how many.
    ///
    /// # Safety
    /// `host_mc` must be a valid memcache.
    unsafe fn reclaim(&self, host_mc: &mut Memcache, target: u64) -> u64;

    /// Pages a reclaim could return at most.
    fn reclaimable(&self) -> u64;
}

impl<P: HypPlatform, const NR_CPUS: usize> AllocatorOps for HypAllocator<P, NR_CPUS> {
    type Error = HypAllocError;

    unsafe fn refill(&self, host_mc: &mut Memcache) -> Result<(), HypAllocError> {
        unsafe { Self::refill(self, host_mc) }
    }

    unsafe fn reclaim(&self, host_mc: &mut Memcache, target: u64) -> u64 {
        unsafe { Self::reclaim(self, host_mc, target) }
    }

    fn reclaimable(&self) -> u64 {
        Self::reclaimable(self)
    }
}

/// Pool the host should top up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemRequestDest {
    /// The per-CPU memcache of the hypervisor heap.
    HypAlloc,
}

/// Request for host pages, as forwarded to the host on the next exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemRequest {
    pub dest: MemRequestDest,
    /// Number of pages wanted.
    pub nr_pages: u8,
    /// Size of each page.
    pub sz_alloc: u64,
}

/// Why [`HypAllocator::alloc_or_request`] came back empty-handed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocFailure {
    /// The heap needs donations; forward the request and retry.
    #[error("allocation needs host pages: {0:?}")]
    NeedPages(MemRequest),
    /// Anything a donation cannot fix.
    #[error(transparent)]
    Fatal(#[from] HypAllocError),
}

impl<P: HypPlatform, const NR_CPUS: usize> HypAllocator<P, NR_CPUS> {
    /// Allocate `size` bytes, or describe the donation that would let the
    /// allocation succeed.
    ///
    /// # Errors
    /// [`AllocFailure::NeedPages`] when the memcache was short, with the
    /// shortfall taken from [`missing_donations`](Self::missing_donations);
    /// [`AllocFailure::Fatal`] otherwise.
    pub fn alloc_or_request(&self, size: usize) -> Result<NonNull<u8>, AllocFailure> {
        match self.try_alloc(size) {
            Ok(ptr) => Ok(ptr),
            Err(HypAllocError::NoMemory) => Err(AllocFailure::NeedPages(MemRequest {
                dest: MemRequestDest::HypAlloc,
                nr_pages: self.missing_donations(),
                sz_alloc: HOST_REQUEST_PAGE_SIZE,
            })),
            Err(e) => Err(AllocFailure::Fatal(e)),
        }
    }
}
