//! # Hypervisor Heap
//!
//! A dynamic allocator for the protected hypervisor, carving variable-sized
//! chunks out of a private VA range that is only backed by memory on demand.
//!
//! ```text
//!  heap.start                                                      heap.end
//!  │                                                                     │
//!  ▼                                                                     ▼
//!  ┌────────┬──────────┬─────────────┬────────┬──────────┬──────────────┐
//!  │ header │ payload  │ mapped tail │ header │ payload  │  unmapped    │
//!  └────────┴──────────┴─────────────┴────────┴──────────┴──────────────┘
//!  ◄──────────── chunk 0 ───────────►◄────────────── chunk 1 ──────────►
//! ```
//!
//! Every chunk begins with an in-band header recording its payload size,
//! how far its mapping reaches, and its list neighbours. Headers sit in
//! memory the host once owned, so each carries a hash that is checked
//! before the header is trusted; a mismatch halts the hypervisor.
//!
//! ## Backing
//!
//! Pages come from a per-CPU [`Memcache`] the host fills through
//! [`HypAllocator::refill`]. When a request needs more pages than the
//! memcache holds, allocation fails with [`HypAllocError::NoMemory`] and
//! [`HypAllocator::missing_donations`] says how many are missing. Nothing is
//! mapped partially.
//!
//! ## Reclaim
//!
//! [`HypAllocator::reclaim`] returns cached pages first, then unmaps whole
//! pages behind payloads, last chunk first, dropping free chunks where that
//! leaves no untracked hole. [`HypAllocator::reclaimable`] bounds what a
//! reclaim can yield.
//!
//! ## Concurrency
//!
//! The chunk list sits behind one [`SpinLock`]; per-CPU state (memcache,
//! errno, missing-donation count) has a lock per slot and is only taken
//! after the heap lock, never before it. Payloads are zeroed outside the
//! heap lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod accounting;
mod backing;
mod chunk;
mod chunk_list;
mod debug;
mod error;
mod global;
mod heap;
mod mgt;
mod reclaim;
mod split;

pub use accounting::VmMemStat;
pub use chunk::{CHUNK_HEADER_SIZE, MIN_ALLOC, chunk_size};
pub use debug::ChunkInfo;
pub use error::HypAllocError;
pub use mgt::{AllocFailure, AllocatorOps, MemRequest, MemRequestDest};

use crate::backing::{CpuState, HeapOps};
use crate::chunk::payload_size;
use crate::chunk_list::Heap;
use core::ptr::NonNull;
use hyp_info::memory::{HypPageSize, MAX_CPUS, PAGE_SIZE};
use hyp_memory_addresses::VirtualAddress;
use hyp_mm::HypPlatform;
use hyp_sync::{PerCpu, SpinLock};
use log::debug;

/// The hypervisor heap.
///
/// `NR_CPUS` bounds the per-CPU state; the platform may report fewer CPUs
/// online but never more.
pub struct HypAllocator<P: HypPlatform, const NR_CPUS: usize = { MAX_CPUS }> {
    platform: P,
    heap: SpinLock<Heap>,
    cpus: PerCpu<CpuState, NR_CPUS>,
}

impl<P: HypPlatform, const NR_CPUS: usize> HypAllocator<P, NR_CPUS> {
    /// An allocator without a heap yet; see [`init`](Self::init).
    ///
    /// # Panics
    /// If the platform reports more CPUs than `NR_CPUS`.
    pub fn new(platform: P) -> Self {
        assert!(
            platform.nr_cpus() <= NR_CPUS,
            "platform has {} cpus, allocator built for {NR_CPUS}",
            platform.nr_cpus()
        );
        Self {
            platform,
            heap: SpinLock::new(Heap::new()),
            cpus: PerCpu::default(),
        }
    }

    #[inline]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Reserve `size` bytes (rounded up to pages) of private VA for the heap.
    ///
    /// No memory is mapped until the first allocation.
    ///
    /// # Errors
    /// - [`HypAllocError::Invalid`] for an empty heap, one larger than
    ///   `u32::MAX` bytes, or a second call.
    /// - Whatever the VA reservation fails with.
    pub fn init(&self, size: u64) -> Result<(), HypAllocError> {
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|&size| size != 0 && size <= u64::from(u32::MAX))
            .ok_or(HypAllocError::Invalid)?;

        let mut heap = self.heap.lock();
        if heap.is_initialized() {
            return Err(HypAllocError::Invalid);
        }

        let start = self.platform.alloc_private_va_range(size)?;
        if !start.is_aligned::<HypPageSize>() {
            return Err(HypAllocError::Invalid);
        }

        heap.set_range(start, size);
        debug!("hyp allocator: {size:#x} bytes of private VA at {start}");
        Ok(())
    }

    /// Allocate `size` zeroed bytes, aligned to [`MIN_ALLOC`].
    ///
    /// On failure the reason is left in [`errno`](Self::errno).
    #[must_use]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size).ok()
    }

    /// [`alloc`](Self::alloc) with the failure spelled out.
    ///
    /// The per-CPU errno is updated either way.
    ///
    /// # Errors
    /// - [`HypAllocError::Invalid`] for a zero size, an uninitialized heap,
    ///   or a heap without room left.
    /// - [`HypAllocError::TooBig`] for sizes past `u32::MAX`.
    /// - [`HypAllocError::NoMemory`] when the memcache cannot back the
    ///   allocation; see [`missing_donations`](Self::missing_donations).
    pub fn try_alloc(&self, size: usize) -> Result<NonNull<u8>, HypAllocError> {
        let result = self.alloc_chunk(size);
        self.cpus.with_this_cpu(&self.platform, |cpu| {
            cpu.errno = result.map_or_else(HypAllocError::to_errno, |_| 0);
        });

        let (data, len) = result?;
        let ptr = NonNull::new(data.as_mut_ptr::<u8>()).ok_or(HypAllocError::Invalid)?;
        unsafe { ptr.write_bytes(0, len) };
        Ok(ptr)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc_chunk(&self, size: usize) -> Result<(VirtualAddress, usize), HypAllocError> {
        if size == 0 {
            return Err(HypAllocError::Invalid);
        }
        let size = u64::try_from(size)
            .ok()
            .filter(|&size| size <= u64::from(u32::MAX) - MIN_ALLOC)
            .map(payload_size)
            .ok_or(HypAllocError::TooBig)?;

        let mut heap = self.heap.lock();
        if !heap.is_initialized() {
            return Err(HypAllocError::Invalid);
        }
        let chunk = self.ops(&mut heap).alloc(size)?;

        // Bounded by u32::MAX above.
        Ok((chunk.data(), size as usize))
    }

    /// Return the allocation at `ptr` to the heap.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not be freed already.
    ///
    /// # Panics
    /// If the header in front of `ptr` fails validation.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut heap = self.heap.lock();
        self.ops(&mut heap).free(VirtualAddress::from_nonnull(ptr));
    }

    /// Payload size recorded for the allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    ///
    /// # Panics
    /// If the header in front of `ptr` fails validation.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        let mut heap = self.heap.lock();
        self.ops(&mut heap).chunk_of(VirtualAddress::from_nonnull(ptr)).alloc_size() as usize
    }

    /// Result of the calling CPU's last allocation, cleared on read.
    pub fn errno(&self) -> i32 {
        self.cpus
            .with_this_cpu(&self.platform, |cpu| core::mem::take(&mut cpu.errno))
    }

    /// Pages the calling CPU's last failed mapping was short of, cleared on
    /// read.
    pub fn missing_donations(&self) -> u8 {
        self.cpus
            .with_this_cpu(&self.platform, |cpu| core::mem::take(&mut cpu.missing_donations))
    }

    /// Pages mapped into the heap.
    pub fn mapped_pages(&self) -> u64 {
        self.heap.with_lock(|heap| heap.mapped_pages)
    }

    /// Pages cached for `cpu`.
    pub fn memcache_pages(&self, cpu: usize) -> u64 {
        self.cpus.with(cpu, |state| state.memcache.nr_pages())
    }

    #[inline]
    fn online_cpus(&self) -> usize {
        self.platform.nr_cpus().min(NR_CPUS)
    }

    #[inline]
    fn ops<'a>(&'a self, heap: &'a mut Heap) -> HeapOps<'a, P, NR_CPUS> {
        HeapOps {
            heap,
            platform: &self.platform,
            cpus: &self.cpus,
        }
    }
}
