//! Giving pages back to the host.
//!
//! Reclaim first empties the per-CPU memcaches, then walks the chunks from
//! the heap end towards the start. Each free chunk that can vanish without
//! leaving an untracked hole is destroyed; every other chunk has the whole
//! pages past its payload unmapped. Whatever was unmapped lands in the
//! calling CPU's memcache and is handed over from there.

use crate::backing::HeapOps;
use crate::chunk::{Chunk, chunk_size};
use crate::{HypAllocError, HypAllocator};
use hyp_info::memory::{HypPageSize, PAGE_SHIFT, PAGE_SIZE};
use hyp_memory_addresses::PhysicalAddress;
use hyp_mm::{HypPlatform, Memcache};
use log::{debug, trace, warn};

impl<P: HypPlatform, const N: usize> HeapOps<'_, P, N> {
    /// Whether `chunk` could be dropped from the list entirely.
    ///
    /// The first chunk only goes when it is the last one standing; any other
    /// chunk needs a free predecessor to inherit the hole it leaves.
    fn destroyable(&self, chunk: Chunk) -> bool {
        if chunk.is_used() || !chunk.is_page_aligned() {
            return false;
        }
        if self.heap.is_first(chunk) {
            return self.heap.is_last(chunk);
        }
        self.heap.prev(chunk).is_some_and(|prev| !prev.is_used())
    }

    /// Upper bound of the bytes reclaim could take from `chunk`.
    fn chunk_reclaimable(&self, chunk: Chunk) -> u64 {
        let end = chunk.unmapped_region().align_down::<HypPageSize>();
        let start = if self.destroyable(chunk) {
            chunk.addr()
        } else {
            (chunk.addr() + chunk_size(chunk.alloc_size())).align_up::<HypPageSize>()
        };

        if start > end { 0 } else { end - start }
    }

    /// Drop the free `chunk` if its whole mapping fits in `target` bytes,
    /// returning how many bytes were unmapped.
    fn try_destroy(&mut self, chunk: Chunk, target: u64) -> u64 {
        if chunk.is_used() || chunk.mapped_size() > target {
            return 0;
        }

        if self.heap.is_first(chunk) {
            if !self.heap.is_last(chunk) {
                return 0;
            }
        } else {
            if !chunk.is_page_aligned() {
                return 0;
            }
            // The last chunk leaves no hole behind; others hand their range
            // to a free predecessor and keep a page-aligned remainder.
            if !self.heap.is_last(chunk) {
                if self.heap.prev(chunk).is_none_or(Chunk::is_used) {
                    return 0;
                }
                if self.split_aligned(chunk).is_err() {
                    return 0;
                }
            }
        }

        let mapped = chunk.mapped_size();
        self.heap.remove(chunk);
        self.unmap(chunk.addr(), mapped);
        trace!("destroyed chunk at {} ({mapped:#x} bytes)", chunk.addr());
        mapped
    }

    /// Unmap up to `target_pages` pages from the chunks, last chunk first.
    fn reclaim_chunks(&mut self, target_pages: u64) -> u64 {
        let mut remaining = target_pages;
        let mut cursor = self.heap.last();

        while let Some(chunk) = cursor {
            let prev = self.heap.prev_unchecked(chunk);
            let target = remaining.saturating_mul(PAGE_SIZE);

            let mut unmapped = self.try_destroy(chunk, target);
            if unmapped == 0 {
                unmapped = self.dec_map(chunk, target);
            }

            remaining = remaining.saturating_sub(unmapped >> PAGE_SHIFT);
            if remaining == 0 {
                break;
            }

            cursor = prev.inspect(|c| c.validate());
        }

        target_pages - remaining
    }
}

/// Scrub the page at `pa` and hand it to the host through `host_mc`.
#[allow(clippy::cast_possible_truncation)]
fn return_to_host<P: HypPlatform>(platform: &P, host_mc: &mut Memcache, pa: PhysicalAddress, order: u16) {
    debug_assert_eq!(order, 0, "memcache held a higher-order page");

    let va = platform.phys_to_virt(pa);
    unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
    platform.flush_dcache_to_poc(va, PAGE_SIZE);
    unsafe { host_mc.push(platform, pa, 0) };

    if let Err(e) = platform.hyp_donate_host(pa.pfn::<HypPageSize>(), 1) {
        warn!("hyp allocator: donating {pa} back to the host failed: {e}");
    }
}

impl<P: HypPlatform, const NR_CPUS: usize> HypAllocator<P, NR_CPUS> {
    /// Pages [`reclaim`](Self::reclaim) could give back at most.
    ///
    /// Holes that only a tail-first reclaim can close are not counted, so
    /// the estimate can be lower than what a reclaim achieves; it is never
    /// lower than the cached pages.
    pub fn reclaimable(&self) -> u64 {
        let mut heap = self.heap.lock();
        let ops = self.ops(&mut heap);

        let in_chunks: u64 = ops
            .heap
            .iter()
            .map(|chunk| ops.chunk_reclaimable(chunk) >> PAGE_SHIFT)
            .sum();
        let cached: u64 = self
            .cpus
            .iter_online(self.online_cpus())
            .map(|slot| slot.lock().memcache.nr_pages())
            .sum();

        in_chunks + cached
    }

    /// Give up to `target` pages back to the host, pushing each onto
    /// `host_mc` after scrubbing it.
    ///
    /// Returns the number of pages handed over.
    ///
    /// # Safety
    /// `host_mc` must be a valid memcache reachable through the platform's
    /// [`PhysMapper`](hyp_mm::PhysMapper).
    pub unsafe fn reclaim(&self, host_mc: &mut Memcache, target: u64) -> u64 {
        if target == 0 {
            return 0;
        }

        let mut heap = self.heap.lock();
        let platform = &self.platform;
        let mut donated = 0;

        'drain: for slot in self.cpus.iter_online(self.online_cpus()) {
            let mut cpu = slot.lock();
            while let Some((pa, order)) = unsafe { cpu.memcache.pop(platform) } {
                return_to_host(platform, host_mc, pa, order);
                donated += 1;
                if donated == target {
                    break 'drain;
                }
            }
        }

        if donated < target {
            let unmapped = self.ops(&mut heap).reclaim_chunks(target - donated);
            trace!("unmapped {unmapped} page(s) from the chunks");

            self.cpus.with_this_cpu(platform, |cpu| {
                while let Some((pa, order)) = unsafe { cpu.memcache.pop(platform) } {
                    return_to_host(platform, host_mc, pa, order);
                    donated += 1;
                }
            });
        }

        debug!("hyp allocator: reclaimed {donated} of {target} page(s)");
        donated
    }

    /// Move every page of `host_mc` into the calling CPU's memcache.
    ///
    /// Pages admitted before a failure stay admitted.
    ///
    /// # Errors
    /// - [`HypAllocError::NoMemory`] if `host_mc` holds fewer pages than it
    ///   claims.
    /// - [`HypAllocError::Donation`] if the host no longer owns a page.
    ///
    /// # Safety
    /// `host_mc` must be a valid memcache reachable through the platform's
    /// [`PhysMapper`](hyp_mm::PhysMapper).
    pub unsafe fn refill(&self, host_mc: &mut Memcache) -> Result<(), HypAllocError> {
        let platform = &self.platform;
        self.cpus.with_this_cpu(platform, |cpu| {
            let watermark = host_mc.nr_pages() + cpu.memcache.nr_pages();
            unsafe { cpu.memcache.topup_from_host(watermark, host_mc, platform) }
        })?;
        Ok(())
    }
}
