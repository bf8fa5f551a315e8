//! Backing of the private VA range with pages from the per-CPU memcache.

use crate::HypAllocError;
use crate::chunk_list::Heap;
use hyp_info::memory::{HypPageSize, MAX_MISSING_DONATIONS, PAGE_SHIFT, PAGE_SIZE};
use hyp_memory_addresses::VirtualAddress;
use hyp_mm::{HypPlatform, Memcache};
use hyp_sync::PerCpu;
use log::{trace, warn};

/// State each CPU keeps next to the shared heap.
#[derive(Debug, Default)]
pub(crate) struct CpuState {
    /// Result of the last allocation on this CPU, 0 or a negative errno.
    pub(crate) errno: i32,
    /// Pages the last failed mapping was short of.
    pub(crate) missing_donations: u8,
    /// Pages ready to be mapped into the heap.
    pub(crate) memcache: Memcache,
}

/// The heap, locked, together with everything needed to back it.
pub(crate) struct HeapOps<'a, P, const N: usize> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) platform: &'a P,
    pub(crate) cpus: &'a PerCpu<CpuState, N>,
}

impl<P: HypPlatform, const N: usize> HeapOps<'_, P, N> {
    /// Map `size` bytes at `va` with pages of the calling CPU's memcache.
    ///
    /// Either every page gets mapped or none: a memcache that cannot cover
    /// the whole range records the shortfall in `missing_donations` and
    /// fails without touching it, and a failing page mapping rolls back the
    /// pages installed so far.
    pub(crate) fn map(&mut self, va: VirtualAddress, size: u64) -> Result<(), HypAllocError> {
        if !va.is_aligned::<HypPageSize>() || !size.is_multiple_of(PAGE_SIZE) {
            return Err(HypAllocError::Invalid);
        }
        if !self.heap.contains(va, size) {
            return Err(HypAllocError::TooBig);
        }

        let nr_pages = size >> PAGE_SHIFT;
        let platform = self.platform;
        let result = self.cpus.with_this_cpu(platform, |cpu| {
            let available = cpu.memcache.nr_pages();
            if available < nr_pages {
                let missing = u8::try_from(nr_pages - available).unwrap_or(MAX_MISSING_DONATIONS);
                cpu.missing_donations = missing;
                warn!("hyp allocator: {missing} page(s) missing to map {size:#x} bytes at {va}");
                return Err(HypAllocError::NoMemory);
            }

            let mut mapped = 0;
            let mut result = Ok(());
            while mapped < nr_pages {
                let Some((pa, order)) = (unsafe { cpu.memcache.pop(platform) }) else {
                    result = Err(HypAllocError::NoMemory);
                    break;
                };
                debug_assert_eq!(order, 0, "memcache handed out a higher-order page");

                let page_va = va + (mapped << PAGE_SHIFT);
                if let Err(e) = platform.map_page(page_va, pa) {
                    unsafe { cpu.memcache.push(platform, pa, 0) };
                    result = Err(e.into());
                    break;
                }
                mapped += 1;
            }

            if result.is_err() && mapped > 0 {
                unmap_into(platform, &mut cpu.memcache, va, mapped << PAGE_SHIFT);
            }
            result.map(|()| mapped)
        });

        let mapped = result?;
        self.heap.mapped_pages += mapped;
        trace!("mapped {mapped} page(s) at {va}");
        Ok(())
    }

    /// Unmap `size` bytes at `va`, returning the pages to the calling
    /// CPU's memcache.
    pub(crate) fn unmap(&mut self, va: VirtualAddress, size: u64) {
        let platform = self.platform;
        self.cpus
            .with_this_cpu(platform, |cpu| unmap_into(platform, &mut cpu.memcache, va, size));
        self.heap.mapped_pages -= size >> PAGE_SHIFT;
        trace!("unmapped {} page(s) at {va}", size >> PAGE_SHIFT);
    }
}

/// Push every page backing `[va, va + size)` onto `mc`, then drop the
/// mappings.
fn unmap_into<P: HypPlatform>(platform: &P, mc: &mut Memcache, va: VirtualAddress, size: u64) {
    debug_assert!(va.is_aligned::<HypPageSize>());
    debug_assert!(size.is_multiple_of(PAGE_SIZE));

    let mut page_va = va;
    let end = va + size;
    while page_va < end {
        let Some(pa) = platform.private_range_pa(page_va) else {
            panic!("hyp allocator: {page_va} is accounted as mapped but has no backing page");
        };
        unsafe { mc.push(platform, pa, 0) };
        page_va += PAGE_SIZE;
    }

    platform.unmap_range(va, end);
}
