//! Per-VM accounting of hypervisor heap usage.

use crate::HypAllocator;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use hyp_mm::HypPlatform;

/// Host-visible memory statistics of one VM.
#[derive(Debug, Default)]
pub struct VmMemStat {
    protected_hyp_mem: AtomicU64,
}

impl VmMemStat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            protected_hyp_mem: AtomicU64::new(0),
        }
    }

    /// Heap bytes currently charged to the VM.
    #[inline]
    pub fn protected_hyp_mem(&self) -> u64 {
        self.protected_hyp_mem.load(Ordering::Relaxed)
    }
}

impl<P: HypPlatform, const NR_CPUS: usize> HypAllocator<P, NR_CPUS> {
    /// [`alloc`](Self::alloc), charging the allocated size to `stat`.
    pub fn alloc_account(&self, size: usize, stat: &VmMemStat) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        let charged = unsafe { self.alloc_size(ptr) };
        stat.protected_hyp_mem.fetch_add(charged as u64, Ordering::Relaxed);
        Some(ptr)
    }

    /// [`free`](Self::free), refunding the allocated size to `stat`.
    ///
    /// # Safety
    /// As for [`free`](Self::free); `ptr` must have been charged to `stat`.
    pub unsafe fn free_account(&self, ptr: NonNull<u8>, stat: &VmMemStat) {
        let charged = unsafe { self.alloc_size(ptr) };
        unsafe { self.free(ptr) };
        stat.protected_hyp_mem.fetch_sub(charged as u64, Ordering::Relaxed);
    }
}
