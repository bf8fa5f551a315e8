//! `GlobalAlloc` on top of the hypervisor heap.

use crate::HypAllocator;
use crate::chunk::MIN_ALLOC;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use hyp_mm::HypPlatform;

/// Payloads are aligned to [`MIN_ALLOC`] and nothing more; stricter layouts
/// are refused with a null pointer.
unsafe impl<P: HypPlatform + Sync, const NR_CPUS: usize> GlobalAlloc for HypAllocator<P, NR_CPUS> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() as u64 > MIN_ALLOC {
            return ptr::null_mut();
        }
        HypAllocator::alloc(self, layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free(ptr) };
        }
    }

    /// Allocations come back zeroed already.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { GlobalAlloc::alloc(self, layout) }
    }
}
