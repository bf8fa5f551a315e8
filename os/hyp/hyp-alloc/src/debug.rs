//! Introspection of the chunk list.

use crate::HypAllocator;
use hyp_memory_addresses::VirtualAddress;
use hyp_mm::HypPlatform;
use log::debug;

/// Snapshot of one chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Address of the header.
    pub addr: VirtualAddress,
    /// Payload bytes in use, zero if free.
    pub alloc_size: u32,
    /// Bytes mapped from `addr` onwards.
    pub mapped_size: u32,
    /// Bytes between the mapping and the next chunk (or heap end).
    pub unmapped_size: u64,
}

impl ChunkInfo {
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.alloc_size == 0
    }

    /// First byte past the chunk's range.
    #[inline]
    #[must_use]
    pub fn end(&self) -> VirtualAddress {
        self.addr + u64::from(self.mapped_size) + self.unmapped_size
    }
}

impl<P: HypPlatform, const NR_CPUS: usize> HypAllocator<P, NR_CPUS> {
    /// Visit every chunk in address order, validating each header.
    ///
    /// The heap lock is held across the walk; `f` must not call back into
    /// the allocator.
    pub fn walk(&self, mut f: impl FnMut(&ChunkInfo)) {
        let heap = self.heap.lock();
        for chunk in heap.iter() {
            let hdr = chunk.header();
            f(&ChunkInfo {
                addr: chunk.addr(),
                alloc_size: hdr.alloc_size,
                mapped_size: hdr.mapped_size,
                unmapped_size: heap.unmapped_size(chunk),
            });
        }
    }

    /// Log the chunk list at debug level.
    pub fn dump(&self) {
        debug!(
            "hyp allocator: {} page(s) mapped, {} reclaimable",
            self.mapped_pages(),
            self.reclaimable()
        );
        self.walk(|c| {
            debug!(
                "  {}: {} {:#x} bytes, mapped {:#x}, unmapped {:#x}",
                c.addr,
                if c.is_free() { "free" } else { "used" },
                c.alloc_size,
                c.mapped_size,
                c.unmapped_size
            );
        });
    }
}
