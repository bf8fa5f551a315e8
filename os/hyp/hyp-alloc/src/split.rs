//! Splitting chunks, coalescing them, and growing or shrinking their mapping.

use crate::HypAllocError;
use crate::backing::HeapOps;
use crate::chunk::{CHUNK_HEADER_SIZE, Chunk, chunk_size};
use hyp_info::memory::{HypPageSize, PAGE_SIZE};
use hyp_memory_addresses::{VirtualAddress, align_down, page_align};
use hyp_mm::HypPlatform;
use log::{trace, warn};

/// Narrow a byte count that is bounded by the heap size.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn heap_u32(bytes: u64) -> u32 {
    debug_assert!(u32::try_from(bytes).is_ok(), "{bytes:#x} exceeds the heap");
    bytes as u32
}

/// Bytes of mapping `chunk` lacks to hold `size` payload bytes.
pub(crate) fn needs_mapping(chunk: Chunk, size: u64) -> u64 {
    let needed = chunk_size(size);
    let mapped = chunk.mapped_size();
    if needed <= mapped {
        0
    } else {
        page_align::<HypPageSize>(needed - mapped)
    }
}

impl<P: HypPlatform, const N: usize> HeapOps<'_, P, N> {
    /// Write a header at `new` carrying `size` payload bytes and link it.
    ///
    /// Without `prev`, `new` becomes the only chunk and owns the page-rounded
    /// footprint of `size`. Otherwise `new` must sit between the payload of
    /// `prev` and the end of its mapping; it takes over the part of that
    /// mapping from `new` onwards.
    pub(crate) fn install(&mut self, new: Chunk, size: u64, prev: Option<Chunk>) -> Result<(), HypAllocError> {
        let Some(prev) = prev else {
            if !self.heap.is_empty() {
                return Err(HypAllocError::Invalid);
            }
            let mapped = page_align::<HypPageSize>(chunk_size(size));
            new.write(heap_u32(size), heap_u32(mapped));
            self.heap.push_sole(new);
            trace!("installed first chunk at {} ({size} bytes)", new.addr());
            return Ok(());
        };

        if prev.unmapped_region() < new.addr() {
            return Err(HypAllocError::Invalid);
        }
        if prev.addr() + chunk_size(prev.alloc_size()) > new.addr() {
            return Err(HypAllocError::Invalid);
        }

        let prev_mapped = prev.mapped_size();
        let kept = new.addr() - prev.addr();
        prev.update(|h| h.mapped_size = heap_u32(kept));
        new.write(heap_u32(size), heap_u32(prev_mapped - kept));
        self.heap.insert_after(new, prev);
        trace!("installed chunk at {} after {} ({size} bytes)", new.addr(), prev.addr());
        Ok(())
    }

    /// Fold the free `chunk` into its free predecessor.
    ///
    /// A predecessor whose mapping stops short of `chunk` keeps the hole
    /// between them; the call then succeeds without merging.
    pub(crate) fn merge(&mut self, chunk: Chunk) -> Result<(), HypAllocError> {
        let Some(prev) = self.heap.prev_unchecked(chunk) else {
            warn!("hyp allocator: cannot merge first chunk {}", chunk.addr());
            return Err(HypAllocError::Invalid);
        };

        if chunk.is_used() || prev.is_used() {
            return Err(HypAllocError::Busy);
        }
        if prev.unmapped_region() != chunk.addr() {
            return Ok(());
        }

        let mapped = chunk.mapped_size();
        prev.update(|h| h.mapped_size += heap_u32(mapped));
        self.heap.remove(chunk);
        trace!("merged chunk at {} into {}", chunk.addr(), prev.addr());
        Ok(())
    }

    /// Cut `chunk` where its mapping enters the last page, so that its
    /// mapped tail ends on a page boundary.
    ///
    /// ```text
    ///  +--------------+
    ///  |______________|<- next chunk
    ///  |              |<- new chunk, page aligned
    ///  +--------------+
    ///  |              |<- reclaimable page
    ///  +--------------+
    ///  |______________|<- chunk
    ///  +--------------+
    /// ```
    pub(crate) fn split_aligned(&mut self, chunk: Chunk) -> Result<(), HypAllocError> {
        let end = self.heap.chunk_end(chunk);
        let mapped_end = chunk.unmapped_region();
        if mapped_end.is_aligned::<HypPageSize>() {
            return Ok(());
        }

        let new_addr = mapped_end.align_down::<HypPageSize>();
        if new_addr <= chunk.addr() {
            return Err(HypAllocError::Invalid);
        }
        if end - new_addr < chunk_size(0) {
            warn!("hyp allocator: chunk at {new_addr} would overlap its successor");
        }

        let new = unsafe { Chunk::at(new_addr) };
        self.install(new, 0, Some(chunk))
    }

    /// Grow the mapping of `chunk` by `size` bytes into its unmapped tail.
    pub(crate) fn inc_map(&mut self, chunk: Chunk, size: u64) -> Result<(), HypAllocError> {
        if self.heap.unmapped_size(chunk) < size {
            return Err(HypAllocError::Invalid);
        }

        self.map(chunk.unmapped_region(), size)?;
        chunk.update(|h| h.mapped_size += heap_u32(size));
        Ok(())
    }

    /// Unmap up to `target` bytes of whole pages past the payload of
    /// `chunk`, returning how many bytes were unmapped.
    pub(crate) fn dec_map(&mut self, chunk: Chunk, target: u64) -> u64 {
        let start = (chunk.addr() + chunk_size(chunk.alloc_size())).align_up::<HypPageSize>();
        let end = chunk.unmapped_region();
        if start >= end || end - start < PAGE_SIZE {
            return 0;
        }

        if self.split_aligned(chunk).is_err() {
            return 0;
        }

        let end = chunk.unmapped_region();
        let reclaimed = align_down((end - start).min(target), PAGE_SIZE);
        if reclaimed == 0 {
            return 0;
        }

        self.unmap(VirtualAddress::new(end.as_u64() - reclaimed), reclaimed);
        chunk.update(|h| h.mapped_size -= heap_u32(reclaimed));
        reclaimed
    }

    /// Whether a free chunk can be carved out of `chunk` at `addr`.
    ///
    /// The last chunk is never split: the space behind it is handed out by
    /// growing the tail anyway.
    pub(crate) fn can_split(&self, chunk: Chunk, addr: VirtualAddress) -> bool {
        if self.heap.is_last(chunk) {
            return false;
        }
        addr + chunk_size(0) < self.heap.chunk_end(chunk)
    }

    /// Hand the free `chunk` out for `size` bytes, carving a free chunk off
    /// its end when the remainder is worth keeping.
    ///
    /// A carved-off remainder that ends up contiguous with a free successor
    /// is folded into it.
    pub(crate) fn recycle(&mut self, chunk: Chunk, size: u64) -> Result<(), HypAllocError> {
        let new_addr = crate::chunk::addr_fixup(chunk.addr() + chunk_size(size));

        let (new, expected) = if self.can_split(chunk, new_addr) {
            let new = unsafe { Chunk::at(new_addr) };
            (Some(new), new_addr + CHUNK_HEADER_SIZE - chunk.data())
        } else {
            (None, size)
        };

        let missing = needs_mapping(chunk, expected);
        if missing != 0 {
            self.inc_map(chunk, missing)?;
        }

        chunk.update(|h| h.alloc_size = heap_u32(size));
        let Some(new) = new else {
            return Ok(());
        };
        if let Err(e) = self.install(new, 0, Some(chunk)) {
            warn!("hyp allocator: failed to split {} at {}: {e}", chunk.addr(), new.addr());
            return Ok(());
        }

        // Growing into a hole can leave the carved-off chunk touching a free
        // successor.
        if let Some(next) = self.heap.next(new)
            && !next.is_used()
            && let Err(e) = self.merge(next)
        {
            warn!("hyp allocator: merging {} failed: {e}", next.addr());
        }
        Ok(())
    }
}
