//! Best-fit allocation and coalescing free over the chunk list.

use crate::HypAllocError;
use crate::backing::HeapOps;
use crate::chunk::{CHUNK_HEADER_SIZE, Chunk, MIN_ALLOC, addr_fixup, chunk_size};
use crate::split::needs_mapping;
use hyp_info::memory::HypPageSize;
use hyp_memory_addresses::{VirtualAddress, page_align};
use hyp_mm::HypPlatform;
use log::{error, warn};

impl<P: HypPlatform, const N: usize> HeapOps<'_, P, N> {
    /// Map the start of the heap and install the first chunk there.
    fn setup_first_chunk(&mut self, size: u64) -> Result<Chunk, HypAllocError> {
        let start = self.heap.start();
        self.map(start, page_align::<HypPageSize>(chunk_size(size)))?;

        let chunk = unsafe { Chunk::at(start) };
        self.install(chunk, size, None)?;
        Ok(chunk)
    }

    /// Free chunk with the least room that still fits `size` bytes.
    fn find_free_chunk(&self, size: u64) -> Option<Chunk> {
        let needed = chunk_size(size);
        let mut best: Option<(Chunk, u64)> = None;

        for chunk in self.heap.iter() {
            if chunk.is_used() {
                continue;
            }

            let available = chunk.mapped_size() + self.heap.unmapped_size(chunk);
            if available < needed {
                continue;
            }
            if best.is_some_and(|(_, best_available)| best_available <= available) {
                continue;
            }
            best = Some((chunk, available));
        }

        best.map(|(chunk, _)| chunk)
    }

    /// Carve a chunk for `size` bytes (already rounded) out of the heap.
    pub(crate) fn alloc(&mut self, size: u64) -> Result<Chunk, HypAllocError> {
        let Some(last) = self.heap.last() else {
            return self.setup_first_chunk(size);
        };

        if let Some(chunk) = self.find_free_chunk(size) {
            self.recycle(chunk, size)?;
            return Ok(chunk);
        }

        let addr = addr_fixup(last.addr() + chunk_size(last.alloc_size()));
        let Some(footprint_end) = addr.checked_add(chunk_size(size)) else {
            return Err(HypAllocError::TooBig);
        };
        let missing = needs_mapping(last, footprint_end - last.data());
        if missing != 0 {
            self.inc_map(last, missing)?;
        }

        let chunk = unsafe { Chunk::at(addr) };
        self.install(chunk, size, Some(last))?;
        Ok(chunk)
    }

    /// Header of the chunk whose payload starts at `data`, validated.
    ///
    /// # Panics
    /// If `data` cannot be a payload of this heap, or its header was
    /// tampered with.
    pub(crate) fn chunk_of(&self, data: VirtualAddress) -> Chunk {
        let start = self.heap.start();
        let in_heap = data >= start + CHUNK_HEADER_SIZE
            && data < self.heap.end()
            && data.as_u64().is_multiple_of(MIN_ALLOC);
        if !in_heap {
            error!("hyp allocator: {data} is not a heap payload");
            panic!("hyp allocator: foreign pointer {data}");
        }

        let chunk = unsafe { Chunk::at(VirtualAddress::new(data.as_u64() - CHUNK_HEADER_SIZE)) };
        chunk.validate();
        chunk
    }

    /// Release the chunk at `data`, merging it with free neighbours.
    pub(crate) fn free(&mut self, data: VirtualAddress) {
        let chunk = self.chunk_of(data);
        if !chunk.is_used() {
            error!("hyp allocator: double free of {data}");
            panic!("hyp allocator: double free of {data}");
        }

        let prev = self.heap.prev(chunk);
        let next = self.heap.next(chunk);

        chunk.update(|h| h.alloc_size = 0);

        if let Some(next) = next
            && !next.is_used()
            && let Err(e) = self.merge(next)
        {
            warn!("hyp allocator: merging {} failed: {e}", next.addr());
        }

        if prev.is_some_and(|prev| !prev.is_used())
            && let Err(e) = self.merge(chunk)
        {
            warn!("hyp allocator: merging {} failed: {e}", chunk.addr());
        }
    }
}
