use crate::chunk::{Chunk, NIL};
use hyp_memory_addresses::VirtualAddress;

/// Heap geometry plus the address-ordered chunk list.
///
/// Links are stored as offsets from `start` so that a header stays
/// meaningful regardless of where the private range was placed.
#[derive(Debug)]
pub(crate) struct Heap {
    start: VirtualAddress,
    size: u64,
    first: u32,
    last: u32,
    /// Pages currently mapped into the range.
    pub(crate) mapped_pages: u64,
}

impl Heap {
    pub(crate) const fn new() -> Self {
        Self {
            start: VirtualAddress::zero(),
            size: 0,
            first: NIL,
            last: NIL,
            mapped_pages: 0,
        }
    }

    #[inline]
    pub(crate) const fn is_initialized(&self) -> bool {
        self.size != 0
    }

    pub(crate) const fn set_range(&mut self, start: VirtualAddress, size: u64) {
        self.start = start;
        self.size = size;
    }

    #[inline]
    pub(crate) const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    pub(crate) fn end(&self) -> VirtualAddress {
        self.start + self.size
    }

    /// Whether `[addr, addr + len)` lies inside the private range.
    pub(crate) fn contains(&self, addr: VirtualAddress, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.first == NIL
    }

    #[inline]
    fn chunk(&self, offset: u32) -> Option<Chunk> {
        (offset != NIL).then(|| unsafe { Chunk::at(self.start + u64::from(offset)) })
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn offset(&self, chunk: Chunk) -> u32 {
        // The range never exceeds u32::MAX bytes.
        (chunk.addr() - self.start) as u32
    }

    pub(crate) fn first(&self) -> Option<Chunk> {
        self.chunk(self.first).inspect(|c| c.validate())
    }

    pub(crate) fn last(&self) -> Option<Chunk> {
        self.chunk(self.last).inspect(|c| c.validate())
    }

    #[inline]
    pub(crate) fn is_first(&self, chunk: Chunk) -> bool {
        self.offset(chunk) == self.first
    }

    #[inline]
    pub(crate) fn is_last(&self, chunk: Chunk) -> bool {
        self.offset(chunk) == self.last
    }

    /// Successor of `chunk` without checking its seal.
    #[inline]
    fn next_unchecked(&self, chunk: Chunk) -> Option<Chunk> {
        self.chunk(chunk.header().node.next)
    }

    /// Predecessor of `chunk` without checking its seal.
    #[inline]
    pub(crate) fn prev_unchecked(&self, chunk: Chunk) -> Option<Chunk> {
        self.chunk(chunk.header().node.prev)
    }

    /// Successor of `chunk`, validated.
    pub(crate) fn next(&self, chunk: Chunk) -> Option<Chunk> {
        self.next_unchecked(chunk).inspect(|c| c.validate())
    }

    /// Predecessor of `chunk`, validated.
    pub(crate) fn prev(&self, chunk: Chunk) -> Option<Chunk> {
        self.prev_unchecked(chunk).inspect(|c| c.validate())
    }

    /// Address where the chunk's range ends: its successor or the heap end.
    pub(crate) fn chunk_end(&self, chunk: Chunk) -> VirtualAddress {
        self.next(chunk).map_or_else(|| self.end(), Chunk::addr)
    }

    /// Bytes between the mapped part of `chunk` and the chunk's end.
    pub(crate) fn unmapped_size(&self, chunk: Chunk) -> u64 {
        self.chunk_end(chunk) - chunk.unmapped_region()
    }

    /// Make `chunk` the only element of an empty list.
    pub(crate) fn push_sole(&mut self, chunk: Chunk) {
        debug_assert!(self.is_empty());
        chunk.update(|h| {
            h.node.next = NIL;
            h.node.prev = NIL;
        });
        let off = self.offset(chunk);
        self.first = off;
        self.last = off;
    }

    /// Link `new` right behind `prev`.
    pub(crate) fn insert_after(&mut self, new: Chunk, prev: Chunk) {
        let new_off = self.offset(new);
        let prev_off = self.offset(prev);
        let next_off = prev.header().node.next;

        new.update(|h| {
            h.node.prev = prev_off;
            h.node.next = next_off;
        });
        prev.update(|h| h.node.next = new_off);
        match self.chunk(next_off) {
            Some(next) => next.update(|h| h.node.prev = new_off),
            None => self.last = new_off,
        }
    }

    /// Unlink `chunk`, re-sealing its neighbours.
    pub(crate) fn remove(&mut self, chunk: Chunk) {
        let node = chunk.header().node;
        match self.chunk(node.prev) {
            Some(prev) => prev.update(|h| h.node.next = node.next),
            None => self.first = node.next,
        }
        match self.chunk(node.next) {
            Some(next) => next.update(|h| h.node.prev = node.prev),
            None => self.last = node.prev,
        }
    }

    /// Iterate the list in address order, validating every header.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Chunk> + '_ {
        core::iter::successors(self.first(), move |&c| self.next(c))
    }
}
