use hyp_info::memory::{HYP_ALLOC_MIN_ALLOC, HypPageSize, PAGE_SIZE};
use hyp_memory_addresses::{VirtualAddress, align_up};
use log::error;

/// Link value meaning "no neighbour".
pub(crate) const NIL: u32 = u32::MAX;

/// Intrusive list links of a chunk, as byte offsets from the heap start.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ListNode {
    pub(crate) next: u32,
    pub(crate) prev: u32,
}

/// Header stored in-band at the start of every chunk.
///
/// ```text
/// +------------+-------------+-----------+-----------+------+-----+------------------+
/// | alloc_size | mapped_size | node.next | node.prev | hash | pad | payload ...      |
/// +------------+-------------+-----------+-----------+------+-----+------------------+
/// ^ chunk                                                         ^ chunk + CHUNK_HEADER_SIZE
/// ```
///
/// `hash` covers every byte before it and is refreshed after each
/// legitimate update.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct ChunkHeader {
    /// Payload bytes in use; zero marks the chunk free.
    pub(crate) alloc_size: u32,
    /// Bytes mapped from the chunk address onwards.
    pub(crate) mapped_size: u32,
    pub(crate) node: ListNode,
    pub(crate) hash: u32,
    _pad: u32,
}

/// Bytes between a chunk and its payload.
pub const CHUNK_HEADER_SIZE: u64 = size_of::<ChunkHeader>() as u64;

/// Smallest payload a chunk reserves, also the payload alignment.
pub const MIN_ALLOC: u64 = HYP_ALLOC_MIN_ALLOC;

const _: () = {
    assert!(MIN_ALLOC >= align_of::<ListNode>() as u64);
    assert!(MIN_ALLOC >= align_of::<ChunkHeader>() as u64);
    assert!(CHUNK_HEADER_SIZE.is_multiple_of(MIN_ALLOC));
    assert!(CHUNK_HEADER_SIZE + MIN_ALLOC < PAGE_SIZE);
};

/// Footprint of a chunk carrying `size` payload bytes.
#[inline]
#[must_use]
pub const fn chunk_size(size: u64) -> u64 {
    let payload = if size > MIN_ALLOC { size } else { MIN_ALLOC };
    CHUNK_HEADER_SIZE + payload
}

/// Round a request up to the payload granule.
#[inline]
pub(crate) const fn payload_size(size: u64) -> u64 {
    align_up(size, MIN_ALLOC)
}

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

/// Multiplicative hash of `val` down to 32 bits.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn hash_64(val: u64) -> u32 {
    (val.wrapping_mul(GOLDEN_RATIO_64) >> 32) as u32
}

impl ChunkHeader {
    pub(crate) const fn new(alloc_size: u32, mapped_size: u32) -> Self {
        Self {
            alloc_size,
            mapped_size,
            node: ListNode {
                next: NIL,
                prev: NIL,
            },
            hash: 0,
            _pad: 0,
        }
    }

    /// XOR of the hashes of the 64-bit words in front of `hash`.
    pub(crate) fn compute_hash(&self) -> u32 {
        let sizes = u64::from(self.alloc_size) | u64::from(self.mapped_size) << 32;
        let links = u64::from(self.node.next) | u64::from(self.node.prev) << 32;
        hash_64(sizes) ^ hash_64(links)
    }
}

/// Handle on a chunk header inside the heap.
///
/// Only constructed for addresses whose header is mapped, while the heap
/// lock is held, which is what makes the accessors below sound.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Chunk(VirtualAddress);

impl Chunk {
    /// # Safety
    /// `addr` must be 8-byte aligned and the header at `addr` mapped and
    /// owned by the heap for as long as the handle is used.
    #[inline]
    pub(crate) const unsafe fn at(addr: VirtualAddress) -> Self {
        Self(addr)
    }

    #[inline]
    pub(crate) const fn addr(self) -> VirtualAddress {
        self.0
    }

    /// First payload byte.
    #[inline]
    pub(crate) fn data(self) -> VirtualAddress {
        self.0 + CHUNK_HEADER_SIZE
    }

    #[inline]
    pub(crate) fn header(self) -> ChunkHeader {
        unsafe { self.0.as_mut_ptr::<ChunkHeader>().read() }
    }

    /// Apply `f` to the header and re-seal it.
    #[inline]
    pub(crate) fn update(self, f: impl FnOnce(&mut ChunkHeader)) {
        let hdr = self.0.as_mut_ptr::<ChunkHeader>();
        unsafe {
            f(&mut *hdr);
            (*hdr).hash = (*hdr).compute_hash();
        }
    }

    /// Write a fresh header, links unset.
    pub(crate) fn write(self, alloc_size: u32, mapped_size: u32) {
        let mut hdr = ChunkHeader::new(alloc_size, mapped_size);
        hdr.hash = hdr.compute_hash();
        unsafe { self.0.as_mut_ptr::<ChunkHeader>().write(hdr) };
    }

    /// Check the header seal, halting on mismatch.
    ///
    /// # Panics
    /// If the header was modified outside the allocator.
    #[inline]
    pub(crate) fn validate(self) {
        let hdr = self.header();
        let expected = hdr.compute_hash();
        if hdr.hash != expected {
            error!(
                "chunk header at {} corrupted: hash {:#010x}, expected {expected:#010x}",
                self.0, hdr.hash
            );
            panic!("hyp allocator: corrupted chunk header at {}", self.0);
        }
    }

    #[inline]
    pub(crate) fn alloc_size(self) -> u64 {
        u64::from(self.header().alloc_size)
    }

    #[inline]
    pub(crate) fn mapped_size(self) -> u64 {
        u64::from(self.header().mapped_size)
    }

    #[inline]
    pub(crate) fn is_used(self) -> bool {
        self.header().alloc_size != 0
    }

    /// First byte past the mapped part of the chunk.
    #[inline]
    pub(crate) fn unmapped_region(self) -> VirtualAddress {
        self.0 + self.mapped_size()
    }

    #[inline]
    pub(crate) const fn is_page_aligned(self) -> bool {
        self.0.is_aligned::<HypPageSize>()
    }
}

/// Shift `addr` off a page boundary so a chunk placed there does not share
/// its first page with nothing but a header.
///
/// Chunks closer than one header plus [`MIN_ALLOC`] above a page boundary
/// are moved up to exactly that distance; page-aligned addresses stay.
#[inline]
pub(crate) const fn addr_fixup(addr: VirtualAddress) -> VirtualAddress {
    let offset = addr.offset::<HypPageSize>();
    let min = chunk_size(0);
    if offset != 0 && offset < min {
        VirtualAddress::new(addr.align_down::<HypPageSize>().as_u64() + min)
    } else {
        addr
    }
}
