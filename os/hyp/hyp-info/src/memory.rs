//! # Memory Layout

use hyp_memory_addresses::{PageSize, Size4K};

/// Translation granule used for every hypervisor mapping.
pub type HypPageSize = Size4K;

/// Size in bytes of one hypervisor page.
pub const PAGE_SIZE: u64 = HypPageSize::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = HypPageSize::SHIFT;

/// Upper bound on the number of CPUs the hypervisor brings up.
pub const MAX_CPUS: usize = 8;

/// Smallest payload handed out by the dynamic allocator, in bytes.
///
/// Every request is rounded up to a multiple of this value, which also
/// fixes the alignment of returned pointers.
pub const HYP_ALLOC_MIN_ALLOC: u64 = 8;

/// Granule of the pages the host donates when asked for memory.
pub const HOST_REQUEST_PAGE_SIZE: u64 = PAGE_SIZE;

/// A page count the per-CPU missing-donations byte can express.
pub const MAX_MISSING_DONATIONS: u8 = u8::MAX;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(HYP_ALLOC_MIN_ALLOC.is_power_of_two());
    assert!(HYP_ALLOC_MIN_ALLOC < PAGE_SIZE);
    assert!(HOST_REQUEST_PAGE_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(MAX_CPUS > 0);
};
