/// Failure of a page-table operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory")]
    NoMemory,
    #[error("mapping already exists")]
    Exists,
    #[error("invalid mapping request")]
    Invalid,
}

/// Failure of an ownership transfer between host and hypervisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DonationError {
    #[error("page frame {0:#x} is not owned by the donor")]
    NotOwned(u64),
    #[error("page frame {0:#x} is shared or pinned")]
    Busy(u64),
}

/// Failure to top up a memcache from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemcacheError {
    #[error("host memcache ran dry")]
    Empty,
    #[error("host page admission failed: {0}")]
    Donation(#[from] DonationError),
}
