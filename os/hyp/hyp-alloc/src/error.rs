use hyp_mm::{DonationError, MapError, MemcacheError};

const EPERM: i32 = 1;
const E2BIG: i32 = 7;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;
const EINVAL: i32 = 22;

/// Recoverable allocator failures.
///
/// Header corruption is not among them: it halts the hypervisor instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HypAllocError {
    #[error("invalid argument")]
    Invalid,
    #[error("out of memory, the memcache needs more donated pages")]
    NoMemory,
    #[error("range exceeds the heap")]
    TooBig,
    #[error("chunk is in use")]
    Busy,
    #[error("page mapping failed: {0}")]
    Map(MapError),
    #[error("page ownership transfer failed: {0}")]
    Donation(#[from] DonationError),
}

impl HypAllocError {
    /// Negative errno as stored in the per-CPU error slot.
    #[must_use]
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::Invalid | Self::Map(MapError::Invalid) => -EINVAL,
            Self::NoMemory | Self::Map(MapError::NoMemory) => -ENOMEM,
            Self::TooBig => -E2BIG,
            Self::Busy => -EBUSY,
            Self::Map(MapError::Exists) => -EEXIST,
            Self::Donation(_) => -EPERM,
        }
    }
}

impl From<MapError> for HypAllocError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::NoMemory => Self::NoMemory,
            other => Self::Map(other),
        }
    }
}

impl From<MemcacheError> for HypAllocError {
    fn from(value: MemcacheError) -> Self {
        match value {
            MemcacheError::Empty => Self::NoMemory,
            MemcacheError::Donation(e) => Self::Donation(e),
        }
    }
}
