use crate::layout::{RegionId, Role};
use thiserror::Error;

/// Errors raised by shared-region accessors and the arena allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShmError {
    /// An offset/size pair escapes the buffer (or its declared region).
    #[error("range {offset:#x}+{len} escapes bounds (capacity {capacity:#x})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    /// An atomic word view was requested at an unaligned offset.
    #[error("offset {offset:#x} is not {align}-byte aligned")]
    Misaligned { offset: usize, align: usize },

    /// A fixed-ceiling resource (arena, account table) is exhausted.
    #[error("capacity exhausted: requested {requested}, {remaining} remaining")]
    CapacityExhausted { requested: usize, remaining: usize },
}

/// Back-pressure signals from the ring transport.
///
/// `Full` is transient — the caller owns the retry policy. `Oversize` is a
/// permanent rejection for the given payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Not enough free space for the frame right now.
    #[error("ring is full")]
    Full,

    /// The payload can never fit this ring's data capacity.
    #[error("payload of {len} bytes exceeds ring data capacity {capacity}")]
    Oversize { len: usize, capacity: usize },
}

impl RingError {
    /// Returns `true` if the caller can retry later (congestion, not misuse).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Region-guard policy rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The role is not permitted to perform this access on the region.
    #[error("role {role:?} denied access to region {region:?}")]
    PolicyViolation { region: RegionId, role: Role },

    /// A single-writer region is already locked by another owner tag.
    #[error("region {region:?} is locked by owner tag {holder:#x}")]
    Locked { region: RegionId, holder: u32 },

    /// A write guard was released without its declared epoch advancing.
    #[error("region {region:?} released without advancing its epoch")]
    EpochNotAdvanced { region: RegionId },
}
