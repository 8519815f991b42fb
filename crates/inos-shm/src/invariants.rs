//! Debug assertion macros for the transport's hot-path invariants.
//!
//! Active only in debug builds; zero overhead in release.

/// Sequence counters advance in whole frames, so every frame start (and
/// therefore every length word) stays 4-byte aligned.
macro_rules! debug_assert_frame_aligned {
    ($seq:expr) => {
        debug_assert!(
            $seq % 4 == 0,
            "frame sequence {} is not word-aligned",
            $seq
        )
    };
}

/// Ring occupancy never exceeds data capacity.
macro_rules! debug_assert_occupancy_bounded {
    ($used:expr, $cap:expr) => {
        debug_assert!(
            $used <= $cap,
            "ring occupancy {} exceeds data capacity {}",
            $used,
            $cap
        )
    };
}

/// A committed length word always fits its frame inside the ring.
macro_rules! debug_assert_committed_len {
    ($len:expr, $cap:expr) => {
        debug_assert!(
            $len as u64 + 4 <= $cap as u64,
            "committed length {} cannot fit data capacity {}",
            $len,
            $cap
        )
    };
}

pub(crate) use debug_assert_committed_len;
pub(crate) use debug_assert_frame_aligned;
pub(crate) use debug_assert_occupancy_bounded;
