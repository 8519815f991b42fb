use crate::config::ShmConfig;
use crate::error::RingError;
use crate::flags::EpochFlags;
use crate::invariants::{
    debug_assert_committed_len, debug_assert_frame_aligned, debug_assert_occupancy_bounded,
};
use crate::layout::{RegionId, RING_HEADER_SIZE, RINGS};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::region::SharedRegion;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// FRAME & SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// Each ring occupies a declared region: an 8-byte header `(head, tail)`
// followed by a payload arena of `data_capacity` bytes. A message is a
// 4-byte little-endian length word plus `length` payload bytes, and every
// frame is rounded up to a 4-byte boundary so length words are naturally
// aligned atomic u32 views. Payload bytes may wrap around the arena end; a
// length word never does.
//
// ## Sequence counters
//
// `head` and `tail` are monotone byte sequence counters, not wrapped byte
// indices. They wrap at the largest multiple of `data_capacity` that fits in
// u32, so `tail - head` (modular) is the exact occupancy: a completely full
// ring is representable and `head == tail` means empty, with no slack byte
// and no ABA on the emptiness check. Byte position is `seq % data_capacity`.
//
// ## Producers
//
// 1. Check free space, claim a frame by CAS on `tail` (AcqRel).
// 2. Write the payload bytes into the claimed span.
// 3. Commit by storing the length word last (Release). A racing consumer
//    that observes `tail` advanced but the length still zero sees a
//    reservation in progress, never a partial payload.
// 4. Signal the paired dirty flag (which also beats the master heartbeat).
//
// ## Consumers
//
// The length word doubles as the claim token: committed frames carry a
// non-zero length, free or in-flight bytes are zero. A consumer claims the
// frame at `head` by CAS-ing its length word back to zero (AcqRel), copies
// the payload out, re-zeroes the payload span, and only then advances `head`
// (Release). Producers compute free space from `head`, so a claimed frame
// cannot be reused before its claimant finishes.
//
// ## The free-span-is-zero invariant
//
// Every byte in `[tail, head)` (the free span) is zero: the region starts
// zeroed, claims zero the length word, and claimants re-zero the payload
// span before releasing it. A producer's freshly claimed frame therefore
// always starts with a zero length word — the transient zero-length probe
// consumers rely on is never confused by stale bytes from a previous lap.
// =============================================================================

/// Rounds a payload length up to a whole number of 4-byte words.
#[inline]
const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Retry pacing for lost frame claims.
///
/// A lost tail CAS or length-word CAS means a sibling won the frame in the
/// same instant; the winner's remaining work before the header moves again
/// is a bounded payload copy plus one Release store. A few doubling rounds
/// of PAUSE cover that window; contention that outlives the spin budget
/// yields the thread instead of burning the core.
struct ClaimRetry {
    attempt: u32,
}

impl ClaimRetry {
    /// 1+2+4+8+16 PAUSEs before the first yield — sized to a frame commit,
    /// not to a generic critical section.
    const SPIN_ROUNDS: u32 = 5;

    #[inline]
    fn new() -> Self {
        Self { attempt: 0 }
    }

    #[inline]
    fn pause(&mut self) {
        if self.attempt < Self::SPIN_ROUNDS {
            for _ in 0..(1u32 << self.attempt) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        self.attempt += 1;
    }
}

/// Lock-free MPMC length-prefixed byte ring inside a shared region.
pub struct RingBuffer {
    shm: Arc<SharedRegion>,
    flags: Arc<EpochFlags>,
    region: RegionId,
    /// Byte offset of the ring header inside the buffer.
    base: usize,
    /// Payload arena capacity in bytes (multiple of 4).
    cap: u32,
    /// Sequence counters wrap here: the largest multiple of `cap` in u32.
    modulus: u32,
    dirty_idx: u32,
    enable_metrics: bool,
    metrics: TransportMetrics,
}

impl RingBuffer {
    /// Builds a ring over an arbitrary `(offset, size)` span.
    ///
    /// # Panics
    ///
    /// Panics on structural invariant violations: misaligned offset, span
    /// outside the buffer, or a data capacity that is too small or not a
    /// multiple of 4.
    pub fn new(
        shm: Arc<SharedRegion>,
        flags: Arc<EpochFlags>,
        region: RegionId,
        offset: usize,
        size: usize,
        dirty_idx: u32,
        enable_metrics: bool,
    ) -> Self {
        assert!(offset % 4 == 0, "ring header must be word-aligned");
        assert!(size > RING_HEADER_SIZE, "ring region smaller than its header");
        shm.check_range(offset, size).expect("ring region escapes the buffer");

        let data = size - RING_HEADER_SIZE;
        assert!(data % 4 == 0, "ring data capacity must be a multiple of 4");
        assert!(data >= 8, "ring data capacity too small for any frame");
        let cap = u32::try_from(data).expect("ring data capacity exceeds u32");

        let modulus = (u32::MAX / cap) * cap;
        assert!(modulus >= cap * 2, "sequence space too small for capacity");

        Self {
            shm,
            flags,
            region,
            base: offset,
            cap,
            modulus,
            dirty_idx,
            enable_metrics,
            metrics: TransportMetrics::new(),
        }
    }

    /// Builds the ring declared for `region` in the layout catalogue.
    ///
    /// # Panics
    ///
    /// Panics if `region` is not one of the declared ring regions.
    pub fn for_region(
        shm: Arc<SharedRegion>,
        flags: Arc<EpochFlags>,
        region: RegionId,
        config: &ShmConfig,
    ) -> Self {
        let (_, dirty_idx) = RINGS
            .iter()
            .copied()
            .find(|(id, _)| *id == region)
            .unwrap_or_else(|| panic!("region {region:?} is not a declared ring"));
        let spec = crate::layout::spec(region);
        let (offset, size) = spec.extent(shm.capacity());
        Self::new(shm, flags, region, offset, size, dirty_idx, config.enable_metrics)
    }

    /// Payload arena capacity in bytes.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.cap as usize
    }

    /// Largest payload this ring can ever carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.cap as usize - 4
    }

    /// The region this ring lives in.
    #[inline]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// The dirty-flag index signalled on every commit.
    #[inline]
    pub fn dirty_idx(&self) -> u32 {
        self.dirty_idx
    }

    #[inline]
    fn head_word(&self) -> &AtomicU32 {
        self.shm
            .atomic_u32(self.base)
            .expect("ring header validated at construction")
    }

    #[inline]
    fn tail_word(&self) -> &AtomicU32 {
        self.shm
            .atomic_u32(self.base + 4)
            .expect("ring header validated at construction")
    }

    /// Advances a sequence counter by `n` bytes (modular).
    #[inline]
    fn seq_add(&self, seq: u32, n: u32) -> u32 {
        ((u64::from(seq) + u64::from(n)) % u64::from(self.modulus)) as u32
    }

    /// Modular distance from `head` to `tail` — the exact occupancy.
    #[inline]
    fn occupancy(&self, head: u32, tail: u32) -> u32 {
        ((u64::from(tail) + u64::from(self.modulus) - u64::from(head))
            % u64::from(self.modulus)) as u32
    }

    /// Byte position of a sequence inside the payload arena. Valid because
    /// the wrap modulus is a multiple of the capacity.
    #[inline]
    fn pos(&self, seq: u32) -> usize {
        (seq % self.cap) as usize
    }

    #[inline]
    fn data_offset(&self, pos: usize) -> usize {
        self.base + RING_HEADER_SIZE + pos
    }

    /// The length word of the frame starting at `seq`.
    #[inline]
    fn len_word(&self, seq: u32) -> &AtomicU32 {
        debug_assert_frame_aligned!(seq);
        self.shm
            .atomic_u32(self.data_offset(self.pos(seq)))
            .expect("frame position within ring arena")
    }

    /// Copies `src` into the arena starting at `pos`, wrapping at the end.
    fn write_wrapped(&self, pos: usize, src: &[u8]) {
        let first = src.len().min(self.cap as usize - pos);
        self.shm
            .write_bytes(self.data_offset(pos), &src[..first])
            .expect("claimed frame within ring arena");
        if first < src.len() {
            self.shm
                .write_bytes(self.data_offset(0), &src[first..])
                .expect("claimed frame within ring arena");
        }
    }

    /// Copies `out.len()` bytes out of the arena starting at `pos`.
    fn read_wrapped(&self, pos: usize, out: &mut [u8]) {
        let first = out.len().min(self.cap as usize - pos);
        self.shm
            .read_into(self.data_offset(pos), &mut out[..first])
            .expect("claimed frame within ring arena");
        if first < out.len() {
            let rest = out.len() - first;
            self.shm
                .read_into(self.data_offset(0), &mut out[first..first + rest])
                .expect("claimed frame within ring arena");
        }
    }

    /// Zeroes `len` bytes of the arena starting at `pos`, wrapping.
    fn zero_wrapped(&self, pos: usize, len: usize) {
        let first = len.min(self.cap as usize - pos);
        self.shm
            .fill_zero(self.data_offset(pos), first)
            .expect("claimed frame within ring arena");
        if first < len {
            self.shm
                .fill_zero(self.data_offset(0), len - first)
                .expect("claimed frame within ring arena");
        }
    }

    /// Enqueues one payload.
    ///
    /// Returns `Full` when the frame does not fit the current free space
    /// (transient; the caller owns the retry policy) and `Oversize` when it
    /// can never fit. Empty payloads are rejected as `Oversize`: the zero
    /// length word is the reservation-in-progress sentinel and cannot
    /// double as a committed frame.
    pub fn enqueue(&self, payload: &[u8]) -> Result<(), RingError> {
        let len = payload.len();
        let frame = 4u64 + pad4(len) as u64;
        if len == 0 || frame > u64::from(self.cap) {
            if self.enable_metrics {
                self.metrics.add_oversize();
            }
            return Err(RingError::Oversize {
                len,
                capacity: self.cap as usize,
            });
        }
        let frame = frame as u32;

        let mut retry = ClaimRetry::new();
        let claimed = loop {
            let head = self.head_word().load(Ordering::Acquire);
            let tail = self.tail_word().load(Ordering::Acquire);
            let used = self.occupancy(head, tail);
            debug_assert_occupancy_bounded!(used, self.cap);

            if frame > self.cap - used {
                if self.enable_metrics {
                    self.metrics.add_full();
                }
                return Err(RingError::Full);
            }

            let next = self.seq_add(tail, frame);
            match self.tail_word().compare_exchange_weak(
                tail,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break tail,
                Err(_) => {
                    if self.enable_metrics {
                        self.metrics.add_claim_retry();
                    }
                    retry.pause();
                }
            }
        };

        // The claimed span is exclusively ours until the length word is
        // committed, and it is all-zero (free-span invariant).
        self.write_wrapped(self.pos(self.seq_add(claimed, 4)), payload);

        // Commit: length word last, Release publishes the payload writes.
        self.len_word(claimed).store(len as u32, Ordering::Release);

        if self.enable_metrics {
            self.metrics.add_enqueued();
        }
        self.flags.signal(self.dirty_idx);
        Ok(())
    }

    /// Dequeues one payload, if a committed frame is available.
    ///
    /// `None` means the ring is empty or the frame at `head` is still being
    /// committed (a transient zero-length probe) — callers retry. No
    /// duplication and no loss under concurrent producers and consumers.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        let mut retry = ClaimRetry::new();
        loop {
            let head = self.head_word().load(Ordering::Acquire);
            let tail = self.tail_word().load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let len_word = self.len_word(head);
            let len = len_word.load(Ordering::Acquire);
            if len == 0 {
                // Producer has claimed the frame but not committed yet (or a
                // sibling consumer is mid-claim). Bounded by their commit
                // window; the caller retries.
                if self.enable_metrics {
                    self.metrics.add_zero_probe();
                }
                return None;
            }
            if u64::from(len) + 4 > u64::from(self.cap) {
                warn!(region = ?self.region, len, "corrupt length word in ring");
                return None;
            }
            debug_assert_committed_len!(len, self.cap);

            // Claim the frame: the length word is the claim token.
            if len_word
                .compare_exchange(len, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                if self.enable_metrics {
                    self.metrics.add_claim_retry();
                }
                retry.pause();
                continue;
            }

            // The claim is only valid for the frame currently at `head`. If
            // sibling consumers and producers lapped the whole ring between
            // our head snapshot and the claim, the word we zeroed belongs to
            // a frame beyond the current head: restore it and retry.
            let current = self.head_word().load(Ordering::Acquire);
            if self.pos(current) != self.pos(head) {
                len_word.store(len, Ordering::Release);
                if self.enable_metrics {
                    self.metrics.add_claim_retry();
                }
                retry.pause();
                continue;
            }

            // Sole claimant: `head` cannot move until we advance it.
            let head = current;

            let mut out = vec![0u8; len as usize];
            let payload_pos = self.pos(self.seq_add(head, 4));
            self.read_wrapped(payload_pos, &mut out);

            // Restore the free-span invariant before releasing the bytes.
            self.zero_wrapped(payload_pos, pad4(len as usize));
            self.head_word()
                .store(self.seq_add(head, 4 + pad4(len as usize) as u32), Ordering::Release);

            if self.enable_metrics {
                self.metrics.add_dequeued();
            }
            return Some(out);
        }
    }

    /// Bytes currently occupied by committed and in-flight frames.
    pub fn len(&self) -> usize {
        let head = self.head_word().load(Ordering::Acquire);
        let tail = self.tail_word().load(Ordering::Acquire);
        self.occupancy(head, tail) as usize
    }

    /// Returns `true` when no frames are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time transport counters (zeroes when metrics are disabled).
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("region", &self.region)
            .field("data_capacity", &self.cap)
            .field("occupied", &self.len())
            .finish_non_exhaustive()
    }
}
