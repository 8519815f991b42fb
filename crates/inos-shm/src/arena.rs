use crate::error::ShmError;
use crate::flags::EpochFlags;
use crate::layout::{align_up, ARENA_ALLOCATOR, OFFSET_ARENA};
use crate::region::SharedRegion;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Bump allocator over the Arena region.
///
/// The `ARENA_ALLOCATOR` flag word holds the number of arena bytes in use;
/// allocation is a CAS race on that word. Slices are never freed — the arena
/// resets only with the region itself. The word is mutated by CAS, not by
/// `signal`: allocator movement is not system activity.
pub struct ArenaAllocator {
    shm: Arc<SharedRegion>,
    flags: Arc<EpochFlags>,
    size: usize,
}

impl ArenaAllocator {
    /// Builds the allocator for a region's arena span.
    ///
    /// # Panics
    ///
    /// Panics if the buffer ends before the arena begins.
    pub fn new(shm: Arc<SharedRegion>, flags: Arc<EpochFlags>) -> Self {
        assert!(
            shm.capacity() > OFFSET_ARENA,
            "buffer too small to carry an arena"
        );
        let size = shm.capacity() - OFFSET_ARENA;
        Self { shm, flags, size }
    }

    /// Allocates `len` bytes at the given power-of-two alignment and returns
    /// the absolute buffer offset of the slice.
    pub fn alloc(&self, len: usize, align: usize) -> Result<usize, ShmError> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let word = self.flags.atomic(ARENA_ALLOCATOR);
        let mut current = word.load(Ordering::SeqCst);
        loop {
            let start = align_up(current as usize, align);
            let end = match start.checked_add(len) {
                Some(end) if end <= self.size => end,
                _ => {
                    return Err(ShmError::CapacityExhausted {
                        requested: len,
                        remaining: self.size.saturating_sub(current as usize),
                    })
                }
            };

            match word.compare_exchange_weak(
                current,
                end as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(OFFSET_ARENA + start),
                Err(observed) => current = observed,
            }
        }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.flags.atomic(ARENA_ALLOCATOR).load(Ordering::SeqCst) as usize
    }

    /// Bytes still available (before alignment padding).
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.used())
    }

    /// Total arena span in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The backing region.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.shm
    }
}

impl std::fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("used", &self.used())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn arena(extra: usize) -> ArenaAllocator {
        let shm = Arc::new(SharedRegion::new(OFFSET_ARENA + extra));
        let flags = Arc::new(EpochFlags::new(Arc::clone(&shm)));
        ArenaAllocator::new(shm, flags)
    }

    #[test]
    fn bump_allocation_is_monotonic_and_aligned() {
        let a = arena(4096);
        let first = a.alloc(100, 8).unwrap();
        assert_eq!(first, OFFSET_ARENA);
        let second = a.alloc(10, 64).unwrap();
        assert_eq!(second % 64, OFFSET_ARENA % 64);
        assert!(second >= first + 100);
        assert_eq!(a.used(), second - OFFSET_ARENA + 10);
    }

    #[test]
    fn exhaustion_is_reported() {
        let a = arena(256);
        a.alloc(200, 1).unwrap();
        let err = a.alloc(100, 1).unwrap_err();
        assert!(matches!(err, ShmError::CapacityExhausted { requested: 100, .. }));
        // Smaller requests still fit.
        a.alloc(56, 1).unwrap();
        assert_eq!(a.remaining(), 0);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let a = Arc::new(arena(64 * 1024));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..100 {
                    offsets.push(a.alloc(32, 8).unwrap());
                }
                offsets
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= 32, "overlapping slices at {pair:?}");
        }
    }
}
