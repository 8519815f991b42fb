//! The bridge facade: single owner of the shared region and everything
//! layered on it.
//!
//! Constructed once at init and passed explicitly into every component —
//! never a module-level singleton. External layers talk to the core
//! exclusively through this surface: ring I/O with the wire codec, epoch
//! primitives, raw bounds-checked byte access, region guards, the arena,
//! and the ledger.

use crate::job::{
    decode_job, decode_result, encode_job, encode_result, JobRecord, ResultRecord, WireError,
};
use inos_ledger::{LedgerEngine, RatePolicy};
use inos_shm::layout::{INBOX_DIRTY, OUTBOX_HOST_DIRTY};
use inos_shm::{
    layout, ArenaAllocator, EpochFlags, GuardError, GuardTable, RegionId, RingBuffer, RingError,
    Role, ShmConfig, SharedRegion, ShmError, WaitOutcome, WriteGuard,
};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// Errors surfaced by the bridge's composite operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// LRU cache of validated `(offset, size)` view descriptors.
///
/// Bounds validation of a raw range is cheap here, but hosts constructing
/// subarray views over the shared buffer pay real cost per view; caching the
/// validated descriptors keeps repeated raw access amortised on every layer.
struct ViewCache {
    known: HashMap<(usize, usize), ()>,
    order: VecDeque<(usize, usize)>,
    cap: usize,
}

impl ViewCache {
    fn new(cap: usize) -> Self {
        Self {
            known: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Validates a range, consulting the cache first.
    fn validate(&mut self, shm: &SharedRegion, offset: usize, len: usize) -> Result<(), ShmError> {
        let key = (offset, len);
        if self.known.contains_key(&key) {
            // Touch: move to the back of the eviction order.
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
                self.order.push_back(key);
            }
            return Ok(());
        }

        shm.check_range(offset, len)?;
        self.known.insert(key, ());
        self.order.push_back(key);
        if self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.known.len()
    }
}

const VIEW_CACHE_ENTRIES: usize = 64;

/// Single addressable owner of the shared memory coordination core.
pub struct Bridge {
    shm: Arc<SharedRegion>,
    flags: Arc<EpochFlags>,
    inbox: RingBuffer,
    outbox_host: RingBuffer,
    outbox_kernel: RingBuffer,
    guards: GuardTable,
    arena: ArenaAllocator,
    ledger: LedgerEngine,
    views: Mutex<ViewCache>,
}

impl Bridge {
    /// Creates the shared region for the configured tier and wires every
    /// component over it.
    pub fn init(config: ShmConfig) -> Result<Self, ShmError> {
        let capacity = config.tier.bytes();
        layout::validate(capacity)?;

        let shm = Arc::new(SharedRegion::new(capacity));
        let flags = Arc::new(EpochFlags::new(Arc::clone(&shm)));

        let inbox =
            RingBuffer::for_region(Arc::clone(&shm), Arc::clone(&flags), RegionId::Inbox, &config);
        let outbox_host = RingBuffer::for_region(
            Arc::clone(&shm),
            Arc::clone(&flags),
            RegionId::OutboxHost,
            &config,
        );
        let outbox_kernel = RingBuffer::for_region(
            Arc::clone(&shm),
            Arc::clone(&flags),
            RegionId::OutboxKernel,
            &config,
        );

        let guards = GuardTable::new(Arc::clone(&shm), Arc::clone(&flags));
        let arena = ArenaAllocator::new(Arc::clone(&shm), Arc::clone(&flags));
        let ledger = LedgerEngine::new(Arc::clone(&shm), Arc::clone(&flags), RatePolicy::default());

        info!(
            capacity,
            tier = ?config.tier,
            layout_version = layout::LAYOUT_VERSION,
            "shared region initialised"
        );

        Ok(Self {
            shm,
            flags,
            inbox,
            outbox_host,
            outbox_kernel,
            guards,
            arena,
            ledger,
            views: Mutex::new(ViewCache::new(VIEW_CACHE_ENTRIES)),
        })
    }

    fn views(&self) -> MutexGuard<'_, ViewCache> {
        match self.views.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---------------------------------------------------------------------
    // RING I/O + WIRE CODEC
    // ---------------------------------------------------------------------

    /// Encodes a job and enqueues it on the inbox ring (the commit signals
    /// `INBOX_DIRTY` and the master heartbeat).
    pub fn write_job(&self, job: &JobRecord) -> Result<(), BridgeError> {
        let bytes = encode_job(job)?;
        self.inbox.enqueue(&bytes)?;
        Ok(())
    }

    /// Dequeues and decodes the next job from the inbox ring.
    pub fn read_job(&self) -> Result<Option<JobRecord>, BridgeError> {
        match self.inbox.dequeue() {
            Some(bytes) => Ok(Some(decode_job(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encodes a result and enqueues it on the host-facing outbox ring.
    pub fn write_result(&self, result: &ResultRecord) -> Result<(), BridgeError> {
        let bytes = encode_result(result)?;
        self.outbox_host.enqueue(&bytes)?;
        Ok(())
    }

    /// Dequeues and decodes the next result from the host-facing outbox.
    pub fn read_result(&self) -> Result<Option<ResultRecord>, BridgeError> {
        match self.outbox_host.dequeue() {
            Some(bytes) => Ok(Some(decode_result(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw frame toward the kernel (module → kernel traffic is not parsed
    /// by the core).
    pub fn push_kernel(&self, payload: &[u8]) -> Result<(), RingError> {
        self.outbox_kernel.enqueue(payload)
    }

    /// Next raw frame from the kernel-facing outbox.
    pub fn pull_kernel(&self) -> Option<Vec<u8>> {
        self.outbox_kernel.dequeue()
    }

    // ---------------------------------------------------------------------
    // EPOCH PRIMITIVES
    // ---------------------------------------------------------------------

    /// Signals an epoch index (master-heartbeat rule applies).
    pub fn signal(&self, idx: u32) -> u32 {
        self.flags.signal(idx)
    }

    /// Signals the inbox dirty flag without enqueuing (attention nudge).
    pub fn signal_inbox(&self) -> u32 {
        self.flags.signal(INBOX_DIRTY)
    }

    /// Suspends until the host-facing outbox dirty flag moves past
    /// `expected`, or the timeout elapses.
    pub async fn wait_for_outbox(&self, expected: u32, timeout: Duration) -> WaitOutcome {
        self.flags.wait(OUTBOX_HOST_DIRTY, expected, timeout).await
    }

    /// Blocking variant of [`wait_for_outbox`].
    pub fn wait_for_outbox_blocking(&self, expected: u32, timeout: Duration) -> WaitOutcome {
        self.flags.wait_blocking(OUTBOX_HOST_DIRTY, expected, timeout)
    }

    /// Current value of a flag word.
    pub fn atomic_load(&self, idx: u32) -> u32 {
        self.flags.read(idx)
    }

    /// Raw add on a flag word — no heartbeat, no wakeups.
    pub fn atomic_add(&self, idx: u32, n: u32) -> u32 {
        self.flags
            .atomic(idx)
            .fetch_add(n, std::sync::atomic::Ordering::SeqCst)
            + n
    }

    // ---------------------------------------------------------------------
    // RAW ACCESS & GUARDS
    // ---------------------------------------------------------------------

    /// Bounds-checked raw read; the validated range is cached.
    pub fn read_raw(&self, offset: usize, len: usize) -> Result<Vec<u8>, ShmError> {
        self.views().validate(&self.shm, offset, len)?;
        self.shm.read_bytes(offset, len)
    }

    /// Bounds-checked raw write; the validated range is cached.
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        self.views().validate(&self.shm, offset, bytes.len())?;
        self.shm.write_bytes(offset, bytes)
    }

    /// Acquires scoped write ownership of a region.
    pub fn acquire_region_write(
        &self,
        region: RegionId,
        role: Role,
    ) -> Result<WriteGuard<'_>, GuardError> {
        self.guards.acquire_write(region, role)
    }

    /// Checks a read against the region's reader mask (counted, not blocked).
    pub fn validate_region_read(&self, region: RegionId, role: Role) -> Result<(), GuardError> {
        self.guards.validate_read(region, role)
    }

    // ---------------------------------------------------------------------
    // COMPONENT ACCESS
    // ---------------------------------------------------------------------

    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    pub fn arena(&self) -> &ArenaAllocator {
        &self.arena
    }

    pub fn guards(&self) -> &GuardTable {
        &self.guards
    }

    pub fn flags(&self) -> &Arc<EpochFlags> {
        &self.flags
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.shm
    }

    pub fn inbox(&self) -> &RingBuffer {
        &self.inbox
    }

    pub fn outbox_host(&self) -> &RingBuffer {
        &self.outbox_host
    }

    pub fn outbox_kernel(&self) -> &RingBuffer {
        &self.outbox_kernel
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("capacity", &self.shm.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inos_shm::layout::OFFSET_ARENA;

    #[test]
    fn view_cache_caches_and_evicts_lru() {
        let shm = SharedRegion::new(4096);
        let mut cache = ViewCache::new(4);

        for i in 0..4 {
            cache.validate(&shm, i * 8, 8).unwrap();
        }
        assert_eq!(cache.len(), 4);

        // Touch the oldest so it survives the next insertion.
        cache.validate(&shm, 0, 8).unwrap();
        cache.validate(&shm, 64, 8).unwrap();
        assert_eq!(cache.len(), 4);
        assert!(cache.known.contains_key(&(0, 8)));
        assert!(!cache.known.contains_key(&(8, 8)));

        // Invalid ranges never enter the cache.
        assert!(cache.validate(&shm, 4095, 8).is_err());
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn raw_access_is_bounds_checked() {
        let bridge = Bridge::init(ShmConfig::default()).unwrap();
        bridge.write_raw(OFFSET_ARENA, &[1, 2, 3, 4]).unwrap();
        assert_eq!(bridge.read_raw(OFFSET_ARENA, 4).unwrap(), vec![1, 2, 3, 4]);
        let capacity = bridge.region().capacity();
        assert!(bridge.read_raw(capacity, 1).is_err());
    }
}
