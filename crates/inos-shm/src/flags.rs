use crate::layout::{FLAG_COUNT, OFFSET_ATOMIC_FLAGS, SYSTEM_EPOCH, SYSTEM_PULSE};
use crate::region::SharedRegion;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

// =============================================================================
// SIGNALLING PROTOCOL
// =============================================================================
//
// Each flag word is a 32-bit counter in the shared region. `signal` is a
// SeqCst fetch_add followed by a wake of every suspended waiter on that
// index; `wait` loads the counter first and only suspends while it still
// equals the caller's expectation.
//
// Wakeups must not be lost between the waiter's check and its suspension:
//
// - Blocking path: the waiter re-checks the counter while holding the slot
//   mutex; the signaller acquires and releases the same mutex before
//   notifying, so a concurrent increment either happens before the check or
//   after the waiter is parked.
// - Async path: the waiter registers interest (`Notified::enable`) before
//   re-checking the counter; `notify_waiters` wakes every registered waiter.
//
// Spurious wakeups are fine — the return value always discriminates on the
// observed counter value, never on why the waiter woke.
// =============================================================================

/// Outcome of a wait on a flag index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The counter differs from the expected value; carries the observed one.
    Changed(u32),
    /// The timeout elapsed with the counter still at the expected value.
    TimedOut,
}

impl WaitOutcome {
    /// Returns `true` if the counter moved.
    #[inline]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

struct WaitSlot {
    lock: Mutex<()>,
    cond: Condvar,
    notify: Notify,
}

impl WaitSlot {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The mutex protects nothing but the park/notify handoff; a poisoned
        // guard carries no state worth propagating.
        match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The atomic flags array and its wake-on-change machinery.
///
/// Epoch counters are monotonically increasing; dirty flags are epochs whose
/// meaning is "the paired region has new data"; the allocator word holds the
/// arena bump offset and is mutated by CAS, not by `signal`.
pub struct EpochFlags {
    shm: Arc<SharedRegion>,
    slots: Box<[CachePadded<WaitSlot>]>,
}

impl EpochFlags {
    /// Builds the flags view over a shared region.
    ///
    /// # Panics
    ///
    /// Panics if the region is too small to hold the flags array.
    pub fn new(shm: Arc<SharedRegion>) -> Self {
        shm.check_range(OFFSET_ATOMIC_FLAGS, FLAG_COUNT * 4)
            .expect("region too small for the atomic flags array");

        let mut slots = Vec::with_capacity(FLAG_COUNT);
        slots.resize_with(FLAG_COUNT, || CachePadded::new(WaitSlot::new()));

        Self {
            shm,
            slots: slots.into_boxed_slice(),
        }
    }

    /// Raw atomic handle for a flag word (used for CAS on the allocator word
    /// and for the bridge's raw atomic surface).
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range index — flag indices are compile-time
    /// constants, so a bad one is a structural bug.
    #[inline]
    pub fn atomic(&self, idx: u32) -> &AtomicU32 {
        assert!((idx as usize) < FLAG_COUNT, "flag index {idx} out of range");
        // Offset validated at construction; the flags array is word-aligned
        // by layout.
        self.shm
            .atomic_u32(OFFSET_ATOMIC_FLAGS + idx as usize * 4)
            .expect("flags array validated at construction")
    }

    /// Reads the current counter value.
    #[inline]
    pub fn read(&self, idx: u32) -> u32 {
        self.atomic(idx).load(Ordering::SeqCst)
    }

    /// Increments the counter at `idx` and wakes every waiter on it.
    ///
    /// Signalling any index other than `SYSTEM_EPOCH` or `SYSTEM_PULSE` also
    /// signals `SYSTEM_EPOCH`, so a single observer of the master heartbeat
    /// sees all activity in the system.
    ///
    /// Returns the new value at `idx`.
    pub fn signal(&self, idx: u32) -> u32 {
        let next = self.atomic(idx).fetch_add(1, Ordering::SeqCst) + 1;
        self.wake(idx);

        if idx != SYSTEM_EPOCH && idx != SYSTEM_PULSE {
            self.atomic(SYSTEM_EPOCH).fetch_add(1, Ordering::SeqCst);
            self.wake(SYSTEM_EPOCH);
        }

        next
    }

    fn wake(&self, idx: u32) {
        let slot = &self.slots[idx as usize];
        // Acquire/release the slot mutex so an in-flight blocking waiter is
        // either pre-check (sees the new value) or parked (gets notified).
        drop(slot.guard());
        slot.cond.notify_all();
        slot.notify.notify_waiters();
    }

    /// Blocking wait for the counter at `idx` to differ from `expected`.
    ///
    /// Returns immediately with `Changed` if it already differs. A zero
    /// timeout never suspends. `wait` never fails.
    pub fn wait_blocking(&self, idx: u32, expected: u32, timeout: Duration) -> WaitOutcome {
        let current = self.read(idx);
        if current != expected {
            return WaitOutcome::Changed(current);
        }
        if timeout.is_zero() {
            return WaitOutcome::TimedOut;
        }

        let deadline = Instant::now().checked_add(timeout);
        let slot = &self.slots[idx as usize];
        let mut guard = slot.guard();

        loop {
            let current = self.read(idx);
            if current != expected {
                return WaitOutcome::Changed(current);
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    deadline - now
                }
                // Effectively unbounded; re-park in large slices.
                None => Duration::from_secs(3600),
            };

            guard = match slot.cond.wait_timeout(guard, wait_for) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Async wait with the same observable contract as [`wait_blocking`],
    /// suspending the task instead of the thread.
    ///
    /// Cancellation composes at the call site (`tokio::select!` against a
    /// shutdown future); dropping the returned future is always safe.
    pub async fn wait(&self, idx: u32, expected: u32, timeout: Duration) -> WaitOutcome {
        let current = self.read(idx);
        if current != expected {
            return WaitOutcome::Changed(current);
        }
        if timeout.is_zero() {
            return WaitOutcome::TimedOut;
        }

        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let slot = &self.slots[idx as usize];

        loop {
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            // Register interest before the re-check so a signal between the
            // check and the await still wakes us.
            notified.as_mut().enable();

            let current = self.read(idx);
            if current != expected {
                return WaitOutcome::Changed(current);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let current = self.read(idx);
                        return if current != expected {
                            WaitOutcome::Changed(current)
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Polling fallback for hosts that cannot suspend: identical observable
    /// contract, bounded polling period (clamped to 50 ms).
    pub fn wait_polling(
        &self,
        idx: u32,
        expected: u32,
        timeout: Duration,
        period: Duration,
    ) -> WaitOutcome {
        const MAX_PERIOD: Duration = Duration::from_millis(50);
        let period = period.min(MAX_PERIOD).max(Duration::from_millis(1));
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let current = self.read(idx);
            if current != expected {
                return WaitOutcome::Changed(current);
            }
            let sleep = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    period.min(deadline - now)
                }
                None => period,
            };
            std::thread::sleep(sleep);
        }
    }

    /// The region this flags view is bound to.
    #[inline]
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.shm
    }
}

impl std::fmt::Debug for EpochFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochFlags")
            .field("system_epoch", &self.read(SYSTEM_EPOCH))
            .finish_non_exhaustive()
    }
}
