use crate::error::GuardError;
use crate::flags::EpochFlags;
use crate::layout::{self, AccessClass, RegionId, Role, OFFSET_REGION_GUARDS, REGION_COUNT};
use crate::region::SharedRegion;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

// Guard entry: four u32 words per region id.
const WORD_LOCK_OWNER: usize = 0;
const WORD_LAST_EPOCH: usize = 1;
const WORD_VIOLATIONS: usize = 2;
const WORD_LAST_OWNER_TAG: usize = 3;
const ENTRY_SIZE: usize = 16;

/// Declarative write-ownership enforcement for the named regions.
///
/// The table itself lives in the RegionGuards region: one entry of four u32
/// words per region `(lock_owner, last_epoch, violation_count,
/// last_owner_tag)`. Enforcement is cooperative for writers (single-writer
/// regions are CAS-locked) and observational for readers (violations are
/// counted, reads are never blocked).
pub struct GuardTable {
    shm: Arc<SharedRegion>,
    flags: Arc<EpochFlags>,
}

impl GuardTable {
    /// Builds the guard table view over a shared region.
    ///
    /// # Panics
    ///
    /// Panics if the region is too small to hold the table.
    pub fn new(shm: Arc<SharedRegion>, flags: Arc<EpochFlags>) -> Self {
        shm.check_range(OFFSET_REGION_GUARDS, REGION_COUNT * ENTRY_SIZE)
            .expect("region too small for the guard table");
        Self { shm, flags }
    }

    #[inline]
    fn word(&self, region: RegionId, word: usize) -> &AtomicU32 {
        self.shm
            .atomic_u32(OFFSET_REGION_GUARDS + region as usize * ENTRY_SIZE + word * 4)
            .expect("guard table validated at construction")
    }

    fn bump_violations(&self, region: RegionId) {
        self.word(region, WORD_VIOLATIONS).fetch_add(1, Ordering::SeqCst);
    }

    /// Current violation count for a region.
    pub fn violations(&self, region: RegionId) -> u32 {
        self.word(region, WORD_VIOLATIONS).load(Ordering::SeqCst)
    }

    /// Current lock word for a region (zero means unlocked).
    pub fn lock_owner(&self, region: RegionId) -> u32 {
        self.word(region, WORD_LOCK_OWNER).load(Ordering::SeqCst)
    }

    /// Advisory tag of the last writer that touched a region.
    pub fn last_owner_tag(&self, region: RegionId) -> u32 {
        self.word(region, WORD_LAST_OWNER_TAG).load(Ordering::SeqCst)
    }

    /// Epoch value stamped at the last guard release.
    pub fn last_epoch(&self, region: RegionId) -> u32 {
        self.word(region, WORD_LAST_EPOCH).load(Ordering::SeqCst)
    }

    /// Acquires write ownership of a region for a role.
    ///
    /// Policy rejections and lock conflicts increment the region's violation
    /// counter. The returned guard releases on drop; if the region declares
    /// an associated epoch index, that epoch must advance before release or
    /// the release counts a violation too.
    pub fn acquire_write(
        &self,
        region: RegionId,
        role: Role,
    ) -> Result<WriteGuard<'_>, GuardError> {
        let spec = layout::spec(region);

        if spec.access == AccessClass::ReadOnly || spec.writer_mask & role.bit() == 0 {
            self.bump_violations(region);
            warn!(?region, ?role, "write denied by region policy");
            return Err(GuardError::PolicyViolation { region, role });
        }

        match spec.access {
            AccessClass::SingleWriter => {
                if let Err(holder) = self.word(region, WORD_LOCK_OWNER).compare_exchange(
                    0,
                    role.bit(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    self.bump_violations(region);
                    warn!(?region, ?role, holder, "region already locked");
                    return Err(GuardError::Locked { region, holder });
                }
            }
            AccessClass::MultiWriter => {
                // No lock; ownership is advisory.
                self.word(region, WORD_LAST_OWNER_TAG)
                    .store(role.bit(), Ordering::Release);
            }
            AccessClass::ReadOnly => unreachable!("rejected above"),
        }

        let entry_epoch = spec.epoch_idx.map(|idx| (idx, self.flags.read(idx)));
        Ok(WriteGuard {
            table: self,
            region,
            role,
            single_writer: spec.access == AccessClass::SingleWriter,
            entry_epoch,
            released: false,
        })
    }

    /// Checks a role against a region's reader mask.
    ///
    /// Violations are counted but never block the read — this is
    /// observability, not enforcement.
    pub fn validate_read(&self, region: RegionId, role: Role) -> Result<(), GuardError> {
        let spec = layout::spec(region);
        if spec.reader_mask & role.bit() == 0 {
            self.bump_violations(region);
            warn!(?region, ?role, "read outside the region's reader mask");
            return Err(GuardError::PolicyViolation { region, role });
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardTable").finish_non_exhaustive()
    }
}

/// RAII write ownership of a region. Dropping the guard releases the lock;
/// releasing without the declared epoch having advanced counts a violation.
#[must_use = "dropping the guard immediately releases write ownership"]
pub struct WriteGuard<'a> {
    table: &'a GuardTable,
    region: RegionId,
    role: Role,
    single_writer: bool,
    entry_epoch: Option<(u32, u32)>,
    released: bool,
}

impl WriteGuard<'_> {
    /// The region this guard owns.
    #[inline]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Verifies that the region's declared epoch advanced since acquisition.
    ///
    /// Epoch advancement is the contract by which readers know a write
    /// completed; call this after signalling, before release.
    pub fn ensure_epoch_advanced(&self) -> Result<(), GuardError> {
        match self.entry_epoch {
            Some((idx, at_entry)) if self.table.flags.read(idx) == at_entry => {
                Err(GuardError::EpochNotAdvanced { region: self.region })
            }
            _ => Ok(()),
        }
    }

    /// Releases the guard explicitly, surfacing the epoch check result.
    pub fn release(mut self) -> Result<(), GuardError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), GuardError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let epoch_check = self.ensure_epoch_advanced();
        if epoch_check.is_err() {
            self.table.bump_violations(self.region);
            warn!(region = ?self.region, role = ?self.role, "released without epoch advance");
        }

        // Stamp the epoch observed at release time.
        let stamp = match self.entry_epoch {
            Some((idx, _)) => self.table.flags.read(idx),
            None => self.table.flags.read(layout::SYSTEM_EPOCH),
        };
        self.table
            .word(self.region, WORD_LAST_EPOCH)
            .store(stamp, Ordering::Release);

        if self.single_writer {
            // Unlock only if we still hold it; a mismatch means the word was
            // stomped from outside the guard discipline.
            if self
                .table
                .word(self.region, WORD_LOCK_OWNER)
                .compare_exchange(self.role.bit(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.table.bump_violations(self.region);
                warn!(region = ?self.region, "lock word changed outside the guard");
            }
            self.table
                .word(self.region, WORD_LAST_OWNER_TAG)
                .store(self.role.bit(), Ordering::Release);
        }

        epoch_check
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

impl std::fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard")
            .field("region", &self.region)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{EVOLUTION_EPOCH, METRICS_EPOCH};

    fn table() -> (GuardTable, Arc<EpochFlags>) {
        let shm = Arc::new(SharedRegion::new(0x112000));
        let flags = Arc::new(EpochFlags::new(Arc::clone(&shm)));
        (GuardTable::new(shm, Arc::clone(&flags)), flags)
    }

    #[test]
    fn single_writer_lock_and_release() {
        let (table, flags) = table();
        let guard = table
            .acquire_write(RegionId::ModuleRegistry, Role::Kernel)
            .unwrap();
        assert_eq!(table.lock_owner(RegionId::ModuleRegistry), Role::Kernel.bit());
        guard.release().unwrap();
        assert_eq!(table.lock_owner(RegionId::ModuleRegistry), 0);
        assert_eq!(table.violations(RegionId::ModuleRegistry), 0);
        assert_eq!(
            table.last_epoch(RegionId::ModuleRegistry),
            flags.read(layout::SYSTEM_EPOCH)
        );
    }

    #[test]
    fn second_acquire_fails_and_counts_one_violation() {
        let (table, _flags) = table();
        let _held = table
            .acquire_write(RegionId::ModuleRegistry, Role::Kernel)
            .unwrap();
        let err = table
            .acquire_write(RegionId::ModuleRegistry, Role::Module)
            .unwrap_err();
        // Module is not even in the writer mask for this region.
        assert_eq!(
            err,
            GuardError::PolicyViolation {
                region: RegionId::ModuleRegistry,
                role: Role::Module
            }
        );
        // A permitted writer still bounces off the held lock.
        let err = table
            .acquire_write(RegionId::ModuleRegistry, Role::Kernel)
            .unwrap_err();
        assert_eq!(
            err,
            GuardError::Locked {
                region: RegionId::ModuleRegistry,
                holder: Role::Kernel.bit()
            }
        );
        assert_eq!(table.violations(RegionId::ModuleRegistry), 2);
        assert_eq!(table.lock_owner(RegionId::ModuleRegistry), Role::Kernel.bit());
    }

    #[test]
    fn read_only_region_rejects_writes() {
        let (table, _flags) = table();
        let err = table
            .acquire_write(RegionId::RegionGuards, Role::Kernel)
            .unwrap_err();
        assert!(matches!(err, GuardError::PolicyViolation { .. }));
        assert_eq!(table.violations(RegionId::RegionGuards), 1);
    }

    #[test]
    fn multi_writer_region_records_advisory_tag() {
        let (table, flags) = table();
        {
            let guard = table
                .acquire_write(RegionId::PatternExchange, Role::Module)
                .unwrap();
            flags.signal(EVOLUTION_EPOCH);
            guard.release().unwrap();
        }
        assert_eq!(table.lock_owner(RegionId::PatternExchange), 0);
        assert_eq!(
            table.last_owner_tag(RegionId::PatternExchange),
            Role::Module.bit()
        );
        assert_eq!(table.violations(RegionId::PatternExchange), 0);
    }

    #[test]
    fn release_without_epoch_advance_counts_violation() {
        let (table, _flags) = table();
        let guard = table
            .acquire_write(RegionId::Economics, Role::Kernel)
            .unwrap();
        assert_eq!(
            guard.ensure_epoch_advanced(),
            Err(GuardError::EpochNotAdvanced { region: RegionId::Economics })
        );
        let err = guard.release().unwrap_err();
        assert_eq!(err, GuardError::EpochNotAdvanced { region: RegionId::Economics });
        assert_eq!(table.violations(RegionId::Economics), 1);
        // The lock is released regardless.
        assert_eq!(table.lock_owner(RegionId::Economics), 0);
    }

    #[test]
    fn epoch_advance_satisfies_the_release_check() {
        let (table, flags) = table();
        let guard = table
            .acquire_write(RegionId::Economics, Role::Kernel)
            .unwrap();
        flags.signal(METRICS_EPOCH);
        guard.ensure_epoch_advanced().unwrap();
        guard.release().unwrap();
        assert_eq!(table.violations(RegionId::Economics), 0);
    }

    #[test]
    fn drop_releases_the_lock() {
        let (table, flags) = table();
        {
            let _guard = table
                .acquire_write(RegionId::Economics, Role::Kernel)
                .unwrap();
            flags.signal(METRICS_EPOCH);
        }
        assert_eq!(table.lock_owner(RegionId::Economics), 0);
        assert_eq!(table.violations(RegionId::Economics), 0);
    }

    #[test]
    fn reader_mask_is_observed_not_enforced() {
        let (table, _flags) = table();
        // Host may not read the kernel-facing outbox.
        let err = table
            .validate_read(RegionId::OutboxKernel, Role::Host)
            .unwrap_err();
        assert!(matches!(err, GuardError::PolicyViolation { .. }));
        assert_eq!(table.violations(RegionId::OutboxKernel), 1);
        table.validate_read(RegionId::OutboxKernel, Role::Kernel).unwrap();
    }
}
