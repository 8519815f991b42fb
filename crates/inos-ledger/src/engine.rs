use crate::account::{
    AccountRef, AccountSnapshot, ACCOUNTS_BASE, ACCOUNTS_SIZE, MAX_ACCOUNTS, META_ACCOUNT_COUNT,
    META_SEAL_EPOCH, META_SEAL_HASH,
};
use crate::error::LedgerError;
use crate::rates::{RatePolicy, ResourceSample, RESOURCE_SLOT_COUNT};
use inos_shm::layout::{METRICS_EPOCH, OFFSET_ECONOMICS};
use inos_shm::{EpochFlags, SharedRegion};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Well-known did of the treasury account (funds UBI, absorbs residuals).
pub const TREASURY_DID: &str = "did:inos:treasury";
/// Well-known did of the creator account.
pub const CREATOR_DID: &str = "did:inos:creator";

/// Process-local directory of registered dids.
///
/// The 128-byte account record carries no identity field, so the did → slot
/// mapping lives here; the slot count itself is persisted in the region
/// metadata so occupancy survives re-attachment.
#[derive(Default)]
struct Directory {
    by_did: HashMap<String, usize>,
}

/// The credit ledger, wholly materialised inside the Economics region.
///
/// All credit motion lands in an account's pending fields; `on_epoch`
/// commits every account, runs the UBI drip, and seals the committed
/// snapshot with a SHA-256 hash. The signed identity
/// `pending_balance == pending_earned − pending_spent` is maintained by
/// every operation, which makes `balance == earned_total − spent_total`
/// hold after every commit by construction.
pub struct LedgerEngine {
    shm: Arc<SharedRegion>,
    flags: Arc<EpochFlags>,
    rates: RatePolicy,
    state: Mutex<Directory>,
}

impl LedgerEngine {
    /// Builds the engine over a shared region.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is too small to carry the Economics region.
    pub fn new(shm: Arc<SharedRegion>, flags: Arc<EpochFlags>, rates: RatePolicy) -> Self {
        shm.check_range(OFFSET_ECONOMICS, ACCOUNTS_BASE + ACCOUNTS_SIZE - OFFSET_ECONOMICS)
            .expect("region too small for the Economics region");
        Self {
            shm,
            flags,
            rates,
            state: Mutex::new(Directory::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn account_count(&self) -> Result<usize, LedgerError> {
        Ok(self.shm.read_u32(OFFSET_ECONOMICS + META_ACCOUNT_COUNT)? as usize)
    }

    fn set_account_count(&self, n: usize) -> Result<(), LedgerError> {
        Ok(self.shm.write_u32(OFFSET_ECONOMICS + META_ACCOUNT_COUNT, n as u32)?)
    }

    fn slot_of(&self, dir: &Directory, did: &str) -> Result<usize, LedgerError> {
        dir.by_did
            .get(did)
            .copied()
            .ok_or_else(|| LedgerError::UnknownAccount(did.to_string()))
    }

    #[inline]
    fn account(&self, slot: usize) -> AccountRef<'_> {
        AccountRef::at_slot(&self.shm, slot)
    }

    /// Registers a did, or returns the existing registration.
    ///
    /// Returns the account's byte offset inside the shared region.
    /// Registration is monotonic: slots are never freed, and the 65th
    /// distinct did fails with `CapacityExhausted`.
    pub fn register(&self, did: &str) -> Result<usize, LedgerError> {
        let mut dir = self.lock();
        if let Some(&slot) = dir.by_did.get(did) {
            return Ok(crate::account::account_offset(slot));
        }

        let count = self.account_count()?;
        if count >= MAX_ACCOUNTS {
            return Err(LedgerError::CapacityExhausted { max: MAX_ACCOUNTS });
        }

        self.account(count).clear()?;
        self.set_account_count(count + 1)?;
        dir.by_did.insert(did.to_string(), count);
        info!(did, slot = count, "registered ledger account");
        Ok(crate::account::account_offset(count))
    }

    /// Number of registered accounts.
    pub fn registered(&self) -> Result<usize, LedgerError> {
        self.account_count()
    }

    /// Committed balance (pending motion excluded).
    pub fn get_balance(&self, did: &str) -> Result<i64, LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).balance()
    }

    /// Spendable balance: committed plus any pending *reduction*. A
    /// reservation reduces spending power immediately; pending earnings are
    /// not spendable until the epoch commits.
    pub fn get_available_balance(&self, did: &str) -> Result<i64, LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        let acct = self.account(slot);
        Ok(acct.balance()? + acct.pending_balance()?.min(0))
    }

    /// Full decoded record (observability, tests).
    pub fn snapshot(&self, did: &str) -> Result<AccountSnapshot, LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).load()
    }

    /// Sets the account's device count (used by settlement scaling and UBI).
    pub fn set_device_count(&self, did: &str, devices: u16) -> Result<(), LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).set_device_count(devices)
    }

    /// Sets the account's uptime score.
    pub fn set_uptime_score(&self, did: &str, score: f32) -> Result<(), LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).set_uptime_score(score)
    }

    fn require_positive(amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(())
    }

    /// Places a hold: spending power drops now, the spend commits at the
    /// next epoch.
    pub fn reserve(&self, did: &str, amount: i64) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).debit_pending(amount)
    }

    /// Cancels a hold placed earlier in the same epoch.
    pub fn release(&self, did: &str, amount: i64) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        let acct = self.account(slot);
        let outstanding = acct.pending_spent()?;
        if amount as u64 > outstanding {
            return Err(LedgerError::InvalidAmount(amount));
        }
        acct.set_pending_spent(outstanding - amount as u64)?;
        acct.set_pending_balance(acct.pending_balance()? + amount)
    }

    /// Compensating credit for previously spent funds.
    pub fn refund(&self, did: &str, amount: i64) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.account(slot).credit_pending(amount)
    }

    /// Discretionary credit, attributed to the creator.
    pub fn grant_bonus(&self, did: &str, amount: i64) -> Result<(), LedgerError> {
        Self::require_positive(amount)?;
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        let acct = self.account(slot);
        acct.credit_pending(amount)?;
        acct.set_from_creator(acct.from_creator()? + amount as u64)
    }

    /// Applies a settlement delta to an account's pending fields.
    ///
    /// Negative deltas always route to `pending_spent`, whatever produced
    /// them.
    pub fn settle(&self, did: &str, delta: i64, epoch: u64) -> Result<(), LedgerError> {
        let dir = self.lock();
        let slot = self.slot_of(&dir, did)?;
        self.settle_slot(slot, delta, epoch)
    }

    fn settle_slot(&self, slot: usize, delta: i64, epoch: u64) -> Result<(), LedgerError> {
        let acct = self.account(slot);
        if delta >= 0 {
            acct.credit_pending(delta)?;
        } else {
            acct.debit_pending(-delta)?;
        }
        acct.set_pending_epoch(epoch)
    }

    /// Records a resource-usage sample into a metrics slot for the next
    /// settlement sweep.
    pub fn record_usage(&self, slot: usize, sample: &ResourceSample) -> Result<(), LedgerError> {
        if slot >= RESOURCE_SLOT_COUNT {
            return Err(LedgerError::Shm(inos_shm::ShmError::OutOfBounds {
                offset: slot,
                len: 1,
                capacity: RESOURCE_SLOT_COUNT,
            }));
        }
        sample.store(&self.shm, slot)
    }

    /// Distributes a job's value with a 5% protocol fee.
    ///
    /// The worker receives `value − fee`. Out of the fee, treasury takes
    /// 3.5/5, creator 0.5/5, referrer 0.5/5, and the close ids share 0.5/5
    /// equally. Absent referrer or close ids — and every rounding residue —
    /// accrue to treasury, so no distribution creates or destroys credits.
    pub fn distribute_yield(
        &self,
        worker: &str,
        referrer: Option<&str>,
        close_ids: &[&str],
        value: i64,
    ) -> Result<(), LedgerError> {
        Self::require_positive(value)?;
        let dir = self.lock();
        let worker_slot = self.slot_of(&dir, worker)?;
        let treasury_slot = self.slot_of(&dir, TREASURY_DID)?;
        let creator_slot = self.slot_of(&dir, CREATOR_DID)?;

        let fee = self.rates.fee(value);
        self.account(worker_slot).credit_pending(value - fee)?;

        // Tenth of the fee is a half-share of the five-percent fee.
        let creator_share = fee / 10;
        let referrer_share = fee / 10;
        let close_pool = fee / 10;

        self.account(creator_slot).credit_pending(creator_share)?;

        let mut paid = creator_share;

        if let Some(slot) = referrer
            .filter(|r| *r != worker)
            .and_then(|r| dir.by_did.get(r).copied())
        {
            let acct = self.account(slot);
            acct.credit_pending(referrer_share)?;
            acct.set_from_referrals(acct.from_referrals()? + referrer_share as u64)?;
            paid += referrer_share;
        }

        let close_slots: Vec<usize> = close_ids
            .iter()
            .filter_map(|id| dir.by_did.get(*id).copied())
            .collect();
        if !close_slots.is_empty() {
            let per_id = close_pool / close_slots.len() as i64;
            for slot in close_slots {
                let acct = self.account(slot);
                acct.credit_pending(per_id)?;
                acct.set_from_close_ids(acct.from_close_ids()? + per_id as u64)?;
                paid += per_id;
            }
        }

        // Treasury takes its 3.5/5 plus every unpaid share and floor residue.
        self.account(treasury_slot).credit_pending(fee - paid)?;
        debug!(worker, value, fee, "yield distributed");
        Ok(())
    }

    /// Advances the ledger to epoch `epoch`: settles resource usage, runs
    /// the UBI drip, commits every account's pending fields, seals the
    /// committed snapshot, and signals `METRICS_EPOCH`.
    pub fn on_epoch(&self, epoch: u64) -> Result<(), LedgerError> {
        let dir = self.lock();
        let count = self.account_count()?;

        // 1. Settlement sweep over resource-metrics slots.
        for slot in 0..RESOURCE_SLOT_COUNT {
            let sample = ResourceSample::load(&self.shm, slot)?;
            if sample.compute_cycles == 0 {
                continue;
            }
            let index = sample.account_index as usize;
            if index >= count {
                warn!(slot, index, "usage sample for an unregistered account");
                ResourceSample::clear(&self.shm, slot)?;
                continue;
            }
            let devices = self.account(index).device_count()?;
            let delta = RatePolicy::device_scaled(self.rates.usage_delta(&sample), devices);
            self.settle_slot(index, delta, epoch)?;
            ResourceSample::clear(&self.shm, slot)?;
        }

        // 2. UBI drip from treasury, solvency-checked per recipient with the
        //    device-multiplied amount against a running budget. The budget is
        //    the treasury's spendable balance: same-epoch inflow is still
        //    pending and not yet spendable, for the treasury like anyone.
        if let Some(&treasury_slot) = dir.by_did.get(TREASURY_DID) {
            let creator_slot = dir.by_did.get(CREATOR_DID).copied();
            let treasury = self.account(treasury_slot);
            let mut available = treasury.balance()? + treasury.pending_balance()?.min(0);

            for slot in 0..count {
                if slot == treasury_slot || Some(slot) == creator_slot {
                    continue;
                }
                let acct = self.account(slot);
                let amount = RatePolicy::device_scaled(
                    self.rates.ubi_baseline as f64,
                    acct.device_count()?,
                );
                if amount <= 0 {
                    continue;
                }
                if available - amount < 0 {
                    debug!(slot, amount, available, "UBI drip skipped: treasury short");
                    continue;
                }
                available -= amount;
                treasury.debit_pending(amount)?;
                acct.credit_pending(amount)?;
                acct.set_last_ubi_claim(epoch as i64)?;
            }
        }

        // 3. Commit: fold pending motion into the committed fields.
        for slot in 0..count {
            let acct = self.account(slot);
            let pending_balance = acct.pending_balance()?;
            let pending_earned = acct.pending_earned()?;
            let pending_spent = acct.pending_spent()?;
            debug_assert_eq!(
                i128::from(pending_balance),
                i128::from(pending_earned) - i128::from(pending_spent),
                "pending identity broken before commit"
            );

            acct.set_balance(acct.balance()? + pending_balance)?;
            acct.set_earned_total(acct.earned_total()? + pending_earned)?;
            acct.set_spent_total(acct.spent_total()? + pending_spent)?;
            acct.set_pending_balance(0)?;
            acct.set_pending_earned(0)?;
            acct.set_pending_spent(0)?;
            acct.set_pending_epoch(0)?;
            acct.set_last_activity_epoch(epoch)?;
        }

        // 4. Seal the committed snapshot.
        let digest = self.hash_accounts()?;
        self.shm.write_u64(OFFSET_ECONOMICS + META_SEAL_EPOCH, epoch)?;
        self.shm.write_bytes(OFFSET_ECONOMICS + META_SEAL_HASH, &digest)?;

        drop(dir);
        // 5. Mark the metrics snapshot advanced (beats the heartbeat too).
        self.flags.signal(METRICS_EPOCH);
        debug!(epoch, accounts = count, "ledger epoch committed and sealed");
        Ok(())
    }

    fn hash_accounts(&self) -> Result<[u8; 32], LedgerError> {
        let bytes = self.shm.read_bytes(ACCOUNTS_BASE, ACCOUNTS_SIZE)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hasher.finalize().into())
    }

    /// The last seal: `(epoch, hash)`.
    pub fn seal(&self) -> Result<(u64, [u8; 32]), LedgerError> {
        let epoch = self.shm.read_u64(OFFSET_ECONOMICS + META_SEAL_EPOCH)?;
        let mut hash = [0u8; 32];
        let bytes = self.shm.read_bytes(OFFSET_ECONOMICS + META_SEAL_HASH, 32)?;
        hash.copy_from_slice(&bytes);
        Ok((epoch, hash))
    }

    /// Recomputes the accounts hash and compares it to the stored seal: any
    /// mutation of the committed snapshot since the last `on_epoch` is
    /// detectable.
    pub fn verify_seal(&self) -> Result<bool, LedgerError> {
        let (_, sealed) = self.seal()?;
        Ok(self.hash_accounts()? == sealed)
    }

    /// Sum of committed balances over all registered accounts.
    pub fn total_balance(&self) -> Result<i64, LedgerError> {
        let _dir = self.lock();
        let count = self.account_count()?;
        let mut total = 0i64;
        for slot in 0..count {
            total += self.account(slot).balance()?;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine").finish_non_exhaustive()
    }
}
