//! Credit account codec over the Economics region.
//!
//! Accounts are 128-byte records packed little-endian at fixed byte offsets.
//! The byte layout is part of the cross-layer contract: every layer decodes
//! the same offsets, so nothing here is `repr(C)` — fields are moved byte by
//! byte through the region accessors.

use crate::error::LedgerError;
use inos_shm::layout::OFFSET_ECONOMICS;
use inos_shm::SharedRegion;

/// Size of one account record.
pub const ACCOUNT_SIZE: usize = 128;
/// Fixed ceiling of the account registry.
pub const MAX_ACCOUNTS: usize = 64;
/// Economics metadata block preceding the account table.
pub const METADATA_SIZE: usize = 64;

/// Byte offset of the account table inside the buffer.
pub const ACCOUNTS_BASE: usize = OFFSET_ECONOMICS + METADATA_SIZE;
/// Total account table size.
pub const ACCOUNTS_SIZE: usize = MAX_ACCOUNTS * ACCOUNT_SIZE;

// Metadata fields (relative to OFFSET_ECONOMICS).
pub(crate) const META_SEAL_EPOCH: usize = 0;
pub(crate) const META_SEAL_HASH: usize = 8;
pub(crate) const META_ACCOUNT_COUNT: usize = 40;

// Account fields (relative to the account base).
const F_BALANCE: usize = 0;
const F_EARNED_TOTAL: usize = 8;
const F_SPENT_TOTAL: usize = 16;
const F_LAST_ACTIVITY_EPOCH: usize = 24;
const F_REPUTATION: usize = 32;
const F_DEVICE_COUNT: usize = 36;
const F_UPTIME_SCORE: usize = 38;
const F_LAST_UBI_CLAIM: usize = 42;
const F_REFERRER_LOCKED_AT: usize = 50;
const F_REFERRER_CHANGED_AT: usize = 58;
const F_FROM_CREATOR: usize = 66;
const F_FROM_REFERRALS: usize = 74;
const F_FROM_CLOSE_IDS: usize = 82;
const F_THRESHOLD: usize = 90;
const F_TOTAL_SHARES: usize = 91;
const F_TIER: usize = 92;
const F_PENDING_BALANCE: usize = 96;
const F_PENDING_EPOCH: usize = 104;
const F_PENDING_EARNED: usize = 112;
const F_PENDING_SPENT: usize = 120;

/// Byte offset of the account at `slot`.
#[inline]
pub fn account_offset(slot: usize) -> usize {
    ACCOUNTS_BASE + slot * ACCOUNT_SIZE
}

/// Typed accessor over one account record.
#[derive(Clone, Copy)]
pub struct AccountRef<'a> {
    shm: &'a SharedRegion,
    base: usize,
}

macro_rules! field_u64 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> Result<u64, LedgerError> {
            Ok(self.shm.read_u64(self.base + $off)?)
        }
        pub fn $set(&self, v: u64) -> Result<(), LedgerError> {
            Ok(self.shm.write_u64(self.base + $off, v)?)
        }
    };
}

macro_rules! field_i64 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> Result<i64, LedgerError> {
            Ok(self.shm.read_i64(self.base + $off)?)
        }
        pub fn $set(&self, v: i64) -> Result<(), LedgerError> {
            Ok(self.shm.write_i64(self.base + $off, v)?)
        }
    };
}

impl<'a> AccountRef<'a> {
    pub fn at_slot(shm: &'a SharedRegion, slot: usize) -> Self {
        Self {
            shm,
            base: account_offset(slot),
        }
    }

    field_i64!(balance, set_balance, F_BALANCE);
    field_u64!(earned_total, set_earned_total, F_EARNED_TOTAL);
    field_u64!(spent_total, set_spent_total, F_SPENT_TOTAL);
    field_u64!(last_activity_epoch, set_last_activity_epoch, F_LAST_ACTIVITY_EPOCH);
    field_i64!(last_ubi_claim, set_last_ubi_claim, F_LAST_UBI_CLAIM);
    field_i64!(referrer_locked_at, set_referrer_locked_at, F_REFERRER_LOCKED_AT);
    field_i64!(referrer_changed_at, set_referrer_changed_at, F_REFERRER_CHANGED_AT);
    field_u64!(from_creator, set_from_creator, F_FROM_CREATOR);
    field_u64!(from_referrals, set_from_referrals, F_FROM_REFERRALS);
    field_u64!(from_close_ids, set_from_close_ids, F_FROM_CLOSE_IDS);
    field_i64!(pending_balance, set_pending_balance, F_PENDING_BALANCE);
    field_u64!(pending_epoch, set_pending_epoch, F_PENDING_EPOCH);
    field_u64!(pending_earned, set_pending_earned, F_PENDING_EARNED);
    field_u64!(pending_spent, set_pending_spent, F_PENDING_SPENT);

    pub fn reputation(&self) -> Result<f32, LedgerError> {
        Ok(self.shm.read_f32(self.base + F_REPUTATION)?)
    }

    pub fn set_reputation(&self, v: f32) -> Result<(), LedgerError> {
        Ok(self.shm.write_f32(self.base + F_REPUTATION, v)?)
    }

    pub fn device_count(&self) -> Result<u16, LedgerError> {
        Ok(self.shm.read_u16(self.base + F_DEVICE_COUNT)?)
    }

    pub fn set_device_count(&self, v: u16) -> Result<(), LedgerError> {
        Ok(self.shm.write_u16(self.base + F_DEVICE_COUNT, v)?)
    }

    pub fn uptime_score(&self) -> Result<f32, LedgerError> {
        Ok(self.shm.read_f32(self.base + F_UPTIME_SCORE)?)
    }

    pub fn set_uptime_score(&self, v: f32) -> Result<(), LedgerError> {
        Ok(self.shm.write_f32(self.base + F_UPTIME_SCORE, v)?)
    }

    pub fn threshold(&self) -> Result<u8, LedgerError> {
        Ok(self.shm.read_u8(self.base + F_THRESHOLD)?)
    }

    pub fn set_threshold(&self, v: u8) -> Result<(), LedgerError> {
        Ok(self.shm.write_u8(self.base + F_THRESHOLD, v)?)
    }

    pub fn total_shares(&self) -> Result<u8, LedgerError> {
        Ok(self.shm.read_u8(self.base + F_TOTAL_SHARES)?)
    }

    pub fn set_total_shares(&self, v: u8) -> Result<(), LedgerError> {
        Ok(self.shm.write_u8(self.base + F_TOTAL_SHARES, v)?)
    }

    pub fn tier(&self) -> Result<u8, LedgerError> {
        Ok(self.shm.read_u8(self.base + F_TIER)?)
    }

    pub fn set_tier(&self, v: u8) -> Result<(), LedgerError> {
        Ok(self.shm.write_u8(self.base + F_TIER, v)?)
    }

    /// Zeroes the whole record.
    pub fn clear(&self) -> Result<(), LedgerError> {
        Ok(self.shm.fill_zero(self.base, ACCOUNT_SIZE)?)
    }

    /// Credits pending earnings (and the pending balance with them).
    pub fn credit_pending(&self, amount: i64) -> Result<(), LedgerError> {
        self.set_pending_earned(self.pending_earned()? + amount as u64)?;
        self.set_pending_balance(self.pending_balance()? + amount)
    }

    /// Debits pending spending (and the pending balance with it).
    pub fn debit_pending(&self, amount: i64) -> Result<(), LedgerError> {
        self.set_pending_spent(self.pending_spent()? + amount as u64)?;
        self.set_pending_balance(self.pending_balance()? - amount)
    }

    /// Decodes the full record (observability, tests).
    pub fn load(&self) -> Result<AccountSnapshot, LedgerError> {
        Ok(AccountSnapshot {
            balance: self.balance()?,
            earned_total: self.earned_total()?,
            spent_total: self.spent_total()?,
            last_activity_epoch: self.last_activity_epoch()?,
            reputation: self.reputation()?,
            device_count: self.device_count()?,
            uptime_score: self.uptime_score()?,
            last_ubi_claim: self.last_ubi_claim()?,
            referrer_locked_at: self.referrer_locked_at()?,
            referrer_changed_at: self.referrer_changed_at()?,
            from_creator: self.from_creator()?,
            from_referrals: self.from_referrals()?,
            from_close_ids: self.from_close_ids()?,
            threshold: self.threshold()?,
            total_shares: self.total_shares()?,
            tier: self.tier()?,
            pending_balance: self.pending_balance()?,
            pending_epoch: self.pending_epoch()?,
            pending_earned: self.pending_earned()?,
            pending_spent: self.pending_spent()?,
        })
    }
}

/// Decoded copy of one account record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccountSnapshot {
    pub balance: i64,
    pub earned_total: u64,
    pub spent_total: u64,
    pub last_activity_epoch: u64,
    pub reputation: f32,
    pub device_count: u16,
    pub uptime_score: f32,
    pub last_ubi_claim: i64,
    pub referrer_locked_at: i64,
    pub referrer_changed_at: i64,
    pub from_creator: u64,
    pub from_referrals: u64,
    pub from_close_ids: u64,
    pub threshold: u8,
    pub total_shares: u8,
    pub tier: u8,
    pub pending_balance: i64,
    pub pending_epoch: u64,
    pub pending_earned: u64,
    pub pending_spent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use inos_shm::layout::{OFFSET_ECONOMICS, SIZE_ECONOMICS};
    use std::sync::Arc;

    #[test]
    fn account_table_fits_the_economics_region() {
        const { assert!(METADATA_SIZE + ACCOUNTS_SIZE <= SIZE_ECONOMICS) };
    }

    #[test]
    fn field_offsets_pack_into_one_record() {
        const { assert!(F_PENDING_SPENT + 8 == ACCOUNT_SIZE) };
        // Attribution block stays inside the first 96 bytes.
        const { assert!(F_TIER < F_PENDING_BALANCE) };
    }

    #[test]
    fn record_roundtrip_through_the_region() {
        let shm = Arc::new(inos_shm::SharedRegion::new(OFFSET_ECONOMICS + SIZE_ECONOMICS));
        let acct = AccountRef::at_slot(&shm, 3);
        acct.set_balance(-500).unwrap();
        acct.set_earned_total(1000).unwrap();
        acct.set_spent_total(1500).unwrap();
        acct.set_device_count(7).unwrap();
        acct.set_uptime_score(0.75).unwrap();
        acct.set_pending_balance(-25).unwrap();
        acct.set_pending_spent(25).unwrap();
        acct.set_tier(2).unwrap();

        let snap = acct.load().unwrap();
        assert_eq!(snap.balance, -500);
        assert_eq!(snap.earned_total, 1000);
        assert_eq!(snap.spent_total, 1500);
        assert_eq!(snap.device_count, 7);
        assert_eq!(snap.uptime_score, 0.75);
        assert_eq!(snap.pending_balance, -25);
        assert_eq!(snap.pending_spent, 25);
        assert_eq!(snap.tier, 2);

        // A neighbouring slot is untouched.
        assert_eq!(AccountRef::at_slot(&shm, 2).load().unwrap(), AccountSnapshot::default());
        assert_eq!(AccountRef::at_slot(&shm, 4).load().unwrap(), AccountSnapshot::default());

        acct.clear().unwrap();
        assert_eq!(acct.load().unwrap(), AccountSnapshot::default());
    }

    #[test]
    fn pending_helpers_keep_the_signed_identity() {
        let shm = Arc::new(inos_shm::SharedRegion::new(OFFSET_ECONOMICS + SIZE_ECONOMICS));
        let acct = AccountRef::at_slot(&shm, 0);
        acct.credit_pending(100).unwrap();
        acct.debit_pending(30).unwrap();
        let snap = acct.load().unwrap();
        assert_eq!(snap.pending_balance, 70);
        assert_eq!(snap.pending_earned, 100);
        assert_eq!(snap.pending_spent, 30);
        assert_eq!(
            snap.pending_balance,
            snap.pending_earned as i64 - snap.pending_spent as i64
        );
    }
}
