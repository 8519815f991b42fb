//! INOS credit ledger.
//!
//! Credit accounts live entirely inside the shared Economics region as
//! 128-byte packed records. All credit motion is two-phase: operations write
//! into an account's pending fields, and [`LedgerEngine::on_epoch`] commits
//! every account, runs the UBI drip, and seals the committed snapshot with a
//! SHA-256 hash stamped with the epoch.
//!
//! Invariants maintained here:
//!
//! - `pending_balance == pending_earned − pending_spent` (signed), always;
//! - `balance == earned_total − spent_total` after every commit;
//! - yield distribution neither creates nor destroys credits: the 5%
//!   protocol fee splits exactly, with floor residues accruing to treasury;
//! - the seal hash uniquely identifies the committed accounts snapshot.

mod account;
mod engine;
mod error;
mod rates;

pub use account::{
    account_offset, AccountRef, AccountSnapshot, ACCOUNTS_BASE, ACCOUNTS_SIZE, ACCOUNT_SIZE,
    MAX_ACCOUNTS, METADATA_SIZE,
};
pub use engine::{LedgerEngine, CREATOR_DID, TREASURY_DID};
pub use error::LedgerError;
pub use rates::{
    RatePolicy, ResourceSample, RESOURCE_SLOTS_BASE, RESOURCE_SLOT_COUNT, RESOURCE_SLOT_SIZE,
};
