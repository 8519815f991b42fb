//! Settlement rates and the resource-metrics slot codec.

use crate::account::{ACCOUNTS_BASE, ACCOUNTS_SIZE};
use crate::error::LedgerError;
use inos_shm::layout::{OFFSET_ECONOMICS, SIZE_ECONOMICS};
use inos_shm::SharedRegion;

/// Size of one resource-metrics slot.
pub const RESOURCE_SLOT_SIZE: usize = 128;
/// Byte offset of the resource-metrics slots (after metadata and accounts).
pub const RESOURCE_SLOTS_BASE: usize = ACCOUNTS_BASE + ACCOUNTS_SIZE;
/// Number of resource-metrics slots carried by the Economics region.
pub const RESOURCE_SLOT_COUNT: usize =
    (OFFSET_ECONOMICS + SIZE_ECONOMICS - RESOURCE_SLOTS_BASE) / RESOURCE_SLOT_SIZE;

// Slot fields (relative to the slot base).
const F_ACCOUNT_INDEX: usize = 0;
const F_COMPUTE_CYCLES: usize = 8;
const F_BYTES_SERVED: usize = 16;
const F_BYTES_STORED: usize = 24;
const F_STORAGE_HOURS: usize = 32;
const F_UPTIME_SECONDS: usize = 36;
const F_LOCALITY: usize = 40;
const F_SYSCALLS: usize = 48;
const F_MEMORY_PRESSURE: usize = 56;
const F_REPLICATION: usize = 64;
const F_SCHEDULING: usize = 72;

/// One epoch's worth of resource usage attributed to an account.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub account_index: u32,
    pub compute_cycles: u64,
    pub bytes_served: u64,
    pub bytes_stored: u64,
    pub storage_hours: f32,
    pub uptime_seconds: f32,
    pub locality: f32,
    pub syscalls: u64,
    pub memory_pressure: f32,
    pub replication: u64,
    pub scheduling: u64,
}

#[inline]
fn slot_offset(slot: usize) -> usize {
    RESOURCE_SLOTS_BASE + slot * RESOURCE_SLOT_SIZE
}

impl ResourceSample {
    /// Decodes the slot at `slot`.
    pub fn load(shm: &SharedRegion, slot: usize) -> Result<Self, LedgerError> {
        let base = slot_offset(slot);
        Ok(Self {
            account_index: shm.read_u32(base + F_ACCOUNT_INDEX)?,
            compute_cycles: shm.read_u64(base + F_COMPUTE_CYCLES)?,
            bytes_served: shm.read_u64(base + F_BYTES_SERVED)?,
            bytes_stored: shm.read_u64(base + F_BYTES_STORED)?,
            storage_hours: shm.read_f32(base + F_STORAGE_HOURS)?,
            uptime_seconds: shm.read_f32(base + F_UPTIME_SECONDS)?,
            locality: shm.read_f32(base + F_LOCALITY)?,
            syscalls: shm.read_u64(base + F_SYSCALLS)?,
            memory_pressure: shm.read_f32(base + F_MEMORY_PRESSURE)?,
            replication: shm.read_u64(base + F_REPLICATION)?,
            scheduling: shm.read_u64(base + F_SCHEDULING)?,
        })
    }

    /// Encodes this sample into the slot at `slot`.
    pub fn store(&self, shm: &SharedRegion, slot: usize) -> Result<(), LedgerError> {
        let base = slot_offset(slot);
        shm.write_u32(base + F_ACCOUNT_INDEX, self.account_index)?;
        shm.write_u64(base + F_COMPUTE_CYCLES, self.compute_cycles)?;
        shm.write_u64(base + F_BYTES_SERVED, self.bytes_served)?;
        shm.write_u64(base + F_BYTES_STORED, self.bytes_stored)?;
        shm.write_f32(base + F_STORAGE_HOURS, self.storage_hours)?;
        shm.write_f32(base + F_UPTIME_SECONDS, self.uptime_seconds)?;
        shm.write_f32(base + F_LOCALITY, self.locality)?;
        shm.write_u64(base + F_SYSCALLS, self.syscalls)?;
        shm.write_f32(base + F_MEMORY_PRESSURE, self.memory_pressure)?;
        shm.write_u64(base + F_REPLICATION, self.replication)?;
        shm.write_u64(base + F_SCHEDULING, self.scheduling)?;
        Ok(())
    }

    /// Zeroes the slot at `slot` (after settlement).
    pub fn clear(shm: &SharedRegion, slot: usize) -> Result<(), LedgerError> {
        Ok(shm.fill_zero(slot_offset(slot), RESOURCE_SLOT_SIZE)?)
    }
}

/// Credit rates applied by the settlement sweep, plus the UBI baseline and
/// the protocol fee.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    /// Credits per compute cycle.
    pub r_cycles: f64,
    /// Credits per byte served.
    pub r_bytes_served: f64,
    /// Credits per byte-hour stored.
    pub r_bytes_stored: f64,
    /// Credits per uptime second.
    pub r_uptime: f64,
    /// Credits per locality point.
    pub r_locality: f64,
    /// Cost per syscall (scaled by memory pressure).
    pub r_syscalls: f64,
    /// Cost per replication event.
    pub r_replication: f64,
    /// Cost per scheduling event.
    pub r_scheduling: f64,
    /// Per-recipient UBI baseline in credits.
    pub ubi_baseline: i64,
    /// Protocol fee in basis points (500 = 5%).
    pub fee_bps: i64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            r_cycles: 1e-6,
            r_bytes_served: 1e-7,
            r_bytes_stored: 1e-9,
            r_uptime: 0.01,
            r_locality: 0.5,
            r_syscalls: 1e-5,
            r_replication: 0.001,
            r_scheduling: 0.0001,
            ubi_baseline: 1,
            fee_bps: 500,
        }
    }
}

impl RatePolicy {
    /// Raw earned − spent delta for one sample, before device scaling.
    pub fn usage_delta(&self, s: &ResourceSample) -> f64 {
        let earned = s.compute_cycles as f64 * self.r_cycles
            + s.bytes_served as f64 * self.r_bytes_served
            + s.bytes_stored as f64 * self.r_bytes_stored * f64::from(s.storage_hours)
            + f64::from(s.uptime_seconds) * self.r_uptime
            + f64::from(s.locality) * self.r_locality;
        let spent = s.syscalls as f64 * self.r_syscalls * (1.0 + f64::from(s.memory_pressure))
            + s.replication as f64 * self.r_replication
            + s.scheduling as f64 * self.r_scheduling;
        earned - spent
    }

    /// Scales a delta by the account's device count: `1 + n·0.001`.
    pub fn device_scaled(delta: f64, device_count: u16) -> i64 {
        (delta * (1.0 + f64::from(device_count) * 0.001)).floor() as i64
    }

    /// Protocol fee taken from a job value.
    pub fn fee(&self, value: i64) -> i64 {
        value * self.fee_bps / 10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn slot_table_fills_the_region_tail() {
        assert_eq!(RESOURCE_SLOT_COUNT, 191);
        const {
            assert!(
                RESOURCE_SLOTS_BASE + RESOURCE_SLOT_COUNT * RESOURCE_SLOT_SIZE
                    <= OFFSET_ECONOMICS + SIZE_ECONOMICS
            )
        };
    }

    #[test]
    fn sample_roundtrip() {
        let shm = Arc::new(SharedRegion::new(OFFSET_ECONOMICS + SIZE_ECONOMICS));
        let sample = ResourceSample {
            account_index: 5,
            compute_cycles: 1_000_000,
            bytes_served: 4096,
            bytes_stored: 1 << 20,
            storage_hours: 2.0,
            uptime_seconds: 3600.0,
            locality: 0.8,
            syscalls: 100,
            memory_pressure: 0.25,
            replication: 3,
            scheduling: 12,
        };
        sample.store(&shm, 7).unwrap();
        assert_eq!(ResourceSample::load(&shm, 7).unwrap(), sample);
        ResourceSample::clear(&shm, 7).unwrap();
        assert_eq!(ResourceSample::load(&shm, 7).unwrap(), ResourceSample::default());
    }

    #[test]
    fn usage_delta_matches_the_rate_formula() {
        let rates = RatePolicy::default();
        let sample = ResourceSample {
            compute_cycles: 2_000_000,
            uptime_seconds: 100.0,
            syscalls: 1000,
            memory_pressure: 1.0,
            ..Default::default()
        };
        // earned = 2.0 + 1.0, spent = 1000 * 1e-5 * 2 = 0.02
        let delta = rates.usage_delta(&sample);
        assert!((delta - 2.98).abs() < 1e-9);
        assert_eq!(RatePolicy::device_scaled(delta, 0), 2);
        // Device scaling nudges the floor over 3 at 10 devices: 2.98 * 1.01.
        assert_eq!(RatePolicy::device_scaled(delta, 10), 3);
    }

    #[test]
    fn fee_is_five_percent_floored() {
        let rates = RatePolicy::default();
        assert_eq!(rates.fee(1000), 50);
        assert_eq!(rates.fee(1019), 50);
        assert_eq!(rates.fee(19), 0);
    }
}
