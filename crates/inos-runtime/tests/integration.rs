//! End-to-end scenarios over the bridge facade: host ⇄ kernel ⇄ module
//! traffic through the shared region, with the supervisor in the middle.

use async_trait::async_trait;
use inos_runtime::{
    layout, Bridge, Job, JobExecutor, JobRecord, RegionId, ResultRecord, Role, ShmConfig,
    Supervisor, SupervisorConfig, WaitOutcome, CREATOR_DID, TREASURY_DID,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Sha256LenExecutor;

#[async_trait]
impl JobExecutor for Sha256LenExecutor {
    async fn execute(&self, job: &JobRecord) -> Result<Vec<u8>, String> {
        // Stand-in for a real compute module: input length, little-endian.
        Ok((job.input.len() as u32).to_le_bytes().to_vec())
    }
}

#[test]
fn producer_consumer_echo_counts_dirty_flag_and_heartbeat() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let dirty_before = bridge.atomic_load(layout::OUTBOX_HOST_DIRTY);
    let epoch_before = bridge.atomic_load(layout::SYSTEM_EPOCH);

    bridge.outbox_host().enqueue(&[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(bridge.outbox_host().dequeue().unwrap(), vec![0x01, 0x02, 0x03]);

    assert_eq!(bridge.atomic_load(layout::OUTBOX_HOST_DIRTY), dirty_before + 1);
    assert_eq!(bridge.atomic_load(layout::SYSTEM_EPOCH), epoch_before + 1);
}

#[tokio::test]
async fn job_travels_host_to_kernel_and_back() {
    init_tracing();
    let bridge = Arc::new(Bridge::init(ShmConfig::default()).unwrap());

    let supervisor = Supervisor::builder(
        SupervisorConfig::default().with_capabilities(["measure"]),
        Arc::new(Sha256LenExecutor),
    )
    .with_flags(Arc::clone(bridge.flags()))
    .spawn();

    // Host side: publish a job and remember where the outbox stood.
    let outbox_seen = bridge.atomic_load(layout::OUTBOX_HOST_DIRTY);
    let job = JobRecord::new("job-42", "measure", "len", vec![7; 24]);
    bridge.write_job(&job).unwrap();

    // Kernel side: drain the inbox, execute, publish the result.
    let picked = bridge.read_job().unwrap().expect("job visible in the inbox");
    assert_eq!(picked, job);
    let handle = supervisor
        .submit(Job::with_timeout(picked, Duration::from_secs(5)))
        .await
        .unwrap();
    let result = handle.wait().await;
    assert!(result.is_success());
    bridge.write_result(&result).unwrap();

    // Host side again: wake on the outbox dirty flag and read the result.
    let outcome = bridge
        .wait_for_outbox(outbox_seen, Duration::from_secs(5))
        .await;
    assert!(outcome.changed());
    let read_back = bridge.read_result().unwrap().expect("result in the outbox");
    assert_eq!(read_back.job_id, "job-42");
    assert_eq!(read_back.output, 24u32.to_le_bytes().to_vec());

    supervisor.shutdown().await;
}

#[test]
fn malformed_inbox_frame_is_a_serialization_error() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    bridge.inbox().enqueue(b"definitely not json").unwrap();
    assert!(bridge.read_job().is_err());
    // The ring is drained; the poisoned frame is not retried.
    assert!(bridge.read_job().unwrap().is_none());
}

#[test]
fn guard_rejection_preserves_the_holder() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();

    let held = bridge
        .acquire_region_write(RegionId::SupervisorHeaders, Role::Kernel)
        .unwrap();
    let violations_before = bridge.guards().violations(RegionId::SupervisorHeaders);

    let err = bridge
        .acquire_region_write(RegionId::SupervisorHeaders, Role::Kernel)
        .unwrap_err();
    assert!(matches!(err, inos_shm::GuardError::Locked { .. }));
    assert_eq!(
        bridge.guards().violations(RegionId::SupervisorHeaders),
        violations_before + 1
    );
    assert_eq!(
        bridge.guards().lock_owner(RegionId::SupervisorHeaders),
        Role::Kernel.bit()
    );

    held.release().unwrap();
    assert_eq!(bridge.guards().lock_owner(RegionId::SupervisorHeaders), 0);
}

#[test]
fn ledger_reached_through_the_bridge_distributes_and_seals() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let ledger = bridge.ledger();

    for did in ["did:inos:worker", TREASURY_DID, CREATOR_DID, "did:inos:referrer"] {
        ledger.register(did).unwrap();
    }
    ledger
        .distribute_yield("did:inos:worker", Some("did:inos:referrer"), &[], 1000)
        .unwrap();

    let metrics_before = bridge.atomic_load(layout::METRICS_EPOCH);
    ledger.on_epoch(1).unwrap();
    assert_eq!(bridge.atomic_load(layout::METRICS_EPOCH), metrics_before + 1);

    assert_eq!(ledger.get_balance("did:inos:worker").unwrap(), 950);
    assert_eq!(ledger.get_balance(TREASURY_DID).unwrap(), 40);
    assert_eq!(ledger.get_balance(CREATOR_DID).unwrap(), 5);
    assert_eq!(ledger.get_balance("did:inos:referrer").unwrap(), 5);
    assert!(ledger.verify_seal().unwrap());
}

#[test]
fn arena_slices_are_usable_through_raw_access() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let offset = bridge.arena().alloc(64, 8).unwrap();
    bridge.write_raw(offset, &[0xEE; 64]).unwrap();
    assert_eq!(bridge.read_raw(offset, 64).unwrap(), vec![0xEE; 64]);

    let again = bridge.arena().alloc(16, 8).unwrap();
    assert!(again >= offset + 64);
}

#[tokio::test]
async fn module_frames_flow_through_the_kernel_outbox() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let seen = bridge.atomic_load(layout::OUTBOX_KERNEL_DIRTY);

    bridge.push_kernel(&[0xCA, 0xFE]).unwrap();
    let outcome = bridge
        .flags()
        .wait(layout::OUTBOX_KERNEL_DIRTY, seen, Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, WaitOutcome::Changed(_)));
    assert_eq!(bridge.pull_kernel().unwrap(), vec![0xCA, 0xFE]);
}

#[test]
fn oversize_job_surfaces_ring_backpressure() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let huge = JobRecord::new("big", "measure", "len", vec![0; bridge.inbox().max_payload()]);
    let err = bridge.write_job(&huge).unwrap_err();
    assert!(matches!(
        err,
        inos_runtime::BridgeError::Ring(inos_shm::RingError::Oversize { .. })
    ));
}

#[test]
fn results_mirror_failures_without_throwing() {
    init_tracing();
    let bridge = Bridge::init(ShmConfig::default()).unwrap();
    let failed = ResultRecord::failure("job-9", "deadline expired");
    bridge.write_result(&failed).unwrap();
    let read_back = bridge.read_result().unwrap().unwrap();
    assert!(!read_back.is_success());
    assert_eq!(read_back.error_message, "deadline expired");
}
