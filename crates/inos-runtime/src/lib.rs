//! INOS supervisor runtime and bridge facade.
//!
//! Sits on top of [`inos_shm`] (region, flags, rings, guards) and
//! [`inos_ledger`] (credit accounts) and adds the process-local runtime: the
//! job/result wire codec, per-capability supervisors whose maintenance loops
//! ride the `SYSTEM_EPOCH` master heartbeat, the delegation seam toward the
//! peer mesh, and the [`Bridge`] facade that owns the whole core and is
//! passed explicitly into every component.

mod bridge;
mod delegate;
mod job;
mod shutdown;
mod supervisor;

pub use bridge::{Bridge, BridgeError};
pub use delegate::{DelegateError, MeshDelegator, NoMesh};
pub use job::{
    decode_job, decode_result, encode_job, encode_result, Job, JobRecord, JobStatus, ResultRecord,
    WireError,
};
pub use shutdown::ShutdownSignal;
pub use supervisor::{
    HealthStatus, JobExecutor, LearningHook, ResultHandle, SubmitError, Supervisor,
    SupervisorBuilder, SupervisorConfig, SupervisorMetrics,
};

// Re-export the pieces callers need to drive the core without naming the
// lower crates.
pub use inos_ledger::{LedgerEngine, RatePolicy, CREATOR_DID, TREASURY_DID};
pub use inos_shm::{layout, RegionId, Role, ShmConfig, SizeTier, WaitOutcome};
