//! Per-capability supervisor runtime.
//!
//! A supervisor owns a bounded job queue and four cooperative tasks: the
//! schedule loop (validate → execute → record), and three maintenance loops
//! (monitor, health, learning) that suspend on the `SYSTEM_EPOCH` master
//! heartbeat and act when the epoch delta reaches their threshold. When no
//! shared region is attached (test harnesses), the maintenance loops fall
//! back to wall-clock intervals with identical externally visible behaviour.

use crate::delegate::MeshDelegator;
use crate::job::{Job, JobRecord, ResultRecord};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use inos_shm::layout::SYSTEM_EPOCH;
use inos_shm::{EpochFlags, WaitOutcome};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Executes the operations a supervisor advertises.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs one job; the error string becomes the result's `error_message`.
    async fn execute(&self, job: &JobRecord) -> Result<Vec<u8>, String>;
}

/// Invoked at the learning cadence. The actual learning logic is an
/// external collaborator; the supervisor only drives the rhythm.
#[async_trait]
pub trait LearningHook: Send + Sync {
    async fn on_cycle(&self, epoch: u64);
}

/// Configuration for one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Capability tags this supervisor executes (matched against
    /// `JobRecord::library`).
    pub capabilities: Vec<String>,
    /// Bounded job queue depth.
    pub queue_depth: usize,
    /// How long `submit` waits for queue space before `QueueFull`.
    pub submit_timeout: Duration,
    /// Epoch deltas that trigger each maintenance loop.
    pub monitor_threshold: u32,
    pub health_threshold: u32,
    pub learning_threshold: u32,
    /// Wall-clock fallbacks when no shared region is attached.
    pub monitor_interval: Duration,
    pub health_interval: Duration,
    pub learning_interval: Duration,
    /// Security predicate: largest accepted job input.
    pub max_input_bytes: usize,
    /// Rolling latency window size.
    pub latency_window: usize,
    /// Bounded result cache size (keyed by job id).
    pub result_cache: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            queue_depth: 256,
            submit_timeout: Duration::from_millis(100),
            monitor_threshold: 10,
            health_threshold: 100,
            learning_threshold: 1000,
            monitor_interval: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            learning_interval: Duration::from_secs(60),
            max_input_bytes: 1 << 20,
            latency_window: 1000,
            result_cache: 256,
        }
    }
}

impl SupervisorConfig {
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }
}

/// Why a submission was rejected synchronously. Everything that happens to
/// an *accepted* job is reported through its [`ResultRecord`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The bounded queue did not drain within the submit timeout.
    #[error("job queue is full")]
    QueueFull,
    /// The job's deadline had already passed at submission.
    #[error("deadline already expired")]
    DeadlineExpired,
    /// The supervisor is shut down.
    #[error("supervisor is shut down")]
    ShutDown,
}

/// Future side of a submitted job.
#[derive(Debug)]
pub struct ResultHandle {
    job_id: String,
    rx: oneshot::Receiver<ResultRecord>,
}

impl ResultHandle {
    /// The id of the job this handle tracks.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Resolves to the job's result. A supervisor that dies mid-flight
    /// resolves the handle with a cancelled failure rather than an error.
    pub async fn wait(self) -> ResultRecord {
        match self.rx.await {
            Ok(record) => record,
            Err(_) => ResultRecord::failure(self.job_id, "cancelled"),
        }
    }
}

/// Point-in-time supervisor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorMetrics {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub queue_depth: usize,
    pub latency_samples: usize,
    pub avg_latency_ns: u64,
    pub max_latency_ns: u64,
    pub monitor_cycles: u64,
    pub health_cycles: u64,
    pub learning_cycles: u64,
}

/// Outcome of the health probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub queue_depth: usize,
    pub failure_rate: f64,
}

struct Queued {
    job: Job,
    reply: oneshot::Sender<ResultRecord>,
}

#[derive(Clone, Copy)]
enum Cadence {
    Monitor,
    Health,
    Learning,
}

impl Cadence {
    fn name(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Health => "health",
            Self::Learning => "learning",
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    capabilities: HashSet<String>,
    executor: Arc<dyn JobExecutor>,
    delegator: Option<Arc<dyn MeshDelegator>>,
    learning: Option<Arc<dyn LearningHook>>,
    flags: Option<Arc<EpochFlags>>,
    shutdown: ShutdownSignal,
    job_tx: mpsc::Sender<Queued>,

    // Statistical counters: Relaxed ordering throughout, nothing
    // synchronizes on them.
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    monitor_cycles: AtomicU64,
    health_cycles: AtomicU64,
    learning_cycles: AtomicU64,

    latencies: Mutex<VecDeque<Duration>>,
    results: Mutex<ResultCache>,
    last_health: Mutex<Option<HealthStatus>>,
    last_metrics: Mutex<SupervisorMetrics>,
}

struct ResultCache {
    by_id: HashMap<String, ResultRecord>,
    order: VecDeque<String>,
    cap: usize,
}

impl ResultCache {
    fn new(cap: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, record: ResultRecord) {
        if self.cap == 0 {
            return;
        }
        if self.by_id.insert(record.job_id.clone(), record.clone()).is_none() {
            self.order.push_back(record.job_id);
            if self.order.len() > self.cap {
                if let Some(oldest) = self.order.pop_front() {
                    self.by_id.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, job_id: &str) -> Option<ResultRecord> {
        self.by_id.get(job_id).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builder for a [`Supervisor`].
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    executor: Arc<dyn JobExecutor>,
    flags: Option<Arc<EpochFlags>>,
    delegator: Option<Arc<dyn MeshDelegator>>,
    learning: Option<Arc<dyn LearningHook>>,
}

impl SupervisorBuilder {
    /// Attaches the shared region's flags; maintenance loops become
    /// epoch-driven instead of wall-clock driven.
    pub fn with_flags(mut self, flags: Arc<EpochFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn MeshDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn with_learning(mut self, hook: Arc<dyn LearningHook>) -> Self {
        self.learning = Some(hook);
        self
    }

    /// Spawns the supervisor's four tasks on the current tokio runtime.
    pub fn spawn(self) -> Supervisor {
        let (job_tx, job_rx) = mpsc::channel(self.config.queue_depth);
        let capabilities: HashSet<String> = self.config.capabilities.iter().cloned().collect();

        let inner = Arc::new(Inner {
            capabilities,
            executor: self.executor,
            delegator: self.delegator,
            learning: self.learning,
            flags: self.flags,
            shutdown: ShutdownSignal::new(),
            job_tx,
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            monitor_cycles: AtomicU64::new(0),
            health_cycles: AtomicU64::new(0),
            learning_cycles: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::new()),
            results: Mutex::new(ResultCache::new(self.config.result_cache)),
            last_health: Mutex::new(None),
            last_metrics: Mutex::new(SupervisorMetrics::default()),
            config: self.config,
        });

        info!(
            capabilities = ?inner.config.capabilities,
            epoch_driven = inner.flags.is_some(),
            "supervisor starting"
        );

        let tasks = vec![
            tokio::spawn(Supervisor::schedule_loop(Arc::clone(&inner), job_rx)),
            tokio::spawn(Supervisor::cadence_loop(Arc::clone(&inner), Cadence::Monitor)),
            tokio::spawn(Supervisor::cadence_loop(Arc::clone(&inner), Cadence::Health)),
            tokio::spawn(Supervisor::cadence_loop(Arc::clone(&inner), Cadence::Learning)),
        ];

        Supervisor {
            inner,
            tasks: Mutex::new(tasks),
        }
    }
}

/// A per-capability worker: bounded scheduling, epoch-driven maintenance,
/// latency accounting, cooperative shutdown.
pub struct Supervisor {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Starts building a supervisor around an executor.
    pub fn builder(config: SupervisorConfig, executor: Arc<dyn JobExecutor>) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            executor,
            flags: None,
            delegator: None,
            learning: None,
        }
    }

    // ---------------------------------------------------------------------
    // SUBMISSION
    // ---------------------------------------------------------------------

    /// Submits a job. Non-blocking up to the configured submit timeout; a
    /// queue that stays full maps to `QueueFull`, an already-expired
    /// deadline is rejected synchronously.
    pub async fn submit(&self, job: Job) -> Result<ResultHandle, SubmitError> {
        if self.inner.shutdown.is_triggered() {
            return Err(SubmitError::ShutDown);
        }
        if job.expired() {
            return Err(SubmitError::DeadlineExpired);
        }

        let (reply, rx) = oneshot::channel();
        let job_id = job.record.job_id.clone();
        match self
            .inner
            .job_tx
            .send_timeout(Queued { job, reply }, self.inner.config.submit_timeout)
            .await
        {
            Ok(()) => {
                self.inner.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(ResultHandle { job_id, rx })
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SubmitError::ShutDown),
        }
    }

    /// Submits a batch; each job is accepted or rejected independently.
    pub async fn submit_batch(&self, jobs: Vec<Job>) -> Vec<Result<ResultHandle, SubmitError>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            handles.push(self.submit(job).await);
        }
        handles
    }

    /// Delegates a job to a peer through the mesh. Failure is a normal
    /// result with a populated error, never an `Err`.
    pub async fn coordinate(&self, job: Job) -> ResultRecord {
        let job_id = job.record.job_id.clone();
        let library = job.record.library.clone();
        match &self.inner.delegator {
            Some(delegator) => match delegator.delegate(job.record).await {
                Ok(record) => record,
                Err(e) => ResultRecord::failure(job_id, e.to_string()),
            },
            None => ResultRecord::failure(job_id, format!("no route to capability {library}")),
        }
    }

    /// Looks up a recently completed result by job id.
    pub fn result_of(&self, job_id: &str) -> Option<ResultRecord> {
        lock(&self.inner.results).get(job_id)
    }

    // ---------------------------------------------------------------------
    // OBSERVABILITY
    // ---------------------------------------------------------------------

    /// Compiles a fresh metrics snapshot.
    pub fn metrics(&self) -> SupervisorMetrics {
        Self::compile_metrics(&self.inner)
    }

    /// The snapshot compiled by the last monitor cycle.
    pub fn last_monitor_snapshot(&self) -> SupervisorMetrics {
        *lock(&self.inner.last_metrics)
    }

    /// The last health probe (fresh probe if none ran yet).
    pub fn health(&self) -> HealthStatus {
        lock(&self.inner.last_health)
            .clone()
            .unwrap_or_else(|| Self::probe_health(&self.inner))
    }

    /// Cooperative shutdown: cancels all loops, drains queued jobs with a
    /// cancelled result, and waits for the tasks to exit. A running execute
    /// is never preempted — it finishes first.
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("supervisor stopped");
    }

    // ---------------------------------------------------------------------
    // SCHEDULE LOOP
    // ---------------------------------------------------------------------

    async fn schedule_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Queued>) {
        loop {
            tokio::select! {
                biased;
                () = inner.shutdown.triggered() => break,
                next = rx.recv() => match next {
                    Some(queued) => Self::process(&inner, queued).await,
                    None => break,
                },
            }
        }

        // Drain whatever is still queued with a cancelled result.
        rx.close();
        while let Ok(queued) = rx.try_recv() {
            inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
            let _ = queued
                .reply
                .send(ResultRecord::failure(queued.job.record.job_id.clone(), "cancelled"));
        }
    }

    async fn process(inner: &Arc<Inner>, queued: Queued) {
        let Queued { job, reply } = queued;
        let job_id = job.record.job_id.clone();

        // Deadline may have expired while the job sat in the queue.
        if job.expired() {
            inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
            debug!(%job_id, "dropping job queued past its deadline");
            let _ = reply.send(ResultRecord::failure(job_id, "deadline expired"));
            return;
        }

        if let Err(message) = Self::validate(inner, &job.record) {
            inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
            warn!(%job_id, reason = %message, "job rejected by validation");
            let _ = reply.send(ResultRecord::failure(job_id, message));
            return;
        }

        let start = Instant::now();
        let outcome = inner.executor.execute(&job.record).await;
        let elapsed = start.elapsed();
        Self::record_latency(inner, elapsed);

        let record = match outcome {
            Ok(output) => {
                inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
                ResultRecord::success(job_id, output, elapsed.as_nanos() as u64)
            }
            Err(message) => {
                inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
                ResultRecord::failure(job_id, message)
            }
        };

        lock(&inner.results).insert(record.clone());
        let _ = reply.send(record);
    }

    /// The security predicate applied before execution.
    fn validate(inner: &Inner, record: &JobRecord) -> Result<(), String> {
        if !inner.capabilities.contains(&record.library) {
            return Err(format!("unsupported capability: {}", record.library));
        }
        if record.input.len() > inner.config.max_input_bytes {
            return Err(format!(
                "input of {} bytes exceeds the {} byte limit",
                record.input.len(),
                inner.config.max_input_bytes
            ));
        }
        if record.job_id.is_empty() {
            return Err("empty job id".to_string());
        }
        Ok(())
    }

    fn record_latency(inner: &Inner, elapsed: Duration) {
        let mut window = lock(&inner.latencies);
        window.push_back(elapsed);
        while window.len() > inner.config.latency_window {
            window.pop_front();
        }
    }

    // ---------------------------------------------------------------------
    // MAINTENANCE LOOPS
    // ---------------------------------------------------------------------

    async fn cadence_loop(inner: Arc<Inner>, cadence: Cadence) {
        let (threshold, fallback) = match cadence {
            Cadence::Monitor => (inner.config.monitor_threshold, inner.config.monitor_interval),
            Cadence::Health => (inner.config.health_threshold, inner.config.health_interval),
            Cadence::Learning => (inner.config.learning_threshold, inner.config.learning_interval),
        };

        match inner.flags.clone() {
            Some(flags) => {
                let mut seen = flags.read(SYSTEM_EPOCH);
                let mut last_acted = seen;
                loop {
                    tokio::select! {
                        biased;
                        () = inner.shutdown.triggered() => break,
                        outcome = flags.wait(SYSTEM_EPOCH, seen, Duration::from_secs(1)) => {
                            if let WaitOutcome::Changed(current) = outcome {
                                seen = current;
                                if current.wrapping_sub(last_acted) >= threshold {
                                    last_acted = current;
                                    Self::run_cycle(&inner, cadence, u64::from(current)).await;
                                }
                            }
                        },
                    }
                }
            }
            None => {
                // Harness fallback: same behaviour on a wall-clock rhythm.
                let mut ticker = tokio::time::interval(fallback);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // completes immediately
                let mut ticks = 0u64;
                loop {
                    tokio::select! {
                        biased;
                        () = inner.shutdown.triggered() => break,
                        _ = ticker.tick() => {
                            ticks += 1;
                            Self::run_cycle(&inner, cadence, ticks).await;
                        },
                    }
                }
            }
        }
        trace!(cadence = cadence.name(), "maintenance loop stopped");
    }

    async fn run_cycle(inner: &Arc<Inner>, cadence: Cadence, epoch: u64) {
        match cadence {
            Cadence::Monitor => {
                let snapshot = Self::compile_metrics(inner);
                *lock(&inner.last_metrics) = snapshot;
                inner.monitor_cycles.fetch_add(1, Ordering::Relaxed);
                trace!(epoch, ?snapshot, "monitor cycle");
            }
            Cadence::Health => {
                let status = Self::probe_health(inner);
                if !status.healthy {
                    warn!(epoch, ?status, "health probe degraded");
                }
                *lock(&inner.last_health) = Some(status);
                inner.health_cycles.fetch_add(1, Ordering::Relaxed);
            }
            Cadence::Learning => {
                inner.learning_cycles.fetch_add(1, Ordering::Relaxed);
                if let Some(hook) = &inner.learning {
                    hook.on_cycle(epoch).await;
                }
            }
        }
    }

    fn queue_depth(inner: &Inner) -> usize {
        inner
            .job_tx
            .max_capacity()
            .saturating_sub(inner.job_tx.capacity())
    }

    fn compile_metrics(inner: &Inner) -> SupervisorMetrics {
        let (latency_samples, avg_latency_ns, max_latency_ns) = {
            let window = lock(&inner.latencies);
            let samples = window.len();
            let total: u128 = window.iter().map(Duration::as_nanos).sum();
            let max = window.iter().max().map_or(0, |d| d.as_nanos() as u64);
            let avg = if samples == 0 { 0 } else { (total / samples as u128) as u64 };
            (samples, avg, max)
        };

        SupervisorMetrics {
            jobs_submitted: inner.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: inner.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: inner.jobs_failed.load(Ordering::Relaxed),
            queue_depth: Self::queue_depth(inner),
            latency_samples,
            avg_latency_ns,
            max_latency_ns,
            monitor_cycles: inner.monitor_cycles.load(Ordering::Relaxed),
            health_cycles: inner.health_cycles.load(Ordering::Relaxed),
            learning_cycles: inner.learning_cycles.load(Ordering::Relaxed),
        }
    }

    fn probe_health(inner: &Inner) -> HealthStatus {
        let completed = inner.jobs_completed.load(Ordering::Relaxed);
        let failed = inner.jobs_failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let failure_rate = if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        };
        let queue_depth = Self::queue_depth(inner);
        HealthStatus {
            healthy: !inner.shutdown.is_triggered()
                && failure_rate < 0.5
                && queue_depth < inner.config.queue_depth,
            queue_depth,
            failure_rate,
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("capabilities", &self.inner.config.capabilities)
            .field("shutdown", &self.inner.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{DelegateError, NoMesh};
    use inos_shm::SharedRegion;

    /// Echoes the input back, optionally failing or sleeping on request.
    struct EchoExecutor;

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(&self, job: &JobRecord) -> Result<Vec<u8>, String> {
            match job.method.as_str() {
                "fail" => Err("echo refused".to_string()),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(job.input.clone())
                }
                _ => Ok(job.input.clone()),
            }
        }
    }

    fn job(id: &str, library: &str, method: &str, input: Vec<u8>) -> Job {
        Job::with_timeout(JobRecord::new(id, library, method, input), Duration::from_secs(5))
    }

    fn echo_supervisor(config: SupervisorConfig) -> Supervisor {
        Supervisor::builder(
            config.with_capabilities(["echo"]),
            Arc::new(EchoExecutor),
        )
        .spawn()
    }

    #[tokio::test]
    async fn submit_executes_and_returns_the_result() {
        let sup = echo_supervisor(SupervisorConfig::default());
        let handle = sup.submit(job("j1", "echo", "run", vec![1, 2, 3])).await.unwrap();
        let result = handle.wait().await;
        assert!(result.is_success());
        assert_eq!(result.output, vec![1, 2, 3]);
        assert!(result.execution_time_ns > 0);

        let m = sup.metrics();
        assert_eq!(m.jobs_submitted, 1);
        assert_eq!(m.jobs_completed, 1);
        assert_eq!(m.jobs_failed, 0);
        assert_eq!(m.latency_samples, 1);
        assert_eq!(sup.result_of("j1").unwrap().output, vec![1, 2, 3]);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_capability_fails_the_job() {
        let sup = echo_supervisor(SupervisorConfig::default());
        let handle = sup.submit(job("j1", "physics", "step", vec![])).await.unwrap();
        let result = handle.wait().await;
        assert!(!result.is_success());
        assert_eq!(result.error_message, "unsupported capability: physics");
        assert_eq!(sup.metrics().jobs_failed, 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_by_the_security_predicate() {
        let config = SupervisorConfig {
            max_input_bytes: 8,
            ..Default::default()
        };
        let sup = echo_supervisor(config);
        let handle = sup.submit(job("j1", "echo", "run", vec![0; 64])).await.unwrap();
        let result = handle.wait().await;
        assert!(!result.is_success());
        assert!(result.error_message.contains("exceeds"));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn expired_deadline_is_rejected_synchronously() {
        let sup = echo_supervisor(SupervisorConfig::default());
        let expired = Job::with_timeout(
            JobRecord::new("j1", "echo", "run", vec![]),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sup.submit(expired).await.unwrap_err(), SubmitError::DeadlineExpired);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn saturated_queue_times_out_with_queue_full() {
        let config = SupervisorConfig {
            queue_depth: 1,
            submit_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let sup = echo_supervisor(config.with_capabilities(["echo"]));

        // One slow job occupies the executor, one fills the queue slot.
        let h1 = sup.submit(job("j1", "echo", "slow", vec![])).await.unwrap();
        let h2 = sup.submit(job("j2", "echo", "slow", vec![])).await.unwrap();
        let err = sup.submit(job("j3", "echo", "run", vec![])).await;
        assert!(matches!(err, Err(SubmitError::QueueFull)));

        assert!(h1.wait().await.is_success());
        assert!(h2.wait().await.is_success());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_jobs() {
        let config = SupervisorConfig {
            queue_depth: 8,
            ..Default::default()
        };
        let sup = echo_supervisor(config.with_capabilities(["echo"]));
        let h1 = sup.submit(job("j1", "echo", "slow", vec![])).await.unwrap();
        let h2 = sup.submit(job("j2", "echo", "run", vec![])).await.unwrap();

        sup.shutdown().await;

        // The in-flight job finished; the queued one was cancelled.
        assert!(h1.wait().await.is_success());
        let r2 = h2.wait().await;
        assert!(!r2.is_success());
        assert_eq!(r2.error_message, "cancelled");

        // New submissions bounce.
        assert_eq!(
            sup.submit(job("j3", "echo", "run", vec![])).await.unwrap_err(),
            SubmitError::ShutDown
        );
    }

    #[tokio::test]
    async fn submit_batch_reports_each_job_independently() {
        let sup = echo_supervisor(SupervisorConfig::default());
        let jobs = vec![
            job("j1", "echo", "run", vec![1]),
            job("j2", "echo", "fail", vec![]),
        ];
        let handles = sup.submit_batch(jobs).await;
        assert_eq!(handles.len(), 2);
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.unwrap().wait().await);
        }
        assert!(results[0].is_success());
        assert!(!results[1].is_success());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn epoch_cadence_drives_the_monitor_loop() {
        let shm = Arc::new(SharedRegion::new(4096));
        let flags = Arc::new(EpochFlags::new(Arc::clone(&shm)));
        let config = SupervisorConfig {
            health_threshold: 100_000,
            learning_threshold: 100_000,
            ..Default::default()
        };
        let sup = Supervisor::builder(
            config.with_capabilities(["echo"]),
            Arc::new(EchoExecutor),
        )
        .with_flags(Arc::clone(&flags))
        .spawn();

        assert_eq!(sup.metrics().monitor_cycles, 0);
        // Beat the heartbeat until the monitor threshold trips; the loop may
        // start observing at any epoch, so keep beating rather than counting.
        for _ in 0..100 {
            flags.signal(SYSTEM_EPOCH);
            if sup.metrics().monitor_cycles >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sup.metrics().monitor_cycles >= 1);
        assert_eq!(sup.metrics().health_cycles, 0);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn wall_clock_fallback_drives_cycles_without_a_region() {
        let config = SupervisorConfig {
            monitor_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let sup = echo_supervisor(config.with_capabilities(["echo"]));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sup.metrics().monitor_cycles >= 2);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn coordinate_surfaces_delegation_failure_as_a_result() {
        let sup = Supervisor::builder(
            SupervisorConfig::default().with_capabilities(["echo"]),
            Arc::new(EchoExecutor),
        )
        .with_delegator(Arc::new(NoMesh))
        .spawn();

        let result = sup.coordinate(job("j1", "physics", "step", vec![])).await;
        assert!(!result.is_success());
        assert_eq!(
            result.error_message,
            DelegateError::NoRoute("physics".to_string()).to_string()
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn health_probe_tracks_failures() {
        let sup = echo_supervisor(SupervisorConfig::default());
        for i in 0..4 {
            let h = sup
                .submit(job(&format!("j{i}"), "echo", "fail", vec![]))
                .await
                .unwrap();
            h.wait().await;
        }
        let health = sup.health();
        assert!(!health.healthy);
        assert!((health.failure_rate - 1.0).abs() < f64::EPSILON);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn latency_window_stays_bounded() {
        let config = SupervisorConfig {
            latency_window: 10,
            ..Default::default()
        };
        let sup = echo_supervisor(config.with_capabilities(["echo"]));
        for i in 0..25 {
            let h = sup
                .submit(job(&format!("j{i}"), "echo", "run", vec![]))
                .await
                .unwrap();
            h.wait().await;
        }
        assert_eq!(sup.metrics().latency_samples, 10);
        sup.shutdown().await;
    }
}
