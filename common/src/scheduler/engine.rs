// Scheduler engine: admission, timeout and retry control loops over a job store

use super::clock::{Clock, SystemClock};
use super::supervisor::{supervise, SupervisorConfig};
use crate::errors::SchedulerError;
use crate::job::{decode_job, encode_payload, validate_kind, Schedulable};
use crate::models::JobStatus;
use crate::queue::JobPublisher;
use crate::store::{JobFilter, JobStore, JobUpdate, Stamp};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget per job
    pub max_retry: u32,
    /// Ceiling on jobs simultaneously queued or in progress
    pub max_in_flight_jobs: u32,
    /// Longest a job may stay queued before it times out
    pub queued_timeout: Duration,
    /// Longest a job may stay in progress before it times out
    pub in_progress_timeout: Duration,
    /// Rows older than this (by `created_at`) are deleted whatever their status
    pub old_job_retention: Duration,
    pub enqueue_check_interval: Duration,
    pub timeout_check_interval: Duration,
    /// Also the minimum cool-down between two retries of a job
    pub retry_check_interval: Duration,
    pub supervisor: SupervisorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            max_in_flight_jobs: 100,
            queued_timeout: Duration::from_secs(300),
            in_progress_timeout: Duration::from_secs(1800),
            old_job_retention: Duration::from_secs(7 * 24 * 3600),
            enqueue_check_interval: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(30),
            retry_check_interval: Duration::from_secs(60),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_in_flight_jobs == 0 {
            return Err(SchedulerError::Configuration(
                "max_in_flight_jobs must be greater than 0".to_string(),
            ));
        }
        if i32::try_from(self.max_retry).is_err() {
            return Err(SchedulerError::Configuration(format!(
                "max_retry {} is out of range",
                self.max_retry
            )));
        }

        let intervals = [
            ("enqueue_check_interval", self.enqueue_check_interval),
            ("timeout_check_interval", self.timeout_check_interval),
            ("retry_check_interval", self.retry_check_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(SchedulerError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        let windows = [
            ("queued_timeout", self.queued_timeout),
            ("in_progress_timeout", self.in_progress_timeout),
            ("old_job_retention", self.old_job_retention),
            ("retry_check_interval", self.retry_check_interval),
        ];
        for (name, value) in windows {
            chrono::Duration::from_std(value).map_err(|_| {
                SchedulerError::Configuration(format!("{} is out of range", name))
            })?;
        }

        Ok(())
    }
}

/// Outcome of one admission tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    /// Jobs queued or in progress when the tick started
    pub in_flight: i64,
    /// Created rows fetched for admission
    pub admitted: usize,
    /// Rows dispatched and moved to queued
    pub enqueued: usize,
    /// Rows whose dispatch failed and stay created
    pub failed: usize,
}

/// Outcome of one timeout tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutSummary {
    pub queued: u64,
    pub in_progress: u64,
}

/// The three periodic control loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlLoop {
    Enqueue,
    Timeout,
    Retry,
}

impl ControlLoop {
    const ALL: [ControlLoop; 3] = [ControlLoop::Enqueue, ControlLoop::Timeout, ControlLoop::Retry];

    fn name(&self) -> &'static str {
        match self {
            ControlLoop::Enqueue => "enqueue",
            ControlLoop::Timeout => "timeout",
            ControlLoop::Retry => "retry",
        }
    }

    fn period(&self, config: &EngineConfig) -> Duration {
        match self {
            ControlLoop::Enqueue => config.enqueue_check_interval,
            ControlLoop::Timeout => config.timeout_check_interval,
            ControlLoop::Retry => config.retry_check_interval,
        }
    }
}

/// Scheduler trait for running the engine's loops
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the control loops until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Ask every loop to finish its current tick and exit
    async fn stop(&self) -> Result<(), SchedulerError>;
}

/// Read-only state shared by the loops and the mutation entry points
struct EngineShared<J> {
    instance_id: String,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn JobPublisher>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    _job: PhantomData<fn() -> J>,
}

/// Scheduler engine for one job type
///
/// Cloning is cheap; clones share configuration, store and shutdown signal.
pub struct SchedulerEngine<J: Schedulable> {
    shared: Arc<EngineShared<J>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<J: Schedulable> Clone for SchedulerEngine<J> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<J: Schedulable> SchedulerEngine<J> {
    /// Create a new scheduler engine
    ///
    /// # Errors
    /// Returns `SchedulerError::Configuration` if `J::KIND` is not a valid
    /// job kind or the configuration is unusable.
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn JobPublisher>,
        config: EngineConfig,
    ) -> Result<Self, SchedulerError> {
        Self::with_clock(store, publisher, config, Arc::new(SystemClock))
    }

    /// Create a new scheduler engine with an explicit time source
    pub fn with_clock(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn JobPublisher>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        validate_kind(J::KIND)?;
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        let instance_id = format!("engine-{}", Uuid::new_v4());

        info!(
            instance_id = %instance_id,
            kind = J::KIND,
            max_in_flight_jobs = config.max_in_flight_jobs,
            max_retry = config.max_retry,
            "Scheduler engine created"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                instance_id,
                store,
                publisher,
                clock,
                config,
                _job: PhantomData,
            }),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Identifier of this engine instance, used in logs
    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Insert a job in the created state and stamp its record
    ///
    /// Not idempotent: adding the same job twice creates two rows.
    ///
    /// # Errors
    /// `TypeMismatch` if the job's record already belongs to another kind,
    /// `Payload` if the job cannot be serialized, `Store` on persistence failure.
    #[instrument(skip(self, job), fields(kind = J::KIND))]
    pub async fn add_job(&self, job: &mut J) -> Result<i64, SchedulerError> {
        let kind = &job.record().kind;
        if !kind.is_empty() && kind != J::KIND {
            return Err(SchedulerError::TypeMismatch {
                expected: J::KIND.to_string(),
                found: kind.clone(),
            });
        }

        let payload = encode_payload(job)?;
        let now = self.shared.clock.now();
        let record = self.shared.store.insert(J::KIND, payload, now).await?;
        let id = record.id;
        *job.record_mut() = record;

        telemetry::record_job_added(J::KIND);
        debug!(job_id = id, "Job added");
        Ok(id)
    }

    /// Mark a queued job as picked up by a worker
    ///
    /// Returns `false` without error when the job is no longer queued, so late
    /// or duplicate signals cannot revive a job that has moved on.
    pub async fn set_in_progress(&self, job: &J) -> Result<bool, SchedulerError> {
        if !job.record().is_persisted() {
            debug!("Job was never added, progress signal ignored");
            return Ok(false);
        }
        self.set_in_progress_by_id(job.record().id).await
    }

    /// `set_in_progress` for workers that only hold the job id
    #[instrument(skip(self), fields(kind = J::KIND))]
    pub async fn set_in_progress_by_id(&self, id: i64) -> Result<bool, SchedulerError> {
        let filter = JobFilter::status_in([JobStatus::Queued]).id(id);
        let update = JobUpdate::to(JobStatus::InProgress).stamp(Stamp::InProgressedAt);

        let affected = self
            .shared
            .store
            .update(J::KIND, &filter, &update, self.shared.clock.now())
            .await?;

        if affected == 0 {
            debug!(job_id = id, "Job not queued anymore, progress signal ignored");
        }
        Ok(affected > 0)
    }

    /// Record the final result of a queued or in-progress job
    ///
    /// Returns `false` without error when the job is in neither status.
    ///
    /// # Errors
    /// `InvalidResult` if `result` is not a terminal status.
    pub async fn set_result(
        &self,
        job: &J,
        result: JobStatus,
        failure_message: Option<String>,
    ) -> Result<bool, SchedulerError> {
        if !job.record().is_persisted() {
            if !result.is_terminal() {
                return Err(SchedulerError::InvalidResult(result.to_string()));
            }
            debug!(result = %result, "Job was never added, result ignored");
            return Ok(false);
        }
        self.set_result_by_id(job.record().id, result, failure_message)
            .await
    }

    /// `set_result` for workers that only hold the job id
    #[instrument(skip(self, failure_message), fields(kind = J::KIND))]
    pub async fn set_result_by_id(
        &self,
        id: i64,
        result: JobStatus,
        failure_message: Option<String>,
    ) -> Result<bool, SchedulerError> {
        if !result.is_terminal() {
            return Err(SchedulerError::InvalidResult(result.to_string()));
        }

        let filter = JobFilter::status_in(JobStatus::IN_FLIGHT).id(id);
        let update = JobUpdate::to(result).failure_message(failure_message);

        let affected = self
            .shared
            .store
            .update(J::KIND, &filter, &update, self.shared.clock.now())
            .await?;

        if affected == 0 {
            debug!(job_id = id, result = %result, "Job not in flight anymore, result ignored");
        }
        Ok(affected > 0)
    }

    /// Admit created jobs up to the in-flight ceiling and dispatch them
    pub async fn run_enqueue_tick(&self) -> Result<EnqueueSummary, SchedulerError> {
        self.shared.enqueue_tick().await
    }

    /// Delete rows older than the retention window, whatever their status
    pub async fn run_cleanup(&self) -> Result<u64, SchedulerError> {
        self.shared.cleanup().await
    }

    /// Reclassify jobs that stayed queued or in progress for too long
    pub async fn run_timeout_tick(&self) -> Result<TimeoutSummary, SchedulerError> {
        self.shared.timeout_tick().await
    }

    /// Resubmit failed and timed-out jobs that still have retry budget
    pub async fn run_retry_tick(&self) -> Result<u64, SchedulerError> {
        self.shared.retry_tick().await
    }
}

impl<J: Schedulable> EngineShared<J> {
    #[instrument(skip(self), fields(kind = J::KIND, instance_id = %self.instance_id))]
    async fn enqueue_tick(&self) -> Result<EnqueueSummary, SchedulerError> {
        let ceiling = i64::from(self.config.max_in_flight_jobs);
        let in_flight = self.store.count(J::KIND, &JobStatus::IN_FLIGHT).await?;
        telemetry::update_in_flight(J::KIND, in_flight);

        let mut summary = EnqueueSummary {
            in_flight,
            ..EnqueueSummary::default()
        };

        if in_flight >= ceiling {
            debug!(in_flight, ceiling, "In-flight ceiling reached, skipping admission");
            return Ok(summary);
        }

        let rows = self
            .store
            .fetch(J::KIND, JobStatus::Created, ceiling - in_flight)
            .await?;
        summary.admitted = rows.len();

        for row in rows {
            let id = row.record.id;
            let job: J = match decode_job(row) {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = id, error = %e, "Stored payload does not decode, leaving job created");
                    summary.failed += 1;
                    continue;
                }
            };

            if let Err(e) = job.enqueue(self.publisher.as_ref()).await {
                warn!(job_id = id, error = %e, "Failed to dispatch job, will retry next tick");
                telemetry::record_enqueue_failure(J::KIND);
                summary.failed += 1;
                continue;
            }

            let filter = JobFilter::status_in([JobStatus::Created]).id(id);
            let update = JobUpdate::to(JobStatus::Queued).stamp(Stamp::QueuedAt);
            let affected = self
                .store
                .update(J::KIND, &filter, &update, self.clock.now())
                .await?;

            if affected == 0 {
                debug!(job_id = id, "Job left created state concurrently after dispatch");
            } else {
                summary.enqueued += 1;
            }
        }

        telemetry::record_jobs_enqueued(J::KIND, summary.enqueued as u64);
        Ok(summary)
    }

    #[instrument(skip(self), fields(kind = J::KIND, instance_id = %self.instance_id))]
    async fn cleanup(&self) -> Result<u64, SchedulerError> {
        let before = cutoff(self.clock.now(), self.config.old_job_retention);
        let deleted = self.store.delete_created_before(J::KIND, before).await?;

        if deleted > 0 {
            info!(deleted, "Old jobs deleted");
            telemetry::record_jobs_cleaned(J::KIND, deleted);
        }
        Ok(deleted)
    }

    #[instrument(skip(self), fields(kind = J::KIND, instance_id = %self.instance_id))]
    async fn timeout_tick(&self) -> Result<TimeoutSummary, SchedulerError> {
        let now = self.clock.now();
        let to_timeout = JobUpdate::to(JobStatus::Timeout);

        let queued_filter = JobFilter::status_in([JobStatus::Queued])
            .queued_before(cutoff(now, self.config.queued_timeout));
        let queued = self
            .store
            .update(J::KIND, &queued_filter, &to_timeout, now)
            .await;

        // Runs even when the queued sweep failed; the first error is reported
        let in_progress_filter = JobFilter::status_in([JobStatus::InProgress])
            .in_progressed_before(cutoff(now, self.config.in_progress_timeout));
        let in_progress = self
            .store
            .update(J::KIND, &in_progress_filter, &to_timeout, now)
            .await;

        let timed_out = queued.as_ref().map_or(0, |n| *n) + in_progress.as_ref().map_or(0, |n| *n);
        if timed_out > 0 {
            warn!(
                queued = queued.as_ref().ok().copied(),
                in_progress = in_progress.as_ref().ok().copied(),
                "Jobs timed out"
            );
            telemetry::record_jobs_timed_out(J::KIND, timed_out);
        }

        Ok(TimeoutSummary {
            queued: queued?,
            in_progress: in_progress?,
        })
    }

    #[instrument(skip(self), fields(kind = J::KIND, instance_id = %self.instance_id))]
    async fn retry_tick(&self) -> Result<u64, SchedulerError> {
        let now = self.clock.now();
        // Validated to fit at construction
        let max_retry = i32::try_from(self.config.max_retry).unwrap_or(i32::MAX);

        let filter = JobFilter::status_in(JobStatus::RETRYABLE)
            .retry_count_below(max_retry)
            .updated_before(cutoff(now, self.config.retry_check_interval));
        let update = JobUpdate::to(JobStatus::Created).increment_retry();

        let retried = self.store.update(J::KIND, &filter, &update, now).await?;
        if retried > 0 {
            info!(retried, "Jobs resubmitted for retry");
            telemetry::record_jobs_retried(J::KIND, retried);
        }
        Ok(retried)
    }

    /// One tick of a loop; errors are logged and absorbed
    async fn tick(&self, control: ControlLoop) {
        match control {
            ControlLoop::Enqueue => {
                if let Err(e) = self.enqueue_tick().await {
                    error!(kind = J::KIND, error = %e, "Admission tick failed");
                }
                if let Err(e) = self.cleanup().await {
                    error!(kind = J::KIND, error = %e, "Cleanup failed");
                }
            }
            ControlLoop::Timeout => {
                if let Err(e) = self.timeout_tick().await {
                    error!(kind = J::KIND, error = %e, "Timeout tick failed");
                }
            }
            ControlLoop::Retry => {
                if let Err(e) = self.retry_tick().await {
                    error!(kind = J::KIND, error = %e, "Retry tick failed");
                }
            }
        }
    }

    async fn run_loop(self: Arc<Self>, control: ControlLoop, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(control.period(&self.config));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(loop_name = control.name(), "Loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.tick(control).await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(loop_name = control.name(), "Loop stopped");
    }
}

#[async_trait]
impl<J: Schedulable> Scheduler for SchedulerEngine<J> {
    #[instrument(skip(self), fields(kind = J::KIND, instance_id = %self.shared.instance_id))]
    async fn start(&self) -> Result<(), SchedulerError> {
        info!("Starting scheduler engine");

        let [enqueue, timeout, retry] = ControlLoop::ALL.map(|control| {
            let shared = self.shared.clone();
            supervise(
                control.name(),
                self.shared.config.supervisor.clone(),
                move |shutdown| shared.clone().run_loop(control, shutdown).boxed(),
                self.shutdown_tx.subscribe(),
            )
        });

        let result = tokio::try_join!(enqueue, timeout, retry);
        if let Err(e) = &result {
            error!(error = %e, "Control loop failed permanently, stopping engine");
            self.shutdown_tx.send_replace(true);
        }

        info!("Scheduler engine stopped");
        result.map(|_| ())
    }

    async fn stop(&self) -> Result<(), SchedulerError> {
        info!(instance_id = %self.shared.instance_id, "Stopping scheduler engine");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{QueueError, StoreError};
    use crate::models::JobRecord;
    use crate::queue::OutgoingMessage;
    use crate::scheduler::ManualClock;
    use crate::store::{MemoryJobStore, MockJobStore};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestJob {
        #[serde(skip)]
        record: JobRecord,
        name: String,
    }

    impl TestJob {
        fn named(name: &str) -> Self {
            Self {
                record: JobRecord::default(),
                name: name.to_string(),
            }
        }
    }

    impl Schedulable for TestJob {
        const KIND: &'static str = "test";

        fn record(&self) -> &JobRecord {
            &self.record
        }

        fn record_mut(&mut self) -> &mut JobRecord {
            &mut self.record
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct BadlyNamedJob {
        #[serde(skip)]
        record: JobRecord,
    }

    impl Schedulable for BadlyNamedJob {
        const KIND: &'static str = "Bad Kind";

        fn record(&self) -> &JobRecord {
            &self.record
        }

        fn record_mut(&mut self) -> &mut JobRecord {
            &mut self.record
        }
    }

    /// Publisher that records job ids and fails for selected ids
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<i64>>,
        failing: Mutex<HashSet<i64>>,
    }

    impl RecordingPublisher {
        fn published(&self) -> Vec<i64> {
            self.published.lock().unwrap().clone()
        }

        fn fail_for(&self, id: i64) {
            self.failing.lock().unwrap().insert(id);
        }

        fn recover(&self, id: i64) {
            self.failing.lock().unwrap().remove(&id);
        }
    }

    #[async_trait]
    impl JobPublisher for RecordingPublisher {
        async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError> {
            // Hand control back like a network round trip would
            tokio::task::yield_now().await;
            let decoded: crate::queue::JobMessage = serde_json::from_slice(&message.payload)?;
            if self.failing.lock().unwrap().contains(&decoded.job_id) {
                return Err(QueueError::PublishFailed("broker unavailable".to_string()));
            }
            self.published.lock().unwrap().push(decoded.job_id);
            Ok(())
        }
    }

    struct Harness {
        engine: SchedulerEngine<TestJob>,
        store: MemoryJobStore,
        publisher: Arc<RecordingPublisher>,
        clock: ManualClock,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let store = MemoryJobStore::new();
            let publisher = Arc::new(RecordingPublisher::default());
            let clock = ManualClock::new(Utc::now());
            let engine = SchedulerEngine::with_clock(
                Arc::new(store.clone()),
                publisher.clone(),
                config,
                Arc::new(clock.clone()),
            )
            .unwrap();
            Self {
                engine,
                store,
                publisher,
                clock,
            }
        }

        async fn add(&self, name: &str) -> i64 {
            let mut job = TestJob::named(name);
            self.engine.add_job(&mut job).await.unwrap()
        }

        async fn status(&self, id: i64) -> JobStatus {
            self.record(id).await.status
        }

        async fn record(&self, id: i64) -> JobRecord {
            self.store.find("test", id).await.unwrap().unwrap().record
        }

        fn advance(&self, by: Duration) {
            self.clock.advance(chrono::Duration::from_std(by).unwrap());
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            max_retry: 2,
            max_in_flight_jobs: 10,
            queued_timeout: Duration::from_secs(5),
            in_progress_timeout: Duration::from_secs(30),
            old_job_retention: Duration::from_secs(3600),
            enqueue_check_interval: Duration::from_secs(1),
            timeout_check_interval: Duration::from_secs(1),
            retry_check_interval: Duration::from_secs(10),
            supervisor: SupervisorConfig::default(),
        }
    }

    #[test]
    fn test_new_rejects_invalid_configuration() {
        let store = Arc::new(MemoryJobStore::new());
        let publisher = Arc::new(RecordingPublisher::default());

        let zero_ceiling = EngineConfig {
            max_in_flight_jobs: 0,
            ..config()
        };
        let result =
            SchedulerEngine::<TestJob>::new(store.clone(), publisher.clone(), zero_ceiling);
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));

        let zero_interval = EngineConfig {
            retry_check_interval: Duration::ZERO,
            ..config()
        };
        let result =
            SchedulerEngine::<TestJob>::new(store.clone(), publisher.clone(), zero_interval);
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_new_rejects_invalid_kind() {
        let result = SchedulerEngine::<BadlyNamedJob>::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingPublisher::default()),
            config(),
        );
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_add_job_inserts_created_row() {
        let h = Harness::new(config());
        let mut job = TestJob::named("a");

        let id = h.engine.add_job(&mut job).await.unwrap();

        assert_eq!(job.record.id, id);
        assert_eq!(job.record.kind, "test");
        assert_eq!(job.record.status, JobStatus::Created);
        assert_eq!(job.record.created_at, h.clock.now());

        // Adding twice creates a second row
        let second = h.engine.add_job(&mut job).await.unwrap();
        assert_ne!(second, id);
        assert_eq!(h.store.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_add_job_rejects_record_of_other_kind() {
        let h = Harness::new(config());
        let mut job = TestJob::named("a");
        job.record.kind = "report".to_string();

        let result = h.engine.add_job(&mut job).await;

        assert!(matches!(result, Err(SchedulerError::TypeMismatch { .. })));
        assert!(h.store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_admission_is_fifo_and_respects_ceiling() {
        let h = Harness::new(EngineConfig {
            max_in_flight_jobs: 1,
            ..config()
        });
        let a = h.add("a").await;
        h.advance(Duration::from_secs(1));
        let b = h.add("b").await;

        let summary = h.engine.run_enqueue_tick().await.unwrap();

        assert_eq!(summary.enqueued, 1);
        assert_eq!(h.publisher.published(), vec![a]);
        assert_eq!(h.status(a).await, JobStatus::Queued);
        assert_eq!(h.status(b).await, JobStatus::Created);
        assert_eq!(h.record(a).await.queued_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_admission_skips_when_ceiling_reached() {
        let h = Harness::new(EngineConfig {
            max_in_flight_jobs: 2,
            ..config()
        });
        for name in ["a", "b", "c"] {
            h.add(name).await;
        }

        let first = h.engine.run_enqueue_tick().await.unwrap();
        assert_eq!(first.enqueued, 2);

        let second = h.engine.run_enqueue_tick().await.unwrap();
        assert_eq!(second.in_flight, 2);
        assert_eq!(second.admitted, 0);
        assert_eq!(h.publisher.published().len(), 2);

        let in_flight = h.store.count("test", &JobStatus::IN_FLIGHT).await.unwrap();
        assert!(in_flight <= 2);
    }

    #[tokio::test]
    async fn test_failed_dispatch_stays_created_until_next_tick() {
        let h = Harness::new(config());
        let id = h.add("a").await;
        h.publisher.fail_for(id);

        let summary = h.engine.run_enqueue_tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(h.status(id).await, JobStatus::Created);

        h.publisher.recover(id);
        let summary = h.engine.run_enqueue_tick().await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(h.status(id).await, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_progress_and_result_are_noops_out_of_order() {
        let h = Harness::new(config());
        let id = h.add("a").await;

        // Not queued yet
        assert!(!h.engine.set_in_progress_by_id(id).await.unwrap());
        assert!(!h
            .engine
            .set_result_by_id(id, JobStatus::Succeeded, None)
            .await
            .unwrap());
        assert_eq!(h.status(id).await, JobStatus::Created);

        h.engine.run_enqueue_tick().await.unwrap();
        assert!(h.engine.set_in_progress_by_id(id).await.unwrap());
        // Duplicate progress signal
        assert!(!h.engine.set_in_progress_by_id(id).await.unwrap());
        assert_eq!(h.record(id).await.in_progressed_at, Some(h.clock.now()));

        assert!(h
            .engine
            .set_result_by_id(id, JobStatus::Succeeded, None)
            .await
            .unwrap());
        // Late failure after success
        assert!(!h
            .engine
            .set_result_by_id(id, JobStatus::Failed, Some("late".to_string()))
            .await
            .unwrap());
        let record = h.record(id).await;
        assert_eq!(record.status, JobStatus::Succeeded);
        assert!(record.failure_message.is_none());
    }

    #[tokio::test]
    async fn test_result_straight_from_queued() {
        let h = Harness::new(config());
        let mut job = TestJob::named("a");
        h.engine.add_job(&mut job).await.unwrap();
        h.engine.run_enqueue_tick().await.unwrap();

        let applied = h
            .engine
            .set_result(&job, JobStatus::Failed, Some("disk full".to_string()))
            .await
            .unwrap();

        assert!(applied);
        let record = h.record(job.record.id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_message.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_set_result_rejects_non_terminal_status() {
        let h = Harness::new(config());
        let id = h.add("a").await;

        for status in [JobStatus::Created, JobStatus::Queued, JobStatus::InProgress] {
            let result = h.engine.set_result_by_id(id, status, None).await;
            assert!(matches!(result, Err(SchedulerError::InvalidResult(_))));
        }
    }

    #[tokio::test]
    async fn test_queued_job_times_out() {
        let h = Harness::new(config());
        let id = h.add("a").await;
        h.engine.run_enqueue_tick().await.unwrap();

        h.advance(Duration::from_secs(5));
        let summary = h.engine.run_timeout_tick().await.unwrap();
        assert_eq!(summary, TimeoutSummary::default());
        assert_eq!(h.status(id).await, JobStatus::Queued);

        h.advance(Duration::from_millis(1));
        let summary = h.engine.run_timeout_tick().await.unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(h.status(id).await, JobStatus::Timeout);

        // A worker picking it up late changes nothing
        assert!(!h.engine.set_in_progress_by_id(id).await.unwrap());
        assert_eq!(h.status(id).await, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_in_progress_job_times_out() {
        let h = Harness::new(config());
        let id = h.add("a").await;
        h.engine.run_enqueue_tick().await.unwrap();
        h.engine.set_in_progress_by_id(id).await.unwrap();

        // Queued timeout no longer applies once in progress
        h.advance(Duration::from_secs(10));
        assert_eq!(h.engine.run_timeout_tick().await.unwrap().in_progress, 0);

        h.advance(Duration::from_secs(21));
        let summary = h.engine.run_timeout_tick().await.unwrap();
        assert_eq!(summary.in_progress, 1);
        assert_eq!(h.status(id).await, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_retry_waits_for_cool_down() {
        let h = Harness::new(config());
        let id = h.add("a").await;
        h.engine.run_enqueue_tick().await.unwrap();
        h.engine
            .set_result_by_id(id, JobStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();

        h.advance(Duration::from_secs(5));
        assert_eq!(h.engine.run_retry_tick().await.unwrap(), 0);

        h.advance(Duration::from_secs(6));
        assert_eq!(h.engine.run_retry_tick().await.unwrap(), 1);
        let record = h.record(id).await;
        assert_eq!(record.status, JobStatus::Created);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_exhausted_in_place() {
        let h = Harness::new(config());
        let id = h.add("a").await;

        for attempt in 0..=2 {
            h.engine.run_enqueue_tick().await.unwrap();
            assert!(h.engine.set_in_progress_by_id(id).await.unwrap());
            assert!(h
                .engine
                .set_result_by_id(id, JobStatus::Failed, Some(format!("attempt {}", attempt)))
                .await
                .unwrap());

            h.advance(Duration::from_secs(11));
            h.engine.run_retry_tick().await.unwrap();
        }

        let record = h.record(id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.failure_message.as_deref(), Some("attempt 2"));
        assert_eq!(h.publisher.published(), vec![id, id, id]);

        // Further ticks never revive it
        h.advance(Duration::from_secs(60));
        assert_eq!(h.engine.run_retry_tick().await.unwrap(), 0);
        assert_eq!(h.status(id).await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_timed_out_job_is_retried() {
        let h = Harness::new(config());
        let id = h.add("a").await;
        h.engine.run_enqueue_tick().await.unwrap();

        h.advance(Duration::from_secs(6));
        h.engine.run_timeout_tick().await.unwrap();
        h.advance(Duration::from_secs(11));
        assert_eq!(h.engine.run_retry_tick().await.unwrap(), 1);

        h.engine.run_enqueue_tick().await.unwrap();
        let record = h.record(id).await;
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.queued_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_by_age_and_is_idempotent() {
        let h = Harness::new(config());
        let old_queued = h.add("old").await;
        h.engine.run_enqueue_tick().await.unwrap();
        h.advance(Duration::from_secs(1800));
        let young = h.add("young").await;

        h.advance(Duration::from_secs(1801));
        assert_eq!(h.engine.run_cleanup().await.unwrap(), 1);
        assert_eq!(h.engine.run_cleanup().await.unwrap(), 0);

        assert!(h.store.find("test", old_queued).await.unwrap().is_none());
        assert!(h.store.find("test", young).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_loop_tick_absorbs_store_errors() {
        let mut store = MockJobStore::new();
        store
            .expect_count()
            .returning(|_, _| Err(StoreError::Database("connection reset".to_string())));
        store
            .expect_delete_created_before()
            .times(1)
            .returning(|_, _| Ok(0));
        store
            .expect_update()
            .returning(|_, _, _, _| Err(StoreError::Database("connection reset".to_string())));

        let engine = SchedulerEngine::<TestJob>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            config(),
        )
        .unwrap();

        assert!(matches!(
            engine.run_enqueue_tick().await,
            Err(SchedulerError::Store(_))
        ));

        // Loop ticks log and carry on; cleanup still runs after a failed admission
        engine.shared.tick(ControlLoop::Enqueue).await;
        engine.shared.tick(ControlLoop::Timeout).await;
        engine.shared.tick(ControlLoop::Retry).await;
    }

    #[tokio::test]
    async fn test_timeout_sweeps_run_independently() {
        let mut store = MockJobStore::new();
        store
            .expect_update()
            .times(2)
            .returning(|_, filter: &JobFilter, _, _| {
                if filter.queued_before.is_some() {
                    Err(StoreError::Database("statement timeout".to_string()))
                } else {
                    Ok(1)
                }
            });

        let engine = SchedulerEngine::<TestJob>::new(
            Arc::new(store),
            Arc::new(RecordingPublisher::default()),
            config(),
        )
        .unwrap();

        // The in-progress sweep still runs; the queued failure is reported
        let result = engine.run_timeout_tick().await;
        assert!(matches!(result, Err(SchedulerError::Store(_))));
    }

    #[tokio::test]
    async fn test_signals_for_unadded_job_skip_store() {
        // Any store call would panic on a mock without expectations
        let engine = SchedulerEngine::<TestJob>::new(
            Arc::new(MockJobStore::new()),
            Arc::new(RecordingPublisher::default()),
            config(),
        )
        .unwrap();
        let job = TestJob::named("never-added");

        assert!(!engine.set_in_progress(&job).await.unwrap());
        assert!(!engine
            .set_result(&job, JobStatus::Succeeded, None)
            .await
            .unwrap());
        assert!(matches!(
            engine.set_result(&job, JobStatus::InProgress, None).await,
            Err(SchedulerError::InvalidResult(_))
        ));
    }

    #[tokio::test]
    async fn test_two_engines_share_one_store() {
        let store = MemoryJobStore::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = ManualClock::new(Utc::now());
        let cfg = EngineConfig {
            max_in_flight_jobs: 3,
            ..config()
        };
        let build = || {
            SchedulerEngine::<TestJob>::with_clock(
                Arc::new(store.clone()),
                publisher.clone(),
                cfg.clone(),
                Arc::new(clock.clone()),
            )
            .unwrap()
        };
        let (first, second) = (build(), build());

        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            let mut job = TestJob::named(name);
            ids.push(first.add_job(&mut job).await.unwrap());
            clock.advance(chrono::Duration::milliseconds(1));
        }

        let (a, b) = tokio::join!(first.run_enqueue_tick(), second.run_enqueue_tick());
        let (a, b) = (a.unwrap(), b.unwrap());

        // Dispatch may be duplicated, the created -> queued move is not
        assert_eq!(a.enqueued + b.enqueued, 3);
        let records = store.records("test").unwrap();
        let queued: Vec<i64> = records
            .iter()
            .filter(|r| r.status == JobStatus::Queued)
            .map(|r| r.id)
            .collect();
        assert_eq!(queued, ids[..3].to_vec());
        let in_flight = store.count("test", &JobStatus::IN_FLIGHT).await.unwrap();
        assert!(in_flight <= 3);

        // A worker result racing the other engine's timeout sweep: one wins
        clock.advance(chrono::Duration::seconds(6));
        let target = ids[0];
        let (applied, swept) = tokio::join!(
            first.set_result_by_id(target, JobStatus::Succeeded, None),
            second.run_timeout_tick()
        );
        let (applied, swept) = (applied.unwrap(), swept.unwrap());

        let status = status_of(&store, target).await;
        if applied {
            assert_eq!(status, JobStatus::Succeeded);
            assert_eq!(swept.queued, 2);
        } else {
            assert_eq!(status, JobStatus::Timeout);
            assert_eq!(swept.queued, 3);
        }

        let (a, b) = tokio::join!(first.run_enqueue_tick(), second.run_enqueue_tick());
        assert_eq!(a.unwrap().enqueued + b.unwrap().enqueued, 2);
        let in_flight = store.count("test", &JobStatus::IN_FLIGHT).await.unwrap();
        assert!(in_flight <= 3);
    }

    async fn status_of(store: &MemoryJobStore, id: i64) -> JobStatus {
        store.find("test", id).await.unwrap().unwrap().record.status
    }

    #[tokio::test]
    async fn test_start_dispatches_and_stops() {
        let store = MemoryJobStore::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let engine = SchedulerEngine::<TestJob>::new(
            Arc::new(store.clone()),
            publisher.clone(),
            EngineConfig {
                enqueue_check_interval: Duration::from_millis(10),
                timeout_check_interval: Duration::from_millis(10),
                retry_check_interval: Duration::from_millis(10),
                ..config()
            },
        )
        .unwrap();

        let mut job = TestJob::named("a");
        let id = engine.add_job(&mut job).await.unwrap();

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        for _ in 0..100 {
            if !publisher.published().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.published(), vec![id]);

        engine.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
