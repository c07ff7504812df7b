//! Tracker for multi-phase asynchronous jobs.
//!
//! Producers post stage transitions as discrete events (`update_stage`,
//! `complete`, `fail`); any number of consumers poll `get_status` or await
//! `wait_for_completion`. Every job carries a deadline: a tokio timer forces
//! it to `ERROR` with [`Error::Timeout`] if it has not finished in time, and
//! the sweep does the same for jobs whose timer could not be spawned.
//!
//! Retention only removes jobs that are terminal, past `retention_ms`, and
//! have no waiter registered.

use crate::application::metrics::{JobMetrics, JobStats};
use crate::application::ports::{Clock, Storage};
use crate::application::sweeper::{Sweeper, SweeperHandle};
use crate::domain::stage::{JobId, JobStage};
use crate::error::{BoxError, ConfigError, Error, ReasonCode};
use crate::infrastructure::storage::ShardedStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Configuration for a job tracker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobTrackerConfig {
    /// Default deadline of a job, measured from creation
    pub timeout_ms: u64,
    /// How long a finished job stays queryable
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for JobTrackerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2 * 60 * 1_000,
            retention_ms: 10 * 60 * 1_000,
            sweep_interval_ms: 30 * 1_000,
        }
    }
}

impl JobTrackerConfig {
    pub fn new(timeout: Duration, retention: Duration) -> Self {
        Self {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            retention_ms: u64::try_from(retention.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "timeout_ms",
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "sweep_interval_ms",
            });
        }
        Ok(())
    }
}

/// Why a job ended in `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    /// `TIMEOUT` when the deadline fired, `COMPUTATION_FAILED` when the producer failed it
    pub reason: ReasonCode,
    pub message: String,
}

impl From<&Error> for JobFailure {
    fn from(err: &Error) -> Self {
        Self {
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus<R> {
    pub job_id: JobId,
    pub stage: JobStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub age_ms: u64,
    /// Merged partial data posted with stage updates
    pub partial: Value,
    pub result: Option<R>,
    pub error: Option<JobFailure>,
    /// Consumers currently awaiting completion
    pub waiters: usize,
}

impl<R> JobStatus<R> {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

type Outcome<R> = Option<Result<R, Error>>;

struct JobEntry<R> {
    stage: JobStage,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Instant,
    deadline: Instant,
    timeout: Duration,
    partial: Value,
    outcome: Outcome<R>,
    finished_at: Option<Instant>,
    waiters: usize,
    done: watch::Sender<Outcome<R>>,
    timer: Option<AbortHandle>,
}

impl<R: Clone> JobEntry<R> {
    fn status(&self, job_id: JobId, now: Instant) -> JobStatus<R> {
        let (result, error) = match &self.outcome {
            Some(Ok(value)) => (Some(value.clone()), None),
            Some(Err(err)) => (None, Some(JobFailure::from(err))),
            None => (None, None),
        };
        JobStatus {
            job_id,
            stage: self.stage,
            created_at: self.created_at,
            updated_at: self.updated_at,
            age_ms: u64::try_from(now.saturating_duration_since(self.started_at).as_millis())
                .unwrap_or(u64::MAX),
            partial: self.partial.clone(),
            result,
            error,
            waiters: self.waiters,
        }
    }

    /// Move to a terminal stage and wake every waiter.
    fn finish(&mut self, outcome: Result<R, Error>, now: Instant, utc_now: DateTime<Utc>) {
        self.stage = if outcome.is_ok() {
            JobStage::Done
        } else {
            JobStage::Error
        };
        self.updated_at = utc_now;
        self.finished_at = Some(now);
        self.outcome = Some(outcome.clone());
        self.done.send_replace(Some(outcome));
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_retained(&self, now: Instant, retention: Duration) -> bool {
        match self.finished_at {
            Some(finished) if self.waiters == 0 => now.saturating_duration_since(finished) < retention,
            _ => true,
        }
    }
}

impl<R> std::fmt::Debug for JobEntry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEntry")
            .field("stage", &self.stage)
            .field("waiters", &self.waiters)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

fn merge_partial(target: &mut Value, partial: Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(update)) => {
            for (key, value) in update {
                existing.insert(key, value);
            }
        }
        (target, partial) => *target = partial,
    }
}

struct TrackerInner<R> {
    jobs: ShardedStorage<JobId, JobEntry<R>>,
    config: JobTrackerConfig,
    clock: Arc<dyn Clock>,
    metrics: JobMetrics,
}

impl<R> TrackerInner<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Force a job past its deadline to `ERROR`. Returns whether it was still running.
    fn expire(&self, job_id: JobId) -> bool {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.stage.is_terminal() {
            return false;
        }
        let timeout = entry.timeout;
        let from = entry.stage;
        entry.finish(
            Err(Error::Timeout { job_id, timeout }),
            self.clock.now(),
            self.clock.utc_now(),
        );
        drop(entry);

        self.metrics.record_timed_out();
        tracing::info!(
            job_id = %job_id,
            stage = %from,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "job timed out"
        );
        true
    }

    fn release_waiter(&self, job_id: JobId) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.waiters = entry.waiters.saturating_sub(1);
        }
    }
}

/// Deregisters a waiter however `wait_for_completion` ends.
struct WaiterGuard<R>
where
    R: Clone + Send + Sync + 'static,
{
    inner: Arc<TrackerInner<R>>,
    job_id: JobId,
}

impl<R> Drop for WaiterGuard<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.release_waiter(self.job_id);
    }
}

/// Registry of staged jobs with deadlines and completion waiters.
///
/// Cloning is cheap and clones share the same jobs.
pub struct StagedJobTracker<R> {
    inner: Arc<TrackerInner<R>>,
}

impl<R> Clone for StagedJobTracker<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> StagedJobTracker<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(config: JobTrackerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(TrackerInner {
                jobs: ShardedStorage::new(),
                config,
                clock,
                metrics: JobMetrics::new(),
            }),
        })
    }

    /// Register a job in `PENDING` with the default timeout.
    pub fn create_job(&self) -> JobStatus<R> {
        self.create_job_with_timeout(self.inner.config.timeout())
    }

    /// Register a job in `PENDING` that times out after `timeout`.
    ///
    /// Inside a tokio runtime the deadline is enforced by a timer; otherwise
    /// only the sweep enforces it.
    pub fn create_job_with_timeout(&self, timeout: Duration) -> JobStatus<R> {
        let job_id = JobId::new();
        let now = self.inner.clock.now();
        let utc_now = self.inner.clock.utc_now();
        let (done, _) = watch::channel(None);

        let entry = JobEntry {
            stage: JobStage::Pending,
            created_at: utc_now,
            updated_at: utc_now,
            started_at: now,
            deadline: now + timeout,
            timeout,
            partial: Value::Null,
            outcome: None,
            finished_at: None,
            waiters: 0,
            done,
            timer: None,
        };
        let status = entry.status(job_id, now);
        self.inner.jobs.insert(job_id, entry);
        self.inner.metrics.record_created();

        // The timer may fire before this returns, so it only starts once the
        // job is visible to `expire`.
        if let Some(timer) = self.spawn_timer(job_id, timeout) {
            match self.inner.jobs.get_mut(&job_id) {
                Some(mut entry) if !entry.stage.is_terminal() => entry.timer = Some(timer),
                _ => timer.abort(),
            }
        }

        tracing::debug!(job_id = %job_id, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "job created");
        status
    }

    /// Move a running job forward, merging `partial` into its partial data.
    ///
    /// Posting the current stage again only merges data.
    ///
    /// # Errors
    /// `JobNotFound` for an unknown id. `InvalidTransition` when the job is
    /// terminal, the stage would move backwards, or `stage` is terminal
    /// (use [`complete`](Self::complete) or [`fail`](Self::fail)).
    pub fn update_stage(
        &self,
        job_id: JobId,
        stage: JobStage,
        partial: Option<Value>,
    ) -> Result<JobStatus<R>, Error> {
        let now = self.inner.clock.now();
        let mut entry = self
            .inner
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;

        let from = entry.stage;
        let allowed = !stage.is_terminal() && (stage == from || from.can_advance_to(stage));
        if !allowed || from.is_terminal() {
            return Err(Error::InvalidTransition {
                job_id,
                from,
                to: stage,
            });
        }

        entry.stage = stage;
        entry.updated_at = self.inner.clock.utc_now();
        if let Some(partial) = partial {
            merge_partial(&mut entry.partial, partial);
        }
        let status = entry.status(job_id, now);
        drop(entry);

        if from != stage {
            tracing::debug!(job_id = %job_id, from = %from, to = %stage, "job stage advanced");
        }
        Ok(status)
    }

    /// Finish a job successfully.
    pub fn complete(&self, job_id: JobId, result: R) -> Result<(), Error> {
        self.finish(job_id, Ok(result))?;
        self.inner.metrics.record_completed();
        tracing::debug!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Finish a job with a producer error, reported as `COMPUTATION_FAILED`.
    pub fn fail(&self, job_id: JobId, error: impl Into<BoxError>) -> Result<(), Error> {
        let error = Error::computation(error);
        let message = error.to_string();
        self.finish(job_id, Err(error))?;
        self.inner.metrics.record_errored();
        tracing::debug!(job_id = %job_id, error = %message, "job failed");
        Ok(())
    }

    pub fn get_status(&self, job_id: JobId) -> Option<JobStatus<R>> {
        let now = self.inner.clock.now();
        self.inner.jobs.get(&job_id).map(|entry| entry.status(job_id, now))
    }

    /// Wait until the job is terminal.
    ///
    /// Returns `Ok(None)` for an unknown job (or one dropped by
    /// [`stop`](Self::stop) while waiting), the result for `DONE`, and the
    /// job's error for `ERROR`. Every waiter of a job sees the same outcome.
    pub async fn wait_for_completion(&self, job_id: JobId) -> Result<Option<R>, Error> {
        let (mut done, _guard) = {
            let Some(mut entry) = self.inner.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if let Some(outcome) = &entry.outcome {
                return outcome.clone().map(Some);
            }
            entry.waiters += 1;
            let guard = WaiterGuard {
                inner: Arc::clone(&self.inner),
                job_id,
            };
            (entry.done.subscribe(), guard)
        };

        loop {
            let current = done.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome.map(Some);
            }
            if done.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Force every running job past its deadline to `ERROR`.
    pub fn expire_overdue(&self) -> usize {
        let now = self.inner.clock.now();
        let mut overdue = Vec::new();
        Storage::for_each(&self.inner.jobs, |job_id, entry| {
            if !entry.stage.is_terminal() && now >= entry.deadline {
                overdue.push(*job_id);
            }
        });
        overdue
            .into_iter()
            .filter(|job_id| self.inner.expire(*job_id))
            .count()
    }

    /// Drop terminal jobs past retention that nobody is waiting on.
    pub fn purge_retained(&self) -> usize {
        let now = self.inner.clock.now();
        let retention = self.inner.config.retention();
        let mut removed = 0;
        Storage::retain(&self.inner.jobs, |_, entry| {
            let keep = entry.is_retained(now, retention);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn stats(&self) -> JobStats {
        let mut active = 0;
        Storage::for_each(&self.inner.jobs, |_, entry| {
            if !entry.stage.is_terminal() {
                active += 1;
            }
        });
        self.inner.metrics.snapshot(active)
    }

    /// Start a background task running [`expire_overdue`](Self::expire_overdue)
    /// and [`purge_retained`](Self::purge_retained) every `sweep_interval_ms`.
    pub fn start_sweeper(&self) -> Result<SweeperHandle, ConfigError> {
        let inner: Weak<TrackerInner<R>> = Arc::downgrade(&self.inner);
        Ok(Sweeper::new("job-retention", self.inner.config.sweep_interval())?.start(move || {
            inner.upgrade().map_or(0, |inner| {
                let tracker = StagedJobTracker { inner };
                tracker.expire_overdue() + tracker.purge_retained()
            })
        }))
    }

    /// Abort every job timer and drop every job.
    ///
    /// Pending waiters resolve with `Ok(None)`.
    pub fn stop(&self) {
        let mut timers = Vec::new();
        Storage::retain(&self.inner.jobs, |_, entry| {
            timers.extend(entry.timer.take());
            false
        });
        for timer in timers {
            timer.abort();
        }
    }

    pub fn config(&self) -> &JobTrackerConfig {
        &self.inner.config
    }

    fn finish(&self, job_id: JobId, outcome: Result<R, Error>) -> Result<(), Error> {
        let mut entry = self
            .inner
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        if entry.stage.is_terminal() {
            return Err(Error::InvalidTransition {
                job_id,
                from: entry.stage,
                to: if outcome.is_ok() {
                    JobStage::Done
                } else {
                    JobStage::Error
                },
            });
        }
        entry.finish(outcome, self.inner.clock.now(), self.inner.clock.utc_now());
        Ok(())
    }

    fn spawn_timer(&self, job_id: JobId, timeout: Duration) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(job_id = %job_id, "no tokio runtime, timeout enforced by sweep only");
            return None;
        };
        let inner = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(job_id);
            }
        });
        Some(timer.abort_handle())
    }
}

impl<R> std::fmt::Debug for StagedJobTracker<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedJobTracker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
