//! Timer scheduler implementation.
//!
//! Decides when a job is armed, re-armed, retried or finalized. The actual
//! waiting is delegated to a [`TimerBackend`]; the [`JobRepository`] is the
//! single source of truth for every job's state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::executor::{JobExecutionResponse, JobExecutor};
use crate::repository::JobRepository;
use crate::timer::{TimerBackend, TimerFired};
use crate::types::{Job, JobStatus, ScheduledJob};

/// Longest accepted repeat interval, about a century.
const MAX_REPEAT_INTERVAL_DAYS: i64 = 36_525;

/// Which kind of timer to arm.
#[derive(Debug, Clone, Copy)]
enum Arm {
    Once(std::time::Duration),
    Periodic(std::time::Duration),
}

/// Orchestrates the lifecycle of scheduled jobs.
pub struct TimerScheduler {
    repository: Arc<dyn JobRepository>,
    timer: Arc<dyn TimerBackend>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Per-job-id locks serializing operations on the same id.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TimerScheduler {
    /// Create a scheduler reading time from the system clock.
    pub fn new(
        repository: Arc<dyn JobRepository>,
        timer: Arc<dyn TimerBackend>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            timer,
            clock: Arc::new(SystemClock),
            config,
            locks: DashMap::new(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current time according to the scheduler's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Time left until `expiration_time`. Negative once it has passed.
    pub fn calculate_delay(&self, expiration_time: DateTime<Utc>) -> Duration {
        expiration_time - self.clock.now()
    }

    /// Whether the retry window after `expiration_time` has fully elapsed.
    pub fn is_expired(&self, expiration_time: DateTime<Utc>) -> bool {
        self.calculate_delay(expiration_time)
            .checked_add(&self.config.max_retry_window())
            .is_some_and(|remaining| remaining < Duration::zero())
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Schedule a job.
    ///
    /// An existing record for the same id is reconciled first. A SCHEDULED
    /// record is cancelled and replaced, unless it is a periodic job past
    /// its first occurrence, which is routed through the success path
    /// instead, or its retry window has passed, which finalizes it as ERROR.
    /// A RETRY record is routed through the retry path. In those cases, and
    /// for records in any other state, `None` is returned and no fresh timer
    /// is armed.
    ///
    /// Fails with [`SchedulerError::NegativeDelay`] if the job's expiration
    /// time has already passed.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn schedule(&self, job: Job) -> Result<Option<ScheduledJob>> {
        validate(&job)?;
        let guard = self.lock(&job.id).await;
        let id = job.id.clone();
        let result = self.schedule_locked(job).await;
        self.unlock(&id, guard);
        result
    }

    /// Record a successful execution and re-arm or finalize the job.
    ///
    /// Returns `None` when the job no longer exists, e.g. a stale timer fired
    /// after a cancel.
    #[tracing::instrument(skip(self))]
    pub async fn handle_job_execution_success(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        let guard = self.lock(job_id).await;
        let result = match self.repository.get(job_id).await {
            Ok(Some(job)) => self.handle_success_locked(job).await.map(Some),
            Ok(None) => {
                debug!("no record for succeeded job, ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        };
        self.unlock(job_id, guard);
        result
    }

    /// Record a failed execution. Delegates to [`Self::handle_retry`].
    #[tracing::instrument(skip(self, response), fields(job_id = %response.job_id))]
    pub async fn handle_job_execution_error(
        &self,
        response: JobExecutionResponse,
    ) -> Result<Option<ScheduledJob>> {
        warn!(
            code = ?response.code,
            message = ?response.message,
            "job execution failed"
        );
        self.handle_retry(&response.job_id).await
    }

    /// Arm a retry after the fixed backoff, or finalize as ERROR once the
    /// retry window has elapsed.
    #[tracing::instrument(skip(self))]
    pub async fn handle_retry(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        let guard = self.lock(job_id).await;
        let result = match self.repository.get(job_id).await {
            Ok(Some(job)) => self.handle_retry_locked(job).await.map(Some),
            Ok(None) => {
                debug!("no record for job to retry, ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        };
        self.unlock(job_id, guard);
        result
    }

    /// Cancel a job: disarm its timer and delete its record.
    ///
    /// Returns the record as it was just before deletion, with status
    /// CANCELED.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<ScheduledJob> {
        let guard = self.lock(job_id).await;
        let result = match self.repository.get(job_id).await {
            Ok(Some(job)) => self.cancel_locked(job).await,
            Ok(None) => Err(SchedulerError::JobNotFound(job_id.to_string())),
            Err(e) => Err(e),
        };
        self.unlock(job_id, guard);
        result
    }

    /// Re-arm the recurring timer of a periodic job whose previous handle was
    /// lost, e.g. with the process that owned it.
    #[tracing::instrument(skip(self))]
    pub async fn resume_periodic(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        let guard = self.lock(job_id).await;
        let result = match self.repository.get(job_id).await {
            Ok(Some(job)) => self.resume_periodic_locked(job).await.map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.unlock(job_id, guard);
        result
    }

    /// Process one timer firing: execute the job and feed the outcome back
    /// into the success or retry path.
    ///
    /// Firings for deleted jobs, or through a handle that is no longer the
    /// job's current one, are ignored.
    #[tracing::instrument(skip(self, fired, executor), fields(job_id = %fired.job_id, scheduled_id = %fired.scheduled_id))]
    pub async fn on_timer_fired(
        &self,
        fired: &TimerFired,
        executor: &dyn JobExecutor,
    ) -> Result<Option<ScheduledJob>> {
        let Some(job) = self.repository.get(&fired.job_id).await? else {
            debug!("timer fired for unknown job, ignoring");
            return Ok(None);
        };

        if job.scheduled_id.as_deref() != Some(fired.scheduled_id.as_str()) {
            debug!(current = ?job.scheduled_id, "stale timer firing, ignoring");
            return Ok(None);
        }

        let outcome = executor.execute(&job).await;

        // The id may have been cancelled or rescheduled while executing.
        let guard = self.lock(&fired.job_id).await;
        let result = self.complete_firing(fired, outcome).await;
        self.unlock(&fired.job_id, guard);
        result
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Each firing is processed on its own task, so different jobs execute
    /// in parallel. In-flight executions are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        mut fired_rx: mpsc::UnboundedReceiver<TimerFired>,
        executor: Arc<dyn JobExecutor>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("timer scheduler starting");
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("timer scheduler received shutdown signal");
                        break;
                    }
                }

                fired = fired_rx.recv() => {
                    let Some(fired) = fired else {
                        info!("timer channel closed");
                        break;
                    };
                    let scheduler = Arc::clone(&self);
                    let executor = Arc::clone(&executor);
                    in_flight.spawn(async move {
                        if let Err(e) = scheduler.on_timer_fired(&fired, executor.as_ref()).await {
                            error!(job_id = %fired.job_id, error = %e, "failed to process timer firing");
                        }
                    });
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "dispatch task panicked");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatch task panicked");
            }
        }

        info!("timer scheduler shut down gracefully");
    }

    // =========================================================================
    // Lifecycle steps (callers hold the job's lock)
    // =========================================================================

    async fn complete_firing(
        &self,
        fired: &TimerFired,
        outcome: std::result::Result<JobExecutionResponse, JobExecutionResponse>,
    ) -> Result<Option<ScheduledJob>> {
        let Some(job) = self.repository.get(&fired.job_id).await? else {
            debug!("job removed while executing, dropping outcome");
            return Ok(None);
        };
        if job.scheduled_id.as_deref() != Some(fired.scheduled_id.as_str()) {
            debug!(current = ?job.scheduled_id, "job re-armed while executing, dropping outcome");
            return Ok(None);
        }

        match outcome {
            Ok(response) => {
                debug!(code = ?response.code, "job executed");
                self.handle_success_locked(job).await.map(Some)
            }
            Err(response) => {
                warn!(
                    code = ?response.code,
                    message = ?response.message,
                    "job execution failed"
                );
                self.handle_retry_locked(job).await.map(Some)
            }
        }
    }

    async fn schedule_locked(&self, job: Job) -> Result<Option<ScheduledJob>> {
        if !self.handle_existing_job(&job).await {
            debug!("existing record suppressed fresh schedule");
            return Ok(None);
        }

        let delay = self.calculate_delay(job.expiration_time);
        let delay = delay.to_std().map_err(|_| SchedulerError::NegativeDelay {
            job_id: job.id.clone(),
            delay_millis: delay.num_milliseconds(),
        })?;

        let scheduled_id = self.timer.do_schedule(delay, &job).await?;
        let scheduled = ScheduledJob::new(job, scheduled_id, self.clock.now());

        match self.repository.save(scheduled.clone()).await {
            Ok(saved) => {
                info!(
                    scheduled_id = ?saved.scheduled_id,
                    expiration_time = %saved.expiration_time,
                    "scheduled job"
                );
                Ok(Some(saved))
            }
            Err(e) => {
                // Nothing references the new timer if the record was not stored.
                self.cancel_timer(&scheduled).await;
                Err(e)
            }
        }
    }

    /// Reconcile a schedule request with any existing record for the same id.
    ///
    /// Returns whether the fresh schedule should go ahead. Errors here are
    /// logged and swallowed so a bad record cannot wedge the caller; the
    /// request then becomes a no-op.
    async fn handle_existing_job(&self, job: &Job) -> bool {
        match self.reconcile_existing(job).await {
            Ok(proceed) => proceed,
            Err(e) => {
                debug!(error = %e, "ignoring error while reconciling existing job");
                false
            }
        }
    }

    async fn reconcile_existing(&self, job: &Job) -> Result<bool> {
        let Some(existing) = self.repository.get(&job.id).await? else {
            return Ok(true);
        };

        match existing.status {
            // A periodic job past its first occurrence keeps itself going.
            // The request is treated as another success, exactly as if the
            // timer had fired.
            JobStatus::Scheduled if existing.was_periodic_scheduled() => {
                debug!(
                    execution_counter = existing.execution_counter,
                    "job already running periodically, routing through success path"
                );
                self.handle_success_locked(existing).await?;
                Ok(false)
            }
            JobStatus::Scheduled => {
                if self.is_expired(existing.expiration_time) {
                    self.finalize(existing.with_status(JobStatus::Error)).await?;
                    Ok(false)
                } else {
                    self.cancel_locked(existing).await?;
                    Ok(true)
                }
            }
            JobStatus::Retry => {
                self.handle_retry_locked(existing).await?;
                Ok(false)
            }
            status => {
                debug!(%status, "existing record in unexpected status, not rescheduling");
                Ok(false)
            }
        }
    }

    async fn handle_success_locked(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        // A retry replaced the recurring handle with a one-shot, so a periodic
        // job coming out of RETRY needs its recurring timer armed again.
        let recovering = job.status == JobStatus::Retry;
        let job = job.increment_execution_counter();
        let repeat_interval = job.job.repeat_interval;

        let next = match repeat_interval {
            Some(interval) if job.valid_limit() => {
                let next_expiration = job
                    .expiration_time
                    .checked_add_signed(interval)
                    .ok_or_else(|| {
                        SchedulerError::InvalidJob(format!(
                            "job {} next expiration time is out of range",
                            job.id()
                        ))
                    })?;
                if !job.was_periodic_scheduled() || recovering {
                    let scheduled_id = self
                        .replace_timer(&job, Arm::Periodic(to_std(interval, &job.job)?))
                        .await?;
                    job.with_scheduled_id(Some(scheduled_id))
                        .with_status(JobStatus::Scheduled)
                        .with_expiration_time(next_expiration)
                } else {
                    job.with_status(JobStatus::Scheduled)
                        .with_expiration_time(next_expiration)
                }
            }
            _ => job.with_status(JobStatus::Executed),
        };
        let next = next.with_last_update(self.clock.now());

        if next.status == JobStatus::Executed {
            self.finalize(next).await
        } else {
            debug!(
                execution_counter = next.execution_counter,
                expiration_time = %next.expiration_time,
                "periodic job advanced"
            );
            self.repository.save(next).await
        }
    }

    async fn handle_retry_locked(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        if self.is_expired(job.expiration_time) {
            return self.finalize(job.with_status(JobStatus::Error)).await;
        }

        let scheduled_id = self
            .replace_timer(&job, Arm::Once(self.config.backoff_retry()))
            .await?;

        let next = job
            .with_scheduled_id(Some(scheduled_id))
            .with_status(JobStatus::Retry)
            .increment_retries()
            .with_last_update(self.clock.now());

        info!(
            retries = next.retries,
            backoff_ms = self.config.backoff_retry_millis,
            "retrying job"
        );
        self.repository.save(next).await
    }

    async fn cancel_locked(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        self.finalize(job.with_status(JobStatus::Canceled)).await
    }

    async fn resume_periodic_locked(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        let Some(interval) = job.job.repeat_interval else {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} is not periodic",
                job.id()
            )));
        };

        let scheduled_id = self
            .replace_timer(&job, Arm::Periodic(to_std(interval, &job.job)?))
            .await?;
        let next = job
            .with_scheduled_id(Some(scheduled_id))
            .with_status(JobStatus::Scheduled)
            .with_last_update(self.clock.now());

        info!(scheduled_id = ?next.scheduled_id, "resumed periodic job");
        self.repository.save(next).await
    }

    /// Disarm the job's timer and delete its record.
    ///
    /// A failed cancel does not block the delete: a timer that still fires
    /// finds no record and is ignored.
    async fn finalize(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        self.cancel_timer(&job).await;
        self.repository.delete(&job).await?;

        match job.status {
            JobStatus::Error => warn!(
                job_id = %job.id(),
                retries = job.retries,
                expiration_time = %job.expiration_time,
                "job expired beyond retry window, giving up"
            ),
            status => info!(
                job_id = %job.id(),
                %status,
                execution_counter = job.execution_counter,
                "job finalized"
            ),
        }
        Ok(job)
    }

    // =========================================================================
    // Timer handle management
    // =========================================================================

    /// Cancel the job's current handle, then arm a new one.
    async fn replace_timer(&self, job: &ScheduledJob, arm: Arm) -> Result<String> {
        self.cancel_timer(job).await;
        match arm {
            Arm::Once(delay) => self.timer.do_schedule(delay, &job.job).await,
            Arm::Periodic(interval) => self.timer.do_periodic_schedule(interval, &job.job).await,
        }
    }

    /// Best-effort cancel of the job's current handle.
    async fn cancel_timer(&self, job: &ScheduledJob) {
        let Some(scheduled_id) = job.scheduled_id.as_deref() else {
            return;
        };
        match self.timer.do_cancel(job).await {
            Ok(true) => debug!(job_id = %job.id(), %scheduled_id, "cancelled previous timer"),
            Ok(false) => debug!(job_id = %job.id(), %scheduled_id, "previous timer already gone"),
            Err(e) => warn!(job_id = %job.id(), %scheduled_id, error = %e, "failed to cancel timer"),
        }
    }

    // =========================================================================
    // Per-id locking
    // =========================================================================

    async fn lock(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(job_id.to_string()).or_default().value());
        lock.lock_owned().await
    }

    fn unlock(&self, job_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        // Only the map itself still references an idle lock.
        self.locks.remove_if(job_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn validate(job: &Job) -> Result<()> {
    if job.id.trim().is_empty() {
        return Err(SchedulerError::InvalidJob("job id must not be empty".to_string()));
    }
    if let Some(interval) = job.repeat_interval {
        if interval <= Duration::zero() {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} has a non-positive repeat interval",
                job.id
            )));
        }
        if interval > Duration::days(MAX_REPEAT_INTERVAL_DAYS)
            || job.expiration_time.checked_add_signed(interval).is_none()
        {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} has a repeat interval out of range",
                job.id
            )));
        }
    }
    Ok(())
}

fn to_std(interval: Duration, job: &Job) -> Result<std::time::Duration> {
    interval
        .to_std()
        .map_err(|_| SchedulerError::InvalidJob(format!("job {} has a negative interval", job.id)))
}
