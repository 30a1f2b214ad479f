//! Startup recovery.
//!
//! Timer handles die with the process. On startup every job still in
//! SCHEDULED or RETRY is handed back to the timer scheduler so it gets a
//! live handle again.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::Result;
use crate::repository::JobRepository;
use crate::scheduler::TimerScheduler;
use crate::types::{JobStatus, ScheduledJob};

/// What recovery did with the jobs it found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Re-armed through `schedule()`.
    pub rescheduled: usize,
    /// Periodic jobs whose recurring timer was re-armed.
    pub resumed: usize,
    /// Overdue jobs sent down the retry path.
    pub retried: usize,
    /// Jobs that could not be recovered.
    pub failed: usize,
}

/// Re-arms persisted jobs after a restart.
pub struct SchedulerManager {
    scheduler: Arc<TimerScheduler>,
    repository: Arc<dyn JobRepository>,
}

impl SchedulerManager {
    pub fn new(scheduler: Arc<TimerScheduler>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            scheduler,
            repository,
        }
    }

    /// Load all active jobs and re-arm each one.
    ///
    /// A job that fails to recover is logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let jobs = self.repository.find_by_status(&JobStatus::ACTIVE).await?;
        info!(count = jobs.len(), "recovering jobs");

        let mut report = RecoveryReport::default();
        for job in jobs {
            let job_id = job.id().to_string();
            match self.recover_job(job).await {
                Ok(Recovered::Rescheduled) => report.rescheduled += 1,
                Ok(Recovered::Resumed) => report.resumed += 1,
                Ok(Recovered::Retried) => report.retried += 1,
                Err(e) => {
                    error!(%job_id, error = %e, "failed to recover job, skipping");
                    report.failed += 1;
                }
            }
        }

        info!(
            rescheduled = report.rescheduled,
            resumed = report.resumed,
            retried = report.retried,
            failed = report.failed,
            "recovery complete"
        );
        Ok(report)
    }

    async fn recover_job(&self, job: ScheduledJob) -> Result<Recovered> {
        // Missed its time while we were down: let the retry window decide.
        if job.expiration_time <= self.scheduler.now() {
            self.scheduler.handle_retry(job.id()).await?;
            return Ok(Recovered::Retried);
        }

        // The recurring timer was armed on the first success; re-arm it
        // directly, since `schedule()` would treat the job as self-sustaining.
        if job.status == JobStatus::Scheduled && job.has_interval() && job.execution_counter >= 1
        {
            self.scheduler.resume_periodic(job.id()).await?;
            return Ok(Recovered::Resumed);
        }

        self.scheduler.schedule(job.current_job()).await?;
        Ok(Recovered::Rescheduled)
    }
}

enum Recovered {
    Rescheduled,
    Resumed,
    Retried,
}
