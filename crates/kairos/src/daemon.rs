//! Daemon command for running the scheduler.
//!
//! Startup order matters: recovery runs before seed jobs are scheduled, so a
//! seed job that is already persisted is reconciled against its record
//! instead of racing a second timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use kairos_scheduler::{
    FileJobRepository, HttpJobExecutor, Job, JobExecutor, JobRepository, SchedulerConfig,
    SchedulerError, SchedulerManager, TimerBackend, TimerScheduler, TokioTimerBackend,
};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub store_path: PathBuf,
    pub seed_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub http_timeout: Duration,
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        store = %config.store_path.display(),
        backoff_retry_millis = config.scheduler.backoff_retry_millis,
        max_interval_limit_to_retry_millis = config.scheduler.max_interval_limit_to_retry_millis,
        "starting kairos daemon"
    );

    let repository = Arc::new(
        FileJobRepository::open(&config.store_path)
            .await
            .map_err(|e| miette::miette!("failed to open job store: {}", e))?,
    );
    let (timer, fired_rx) = TokioTimerBackend::new();
    let scheduler = Arc::new(TimerScheduler::new(
        Arc::clone(&repository) as Arc<dyn JobRepository>,
        Arc::new(timer) as Arc<dyn TimerBackend>,
        config.scheduler,
    ));
    let executor = HttpJobExecutor::new(config.http_timeout)
        .map_err(|e| miette::miette!("failed to create HTTP client: {}", e))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    // Start dispatching before recovery so overdue retries armed during
    // recovery are picked up as soon as they fire.
    let dispatcher_handle = tokio::spawn(Arc::clone(&scheduler).run(
        fired_rx,
        Arc::new(executor) as Arc<dyn JobExecutor>,
        shutdown_rx.clone(),
    ));

    let manager = SchedulerManager::new(
        Arc::clone(&scheduler),
        Arc::clone(&repository) as Arc<dyn JobRepository>,
    );
    let report = manager
        .recover()
        .await
        .map_err(|e| miette::miette!("recovery failed: {}", e))?;
    if report.failed > 0 {
        warn!(failed = report.failed, "some jobs could not be recovered");
    }

    if let Some(ref seed_path) = config.seed_path {
        let jobs = load_seed(seed_path).await?;
        schedule_seed(&scheduler, jobs).await;
    }

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx;
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!("shutting down daemon");
    let _ = dispatcher_handle.await;

    info!("daemon shut down gracefully");
    Ok(())
}

/// Read a JSON array of jobs.
async fn load_seed(path: &Path) -> Result<Vec<Job>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| miette::miette!("failed to read seed file {}: {}", path.display(), e))?;
    let jobs: Vec<Job> = serde_json::from_slice(&bytes)
        .map_err(|e| miette::miette!("invalid seed file {}: {}", path.display(), e))?;
    info!(count = jobs.len(), path = %path.display(), "loaded seed jobs");
    Ok(jobs)
}

/// Schedule seed jobs, logging and skipping the ones that are rejected.
async fn schedule_seed(scheduler: &TimerScheduler, jobs: Vec<Job>) -> SeedReport {
    let mut report = SeedReport::default();
    for job in jobs {
        let job_id = job.id.clone();
        match scheduler.schedule(job).await {
            Ok(Some(_)) => report.scheduled += 1,
            Ok(None) => {
                info!(%job_id, "seed job already known, kept existing record");
                report.kept += 1;
            }
            Err(SchedulerError::NegativeDelay { delay_millis, .. }) => {
                warn!(%job_id, delay_millis, "seed job is in the past, skipping");
                report.rejected += 1;
            }
            Err(e) => {
                warn!(%job_id, error = %e, "failed to schedule seed job");
                report.rejected += 1;
            }
        }
    }
    info!(
        scheduled = report.scheduled,
        kept = report.kept,
        rejected = report.rejected,
        "seed jobs processed"
    );
    report
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SeedReport {
    scheduled: usize,
    kept: usize,
    rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kairos_scheduler::InMemoryJobRepository;

    #[tokio::test]
    async fn test_load_seed_parses_job_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        tokio::fs::write(
            &path,
            r#"[
                {"id": "standup", "expirationTime": "2030-01-01T09:00:00Z",
                 "repeatInterval": 86400000, "repeatLimit": 5,
                 "recipient": {"url": "http://localhost:9000/hook", "payload": {"room": "a"}}},
                {"id": "once", "expirationTime": "2030-01-02T00:00:00Z"}
            ]"#,
        )
        .await
        .unwrap();

        let jobs = load_seed(&path).await.unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "standup");
        assert_eq!(jobs[0].repeat_interval, Some(chrono::Duration::days(1)));
        assert_eq!(jobs[0].repeat_limit, Some(5));
        assert!(jobs[1].repeat_interval.is_none());
        assert!(jobs[1].recipient.is_none());
    }

    #[tokio::test]
    async fn test_load_seed_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(load_seed(&path).await.is_err());
        assert!(load_seed(&dir.path().join("missing.json")).await.is_err());
    }

    #[tokio::test]
    async fn test_schedule_seed_skips_rejected_jobs() {
        let (timer, _fired_rx) = TokioTimerBackend::new();
        let scheduler = TimerScheduler::new(
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(timer),
            SchedulerConfig::default(),
        );
        let future = Utc::now() + chrono::Duration::hours(1);

        let report = schedule_seed(
            &scheduler,
            vec![
                Job::once("a", future),
                Job::once("late", Utc::now() - chrono::Duration::hours(1)),
                Job::once("", future),
                Job::once("b", future),
            ],
        )
        .await;

        assert_eq!(
            report,
            SeedReport {
                scheduled: 2,
                kept: 0,
                rejected: 2,
            }
        );
    }
}
