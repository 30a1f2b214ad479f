//! List command: dump persisted job records.

use std::io::Write;
use std::path::Path;

use miette::Result;

use kairos_scheduler::{FileJobRepository, JobRepository, JobStatus};

/// Parse a `--status` value. Only active statuses are ever persisted.
pub fn parse_active_status(value: &str) -> std::result::Result<JobStatus, String> {
    let status: JobStatus = value.parse()?;
    if status.is_terminal() {
        return Err(format!(
            "{status} records are deleted, not stored; expected SCHEDULED or RETRY"
        ));
    }
    Ok(status)
}

/// Write one JSON object per record, ordered by expiration time.
///
/// With no statuses given, every active record is listed.
pub async fn run(store: &Path, statuses: &[JobStatus], out: &mut impl Write) -> Result<()> {
    let repository = FileJobRepository::open(store)
        .await
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;

    let statuses: &[JobStatus] = if statuses.is_empty() {
        &JobStatus::ACTIVE
    } else {
        statuses
    };
    let jobs = repository
        .find_by_status(statuses)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    for job in jobs {
        let line = serde_json::to_string(&job).map_err(|e| miette::miette!("{}", e))?;
        writeln!(out, "{line}").map_err(|e| miette::miette!("{}", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kairos_scheduler::{Job, ScheduledJob};

    async fn store_with_jobs(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("jobs.json");
        let repository = FileJobRepository::open(&path).await.unwrap();
        let now = Utc::now();
        repository
            .save(ScheduledJob::new(
                Job::once("later", now + Duration::hours(2)),
                "h1".to_string(),
                now,
            ))
            .await
            .unwrap();
        repository
            .save(
                ScheduledJob::new(Job::once("sooner", now + Duration::hours(1)), "h2".to_string(), now)
                    .with_status(JobStatus::Retry),
            )
            .await
            .unwrap();
        path
    }

    fn ids(output: &[u8]) -> Vec<String> {
        String::from_utf8(output.to_vec())
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["job"]["id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lists_all_active_jobs_in_expiration_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_with_jobs(dir.path()).await;

        let mut out = Vec::new();
        run(&path, &[], &mut out).await.unwrap();

        assert_eq!(ids(&out), vec!["sooner", "later"]);
    }

    #[tokio::test]
    async fn test_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_with_jobs(dir.path()).await;

        let mut out = Vec::new();
        run(&path, &[JobStatus::Scheduled], &mut out).await.unwrap();

        assert_eq!(ids(&out), vec!["later"]);
    }

    #[test]
    fn test_status_flag_accepts_only_active_statuses() {
        assert_eq!(parse_active_status("scheduled"), Ok(JobStatus::Scheduled));
        assert_eq!(parse_active_status("RETRY"), Ok(JobStatus::Retry));
        for terminal in ["EXECUTED", "canceled", "Error"] {
            assert!(parse_active_status(terminal).is_err(), "{terminal}");
        }
        assert!(parse_active_status("paused").is_err());
    }

    #[tokio::test]
    async fn test_empty_store_prints_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        run(&dir.path().join("none.json"), &[], &mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
