//! Durable store for scheduled jobs, keyed by job id.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::types::{JobStatus, ScheduledJob};

/// Storage contract consumed by the timer scheduler.
///
/// Each call is atomic for a single record; the scheduler relies on nothing
/// stronger than that.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Whether a record exists for this id.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Fetch the record for this id.
    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>>;

    /// Insert or replace the record, returning what was stored.
    async fn save(&self, job: ScheduledJob) -> Result<ScheduledJob>;

    /// Remove the record, returning it if it was present.
    async fn delete(&self, job: &ScheduledJob) -> Result<Option<ScheduledJob>>;

    /// All records in any of the given statuses, earliest expiration first.
    async fn find_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ScheduledJob>>;
}

/// Repository held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: DashMap<String, ScheduledJob>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.contains_key(id))
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        self.jobs.insert(job.id().to_string(), job.clone());
        Ok(job)
    }

    async fn delete(&self, job: &ScheduledJob) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.remove(job.id()).map(|(_, removed)| removed))
    }

    async fn find_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ScheduledJob>> {
        let mut found: Vec<ScheduledJob> = self
            .jobs
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.expiration_time.cmp(&b.expiration_time));
        Ok(found)
    }
}
