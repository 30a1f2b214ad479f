//! Job repository persisted as a single JSON document.
//!
//! The whole record set is kept in memory and rewritten to disk after every
//! mutation. Writes go to a sibling temp file that is then renamed over the
//! original, so a crash mid-write leaves the previous document intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::repository::JobRepository;
use crate::types::{JobStatus, ScheduledJob};

/// File-backed [`JobRepository`].
pub struct FileJobRepository {
    path: PathBuf,
    jobs: RwLock<BTreeMap<String, ScheduledJob>>,
}

impl FileJobRepository {
    /// Open the store at `path`, creating an empty one if it does not exist.
    #[tracing::instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let records: Vec<ScheduledJob> = serde_json::from_slice(&bytes)?;
                records
                    .into_iter()
                    .map(|job| (job.id().to_string(), job))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!(count = jobs.len(), "opened job store");
        Ok(Self {
            path,
            jobs: RwLock::new(jobs),
        })
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, jobs: &BTreeMap<String, ScheduledJob>) -> Result<()> {
        let records: Vec<&ScheduledJob> = jobs.values().collect();
        let bytes = serde_json::to_vec_pretty(&records)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(count = records.len(), "persisted job store");
        Ok(())
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.read().await.contains_key(id))
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save(&self, job: ScheduledJob) -> Result<ScheduledJob> {
        let mut jobs = self.jobs.write().await;
        let mut next = jobs.clone();
        next.insert(job.id().to_string(), job.clone());
        self.persist(&next).await?;
        *jobs = next;
        Ok(job)
    }

    async fn delete(&self, job: &ScheduledJob) -> Result<Option<ScheduledJob>> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(job.id()) {
            return Ok(None);
        }
        let mut next = jobs.clone();
        let removed = next.remove(job.id());
        self.persist(&next).await?;
        *jobs = next;
        Ok(removed)
    }

    async fn find_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ScheduledJob>> {
        let mut found: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.expiration_time.cmp(&b.expiration_time));
        Ok(found)
    }
}
