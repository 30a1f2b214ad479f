//! Scheduler types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a job is delivered when it fires, and what it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    /// Endpoint the executor delivers to.
    pub url: String,
    /// Opaque body forwarded to the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Recipient {
    /// Create a recipient without a payload.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Immutable description of work to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier.
    pub id: String,
    /// When the job should first fire.
    pub expiration_time: DateTime<Utc>,
    /// Present for periodic jobs.
    #[serde(default, with = "interval_millis", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    /// Upper bound on firings. Absent or negative means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_limit: Option<i32>,
    /// What the executor should do when the job fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
}

impl Job {
    /// Create a one-shot job firing at `at`.
    pub fn once(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            expiration_time: at,
            repeat_interval: None,
            repeat_limit: None,
            recipient: None,
        }
    }

    /// Create a periodic job first firing at `at`, then every `interval`.
    pub fn periodic(
        id: impl Into<String>,
        at: DateTime<Utc>,
        interval: Duration,
        limit: Option<i32>,
    ) -> Self {
        Self {
            id: id.into(),
            expiration_time: at,
            repeat_interval: Some(interval),
            repeat_limit: limit,
            recipient: None,
        }
    }

    /// Attach a recipient.
    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Whether this job repeats.
    pub fn is_periodic(&self) -> bool {
        self.repeat_interval.is_some()
    }

    /// The repeat limit, if it bounds anything.
    pub fn effective_repeat_limit(&self) -> Option<u32> {
        self.repeat_limit.and_then(|limit| u32::try_from(limit).ok())
    }
}

/// Lifecycle state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Armed and waiting for its timer.
    Scheduled,
    /// Armed for another attempt after a failed execution.
    Retry,
    /// Finished all of its firings.
    Executed,
    /// Cancelled by a caller or superseded by a reschedule.
    Canceled,
    /// Gave up after the retry window elapsed.
    Error,
}

impl JobStatus {
    /// Statuses the Scheduler Manager recovers on startup.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Scheduled, JobStatus::Retry];

    /// Terminal statuses are never persisted: reaching one deletes the record.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Executed | JobStatus::Canceled | JobStatus::Error
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Retry => "RETRY",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RETRY" => Ok(JobStatus::Retry),
            "EXECUTED" => Ok(JobStatus::Executed),
            "CANCELED" => Ok(JobStatus::Canceled),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Mutable runtime record wrapping a [`Job`].
///
/// Values are never edited in place by the scheduler: each transition builds
/// a new record through the `with_*` helpers and persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    /// The job being scheduled.
    pub job: Job,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Handle of the live timer, if one is armed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_id: Option<String>,
    /// Number of times the job has fired.
    pub execution_counter: u32,
    /// Number of retry attempts after failures.
    pub retries: u32,
    /// Current expiration time. Advances for periodic jobs.
    pub expiration_time: DateTime<Utc>,
    /// When this record last changed.
    pub last_update: DateTime<Utc>,
}

impl ScheduledJob {
    /// Wrap a freshly armed job.
    pub fn new(job: Job, scheduled_id: String, now: DateTime<Utc>) -> Self {
        Self {
            expiration_time: job.expiration_time,
            job,
            status: JobStatus::Scheduled,
            scheduled_id: Some(scheduled_id),
            execution_counter: 0,
            retries: 0,
            last_update: now,
        }
    }

    /// The job id.
    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_scheduled_id(mut self, scheduled_id: Option<String>) -> Self {
        self.scheduled_id = scheduled_id;
        self
    }

    pub fn with_expiration_time(mut self, expiration_time: DateTime<Utc>) -> Self {
        self.expiration_time = expiration_time;
        self
    }

    pub fn with_last_update(mut self, now: DateTime<Utc>) -> Self {
        self.last_update = now;
        self
    }

    pub fn increment_execution_counter(mut self) -> Self {
        self.execution_counter = self.execution_counter.saturating_add(1);
        self
    }

    pub fn increment_retries(mut self) -> Self {
        self.retries = self.retries.saturating_add(1);
        self
    }

    /// Whether the underlying job repeats.
    pub fn has_interval(&self) -> bool {
        self.job.is_periodic()
    }

    /// The job with its expiration time brought up to date, as handed back
    /// to `schedule()` during recovery.
    pub fn current_job(&self) -> Job {
        Job {
            expiration_time: self.expiration_time,
            ..self.job.clone()
        }
    }

    /// Another firing is allowed: no limit, or the counter is still below it.
    pub fn valid_limit(&self) -> bool {
        match self.job.effective_repeat_limit() {
            Some(limit) => self.execution_counter < limit,
            None => true,
        }
    }

    /// The recurring timer has already been armed once.
    ///
    /// The first success arms it (counter reaches 1), so anything above that
    /// means the backend is already firing on its own.
    pub fn was_periodic_scheduled(&self) -> bool {
        self.execution_counter > 1
    }
}

/// Serializes an optional [`Duration`] as whole milliseconds.
mod interval_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.num_milliseconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<i64>::deserialize(deserializer)?.map(Duration::milliseconds))
    }
}
