//! Timer-based job scheduling engine for Kairos.
//!
//! This crate provides a durable job scheduler that:
//! - Arms one-shot and periodic jobs against a pluggable timer backend
//! - Keeps at most one live timer handle per job
//! - Retries failed executions with a fixed backoff, bounded by a
//!   wall-clock window after the job's expiration
//! - Deletes jobs as soon as they reach a terminal status
//! - Re-arms persisted jobs after a restart

mod clock;
mod config;
mod error;
mod executor;
mod file_store;
mod http_executor;
mod manager;
mod repository;
mod scheduler;
mod timer;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_BACKOFF_RETRY_MILLIS, DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS, SchedulerConfig,
};
pub use error::{Result, SchedulerError};
pub use executor::{JobExecutionResponse, JobExecutor};
pub use file_store::FileJobRepository;
pub use http_executor::{DEFAULT_HTTP_TIMEOUT_SECS, HttpJobExecutor};
pub use manager::{RecoveryReport, SchedulerManager};
pub use repository::{InMemoryJobRepository, JobRepository};
pub use scheduler::TimerScheduler;
pub use timer::{TimerBackend, TimerFired, TokioTimerBackend};
pub use types::{Job, JobStatus, Recipient, ScheduledJob};
