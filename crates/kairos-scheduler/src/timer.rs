//! Low-level timer backends.
//!
//! A backend only knows how to wake up later. It arms one-shot and recurring
//! timers, hands back an opaque handle, and reports each firing as a
//! [`TimerFired`]. All lifecycle decisions stay in the timer scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::types::{Job, ScheduledJob};

/// A timer went off for `job_id` through the handle `scheduled_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub job_id: String,
    pub scheduled_id: String,
}

/// Pluggable "wake me up at time T" primitive.
#[async_trait]
pub trait TimerBackend: Send + Sync {
    /// Arm a one-shot timer firing after `delay`. Returns the new handle.
    async fn do_schedule(&self, delay: Duration, job: &Job) -> Result<String>;

    /// Arm a timer firing every `interval`. Returns the new handle.
    async fn do_periodic_schedule(&self, interval: Duration, job: &Job) -> Result<String>;

    /// Cancel the job's current handle.
    ///
    /// Returns `false` when there was nothing live to cancel; that is not an
    /// error.
    async fn do_cancel(&self, job: &ScheduledJob) -> Result<bool>;
}

/// Timer backend built on tokio tasks.
///
/// Every handle owns one spawned task. Firings are sent to the receiver
/// returned by [`TokioTimerBackend::new`].
pub struct TokioTimerBackend {
    timers: Arc<DashMap<String, AbortHandle>>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TokioTimerBackend {
    /// Create a backend and the channel its firings arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let backend = Self {
            timers: Arc::new(DashMap::new()),
            fired_tx,
        };
        (backend, fired_rx)
    }

    /// Number of armed timers.
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Whether this handle is still armed.
    pub fn is_active(&self, scheduled_id: &str) -> bool {
        self.timers.contains_key(scheduled_id)
    }

    fn arm<F>(&self, job_id: &str, make_task: F) -> Result<String>
    where
        F: FnOnce(TimerFired) -> tokio::task::JoinHandle<()>,
    {
        let scheduled_id = Uuid::new_v4().to_string();
        let fired = TimerFired {
            job_id: job_id.to_string(),
            scheduled_id: scheduled_id.clone(),
        };

        // The shard stays locked until the abort handle is stored, so a timer
        // that fires immediately cannot remove its entry before it exists.
        match self.timers.entry(scheduled_id.clone()) {
            Entry::Occupied(_) => Err(SchedulerError::Timer(format!(
                "duplicate timer handle {scheduled_id}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(make_task(fired).abort_handle());
                Ok(scheduled_id)
            }
        }
    }
}

#[async_trait]
impl TimerBackend for TokioTimerBackend {
    async fn do_schedule(&self, delay: Duration, job: &Job) -> Result<String> {
        let timers = Arc::clone(&self.timers);
        let fired_tx = self.fired_tx.clone();

        let scheduled_id = self.arm(&job.id, move |fired| {
            tokio::spawn(async move {
                sleep(delay).await;
                timers.remove(&fired.scheduled_id);
                trace!(job_id = %fired.job_id, scheduled_id = %fired.scheduled_id, "one-shot timer fired");
                if fired_tx.send(fired).is_err() {
                    debug!("timer fired after dispatcher shut down");
                }
            })
        })?;

        debug!(job_id = %job.id, %scheduled_id, ?delay, "armed one-shot timer");
        Ok(scheduled_id)
    }

    async fn do_periodic_schedule(&self, interval: Duration, job: &Job) -> Result<String> {
        if interval.is_zero() {
            return Err(SchedulerError::Timer(format!(
                "job {} has a zero repeat interval",
                job.id
            )));
        }

        let start = Instant::now().checked_add(interval).ok_or_else(|| {
            SchedulerError::Timer(format!("job {} repeat interval is out of range", job.id))
        })?;
        let timers = Arc::clone(&self.timers);
        let fired_tx = self.fired_tx.clone();

        let scheduled_id = self.arm(&job.id, move |fired| {
            tokio::spawn(async move {
                let mut ticker = interval_at(start, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    trace!(job_id = %fired.job_id, scheduled_id = %fired.scheduled_id, "periodic timer fired");
                    if fired_tx.send(fired.clone()).is_err() {
                        debug!("periodic timer stopping, dispatcher shut down");
                        timers.remove(&fired.scheduled_id);
                        break;
                    }
                }
            })
        })?;

        debug!(job_id = %job.id, %scheduled_id, ?interval, "armed periodic timer");
        Ok(scheduled_id)
    }

    async fn do_cancel(&self, job: &ScheduledJob) -> Result<bool> {
        let Some(scheduled_id) = job.scheduled_id.as_deref() else {
            return Ok(false);
        };

        match self.timers.remove(scheduled_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(job_id = %job.id(), %scheduled_id, "cancelled timer");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for TokioTimerBackend {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}
