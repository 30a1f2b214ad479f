//! Shared test doubles for the scheduler integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kairos_scheduler::{
    InMemoryJobRepository, Job, JobExecutionResponse, JobExecutor, JobRepository, ManualClock,
    ScheduledJob, SchedulerConfig, SchedulerError, TimerBackend, TimerFired, TimerScheduler,
};

/// A call made against the timer backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCall {
    Schedule { job_id: String, delay: Duration },
    Periodic { job_id: String, interval: Duration },
    Cancel { job_id: String, scheduled_id: String },
}

#[derive(Debug, Clone)]
struct LiveTimer {
    job_id: String,
    periodic: bool,
}

/// Timer backend that records every call and never fires on its own.
///
/// Tests fire handles explicitly with [`RecordingTimerBackend::fire`].
#[derive(Default)]
pub struct RecordingTimerBackend {
    next_id: AtomicU64,
    calls: Mutex<Vec<TimerCall>>,
    live: Mutex<HashMap<String, LiveTimer>>,
    fail_cancels: AtomicBool,
}

impl RecordingTimerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later cancel fail, leaving its handle live.
    pub fn fail_cancels(&self) {
        self.fail_cancels.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TimerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn arm_count(&self, job_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| match c {
                TimerCall::Schedule { job_id: id, .. } | TimerCall::Periodic { job_id: id, .. } => {
                    id == job_id
                }
                TimerCall::Cancel { .. } => false,
            })
            .count()
    }

    pub fn periodic_arm_count(&self, job_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TimerCall::Periodic { job_id: id, .. } if id == job_id))
            .count()
    }

    /// Handles currently armed for this job.
    pub fn live_handles(&self, job_id: &str) -> Vec<String> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t.job_id == job_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn total_live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_periodic(&self, scheduled_id: &str) -> bool {
        self.live
            .lock()
            .unwrap()
            .get(scheduled_id)
            .is_some_and(|t| t.periodic)
    }

    /// Simulate a handle going off. One-shot handles are consumed.
    pub fn fire(&self, job_id: &str, scheduled_id: &str) -> TimerFired {
        let mut live = self.live.lock().unwrap();
        if live.get(scheduled_id).is_some_and(|t| !t.periodic) {
            live.remove(scheduled_id);
        }
        TimerFired {
            job_id: job_id.to_string(),
            scheduled_id: scheduled_id.to_string(),
        }
    }

    fn arm(&self, job_id: &str, periodic: bool) -> String {
        let id = format!("timer-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(
            id.clone(),
            LiveTimer {
                job_id: job_id.to_string(),
                periodic,
            },
        );
        id
    }
}

#[async_trait]
impl TimerBackend for RecordingTimerBackend {
    async fn do_schedule(&self, delay: Duration, job: &Job) -> kairos_scheduler::Result<String> {
        self.calls.lock().unwrap().push(TimerCall::Schedule {
            job_id: job.id.clone(),
            delay,
        });
        Ok(self.arm(&job.id, false))
    }

    async fn do_periodic_schedule(
        &self,
        interval: Duration,
        job: &Job,
    ) -> kairos_scheduler::Result<String> {
        self.calls.lock().unwrap().push(TimerCall::Periodic {
            job_id: job.id.clone(),
            interval,
        });
        Ok(self.arm(&job.id, true))
    }

    async fn do_cancel(&self, job: &ScheduledJob) -> kairos_scheduler::Result<bool> {
        let Some(scheduled_id) = job.scheduled_id.clone() else {
            return Ok(false);
        };
        self.calls.lock().unwrap().push(TimerCall::Cancel {
            job_id: job.id().to_string(),
            scheduled_id: scheduled_id.clone(),
        });
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(SchedulerError::Timer(format!(
                "backend refused to cancel {scheduled_id}"
            )));
        }
        Ok(self.live.lock().unwrap().remove(&scheduled_id).is_some())
    }
}

/// Executor whose outcomes are scripted up front, falling back to a fixed
/// outcome once the script runs out.
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn succeeding() -> Self {
        Self::scripted(Vec::new(), true)
    }

    pub fn failing_times(n: usize) -> Self {
        Self::scripted(vec![false; n], true)
    }

    pub fn always_failing() -> Self {
        Self::scripted(Vec::new(), false)
    }

    pub fn scripted(outcomes: Vec<bool>, fallback: bool) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &ScheduledJob,
    ) -> Result<JobExecutionResponse, JobExecutionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(self.fallback);
        let response = JobExecutionResponse::new(job.id());
        if succeed {
            Ok(response.with_code("200"))
        } else {
            Err(response.with_code("500").with_message("scripted failure"))
        }
    }
}

/// A scheduler wired to an in-memory repository, a recording backend and a
/// manual clock.
pub struct Harness {
    pub scheduler: Arc<TimerScheduler>,
    pub repository: Arc<InMemoryJobRepository>,
    pub timer: Arc<RecordingTimerBackend>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let repository = Arc::new(InMemoryJobRepository::new());
        let timer = Arc::new(RecordingTimerBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = Arc::new(
            TimerScheduler::new(
                Arc::clone(&repository) as Arc<dyn JobRepository>,
                Arc::clone(&timer) as Arc<dyn TimerBackend>,
                config,
            )
            .with_clock(Arc::clone(&clock) as Arc<dyn kairos_scheduler::Clock>),
        );
        Self {
            scheduler,
            repository,
            timer,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use kairos_scheduler::Clock;
        self.clock.now()
    }

    pub async fn record(&self, job_id: &str) -> Option<ScheduledJob> {
        self.repository.get(job_id).await.unwrap()
    }

    /// Fire the job's current handle through the scheduler.
    pub async fn fire(
        &self,
        job_id: &str,
        executor: &dyn JobExecutor,
    ) -> kairos_scheduler::Result<Option<ScheduledJob>> {
        let record = self.record(job_id).await.expect("job should exist to fire");
        let scheduled_id = record.scheduled_id.expect("job should have a handle");
        let fired = self.timer.fire(job_id, &scheduled_id);
        self.scheduler.on_timer_fired(&fired, executor).await
    }
}
