//! One-shot message scheduler.
//!
//! Pending jobs sit in a map ordered by fire time. A timer task sleeps until the
//! earliest one is due (re-polling at least every [`MAX_SLEEP`]), takes every due job
//! out of the map under the lock, and hands each to the [`Delivery`] in its own task.
//! A job is therefore delivered at most once, and failures are logged, not retried.
//! Nothing is persisted: pending jobs are dropped on stop.

mod clock;
mod delivery;

pub use clock::{parse_time_of_day, resolve_fire_time};
pub use delivery::{ChannelDelivery, Delivery, DeliveryError, DeliveryTarget};

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Upper bound on one timer sleep, so wall-clock changes are picked up.
pub const MAX_SLEEP: Duration = Duration::from_secs(30);

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid time {0:?}; expected HH:MM")]
    InvalidTimeFormat(String),
    #[error("fire time {0} is not in the future")]
    FireTimeInPast(DateTime<Local>),
    #[error("scheduler is stopped")]
    Stopped,
}

/// A pending one-shot message.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: JobId,
    pub fire_at: DateTime<Local>,
    pub target: DeliveryTarget,
    pub payload: String,
}

type JobKey = (DateTime<Local>, JobId);

struct Shared {
    jobs: Mutex<BTreeMap<JobKey, ScheduledJob>>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobKey, ScheduledJob>> {
        // Poisoning is ignored: every critical section leaves the map consistent.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove and return every job due at `now`, earliest first.
    fn take_due(&self, now: DateTime<Local>) -> Vec<ScheduledJob> {
        let mut jobs = self.lock_jobs();
        let mut due = Vec::new();
        while let Some(entry) = jobs.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// How long the timer may sleep before the earliest job is due.
    fn next_wait(&self, now: DateTime<Local>) -> Duration {
        let jobs = self.lock_jobs();
        match jobs.keys().next() {
            Some((fire_at, _)) => (*fire_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP),
            None => MAX_SLEEP,
        }
    }
}

/// Scheduler handle; cheap to clone and share with the dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(BTreeMap::new()),
                wake: Notify::new(),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// Schedule `payload` for the next occurrence of `time` (`HH:MM`, local time).
    pub fn schedule(
        &self,
        time: &str,
        payload: impl Into<String>,
        target: DeliveryTarget,
    ) -> Result<JobId, SchedulerError> {
        let time_of_day = parse_time_of_day(time)?;
        let now = Local::now();
        let fire_at = resolve_fire_time(time_of_day, &now)
            .ok_or_else(|| SchedulerError::InvalidTimeFormat(time.to_string()))?;
        self.insert(fire_at, payload.into(), target)
    }

    /// Schedule `payload` at an absolute instant, which must be in the future.
    pub fn schedule_at(
        &self,
        fire_at: DateTime<Local>,
        payload: impl Into<String>,
        target: DeliveryTarget,
    ) -> Result<JobId, SchedulerError> {
        if fire_at <= Local::now() {
            return Err(SchedulerError::FireTimeInPast(fire_at));
        }
        self.insert(fire_at, payload.into(), target)
    }

    fn insert(
        &self,
        fire_at: DateTime<Local>,
        payload: String,
        target: DeliveryTarget,
    ) -> Result<JobId, SchedulerError> {
        let mut jobs = self.shared.lock_jobs();
        // Checked under the jobs lock; `stop` raises the flag before clearing the map.
        if *self.shared.shutdown.borrow() {
            return Err(SchedulerError::Stopped);
        }
        let id = Uuid::new_v4();
        log::info!(
            "scheduler: job {} scheduled for {} to {}",
            id,
            fire_at.format("%Y-%m-%d %H:%M"),
            target
        );
        let job = ScheduledJob {
            id,
            fire_at,
            target,
            payload,
        };
        jobs.insert((fire_at, id), job);
        drop(jobs);
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Number of jobs still waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared.lock_jobs().len()
    }

    /// Start the timer task. Calling it again while running is a no-op.
    pub fn start(&self, delivery: Arc<dyn Delivery>) {
        let mut task = self.shared.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            log::debug!("scheduler: already running");
            return;
        }
        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(run_timer(shared, delivery, shutdown)));
        log::info!("scheduler: started");
    }

    /// Stop the timer task and wait for it to exit. Pending jobs are discarded and
    /// later schedule calls fail with [`SchedulerError::Stopped`] until the next `start`.
    pub async fn stop(&self) {
        self.shared.shutdown.send_replace(true);
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let dropped = {
            let mut jobs = self.shared.lock_jobs();
            let n = jobs.len();
            jobs.clear();
            n
        };
        if dropped > 0 {
            log::warn!("scheduler: stopped with {} pending job(s) discarded", dropped);
        } else {
            log::info!("scheduler: stopped");
        }
    }
}

async fn run_timer(
    shared: Arc<Shared>,
    delivery: Arc<dyn Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        for job in shared.take_due(Local::now()) {
            tokio::spawn(fire(delivery.clone(), job));
        }
        let wait = shared.next_wait(Local::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shared.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("scheduler: timer task exited");
}

async fn fire(delivery: Arc<dyn Delivery>, job: ScheduledJob) {
    log::info!("scheduler: firing job {} to {}", job.id, job.target);
    match delivery.deliver(&job.payload, &job.target).await {
        Ok(()) => log::debug!("scheduler: job {} delivered", job.id),
        Err(e) => log::warn!("scheduler: job {} delivery failed (not retried): {}", job.id, e),
    }
}
