//! Periodic background tasks and the resume watchdog.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use resonance_core::{JobQueue, QueueKind, Result, ScheduleStore};

/// A closure run on a fixed interval until cancelled.
///
/// The first run happens immediately. Dropping the handle also stops the
/// task, after any run in progress.
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for it to exit.
    pub async fn cancel(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!(task = self.name, error = ?e, "Periodic task panicked");
        }
    }
}

/// Resumes paused queues once their stored deadline has passed.
pub struct ResumeWatchdog {
    schedules: Arc<dyn ScheduleStore>,
    queues: Vec<Arc<dyn JobQueue>>,
}

impl ResumeWatchdog {
    pub fn new(schedules: Arc<dyn ScheduleStore>, queues: Vec<Arc<dyn JobQueue>>) -> Self {
        Self { schedules, queues }
    }

    /// One pass over every queue. Returns the queues it resumed.
    ///
    /// Safe to run repeatedly: a deadline is cleared once acted on, and a
    /// due deadline on a queue that is already running is just cleared.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<Vec<QueueKind>> {
        let mut resumed = Vec::new();
        for queue in &self.queues {
            let kind = queue.kind();
            let Some(schedule) = self.schedules.resume_schedule(kind).await? else {
                continue;
            };
            if !schedule.is_due(now) {
                continue;
            }

            if queue.is_paused().await? {
                queue.resume().await?;
                info!(
                    subsystem = "watchdog",
                    component = "resume_watchdog",
                    queue = kind.as_str(),
                    resume_at = %schedule.resume_at,
                    "Scheduled pause expired, queue resumed"
                );
                resumed.push(kind);
            } else {
                debug!(
                    subsystem = "watchdog",
                    component = "resume_watchdog",
                    queue = kind.as_str(),
                    "Queue already running, dropping stale resume deadline"
                );
            }
            self.schedules.clear_resume_at(kind).await?;
        }
        Ok(resumed)
    }

    /// Run [`check_once`](Self::check_once) every `period`.
    pub fn spawn(self: Arc<Self>, period: Duration) -> PeriodicTask {
        info!(
            subsystem = "watchdog",
            component = "resume_watchdog",
            period_ms = period.as_millis() as u64,
            "Resume watchdog started"
        );
        PeriodicTask::spawn("resume_watchdog", period, move || {
            let watchdog = self.clone();
            Box::pin(async move {
                if let Err(e) = watchdog.check_once(Utc::now()).await {
                    warn!(
                        subsystem = "watchdog",
                        component = "resume_watchdog",
                        error = %e,
                        "Resume check failed"
                    );
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = PeriodicTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.cancel().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_periodic_task_stops_it() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = PeriodicTask::spawn("counter", Duration::from_secs(1), move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(task.name(), "counter");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(task);
        let seen = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
