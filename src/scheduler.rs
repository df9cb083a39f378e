//! Periodic task registration.
//!
//! Actors never start timers on their own. A host hands them a
//! [`Scheduler`], and they register named jobs with a due time and a
//! period. [`TokioScheduler`] runs jobs on the current tokio runtime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// A job run on every tick. Each call returns a fresh future.
pub type ScheduledJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Registers periodic jobs.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `job` once after `due`, then every `period` until the returned
    /// task is cancelled or dropped.
    fn schedule(
        &self,
        name: &str,
        due: Duration,
        period: Duration,
        job: ScheduledJob,
    ) -> ScheduledTask;
}

/// Handle to a registered job. Dropping it cancels the job.
pub struct ScheduledTask {
    name: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ScheduledTask {
    /// Wrap a scheduler-specific cancel action.
    pub fn new(name: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Name given at registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the job. A run already in progress completes.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            tracing::debug!(task = %self.name, "scheduled task cancelled");
            cancel();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// [`Scheduler`] backed by `tokio::spawn` and `tokio::time::interval`.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(
        &self,
        name: &str,
        due: Duration,
        period: Duration,
        job: ScheduledJob,
    ) -> ScheduledTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task_name = name.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(due) => {}
                _ = shutdown_rx.changed() => return,
            }
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => job().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!(task = %task_name, "scheduled task stopped");
        });

        ScheduledTask::new(name, move || {
            let _ = shutdown_tx.send(true);
        })
    }
}
