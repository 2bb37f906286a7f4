//! Background execution for the cache: periodic sweeps, fire-and-forget store writes and
//! forever-retrying tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Runs background work of the cache on a tokio runtime.
#[derive(Clone, Debug)]
pub struct Scheduler {
    runtime: Handle,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Creates a scheduler for the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Spawns a future that nobody waits for.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    /// Runs `task` after `initial_delay`, and then again `delay` after each run completed.
    ///
    /// The loop runs until the returned [`ScheduledTask`] is dropped.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("scheduled", task = name);
        let handle = self.runtime.spawn(
            async move {
                tokio::time::sleep(initial_delay).await;
                loop {
                    task().await;
                    tokio::time::sleep(delay).await;
                }
            }
            .instrument(span),
        );

        ScheduledTask { name, handle }
    }

    /// Runs `task` every `interval` until it resolves or aborts.
    ///
    /// The first attempt happens one `interval` after this call. Errors are logged together
    /// with the `label` and the attempt number, and the task is tried again. There is no retry
    /// budget; the loop only ends when the task returns a [`Resolution`].
    ///
    /// The loop keeps running when the returned handle is dropped.
    pub fn retry_forever<F, Fut, E>(
        &self,
        label: impl Into<String>,
        interval: Duration,
        mut task: F,
    ) -> RetryHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resolution, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let label = label.into();
        let (sender, state) = watch::channel(RetryState::Pending);
        let attempts = Arc::new(AtomicUsize::new(0));

        let task_label = label.clone();
        let task_attempts = Arc::clone(&attempts);
        self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let attempt = task_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                sender.send_replace(RetryState::Retrying);

                match task().await {
                    Ok(resolution) => {
                        tracing::debug!(label = %task_label, attempt, ?resolution, "Retry finished");
                        sender.send_replace(resolution.into());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            label = %task_label,
                            attempt,
                            error = &e as &dyn std::error::Error,
                            "Retry attempt failed",
                        );
                    }
                }
            }
        });

        RetryHandle {
            label,
            state,
            attempts,
        }
    }
}

/// A periodic task started by [`Scheduler::schedule_with_fixed_delay`].
///
/// Dropping this stops the task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How a forever-retrying task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The task succeeded.
    Resolved,
    /// The task detected that it should not be retried any longer.
    Aborted,
}

/// The state of a task started by [`Scheduler::retry_forever`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    /// Waiting for the first attempt.
    Pending,
    /// At least one attempt has been made, and the task is not finished.
    Retrying,
    Resolved,
    Aborted,
}

impl RetryState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Resolved | Self::Aborted)
    }
}

impl From<Resolution> for RetryState {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved => Self::Resolved,
            Resolution::Aborted => Self::Aborted,
        }
    }
}

/// Observes a forever-retrying task.
#[derive(Clone, Debug)]
pub struct RetryHandle {
    label: String,
    state: watch::Receiver<RetryState>,
    attempts: Arc<AtomicUsize>,
}

impl RetryHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> RetryState {
        *self.state.borrow()
    }

    /// The number of attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Waits until the task is finished, and returns its final state.
    ///
    /// If the runtime shuts down before that, the last observed state is returned.
    pub async fn wait(&mut self) -> RetryState {
        let finished = self
            .state
            .wait_for(|state| state.is_finished())
            .await
            .map(|state| *state);
        match finished {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::test;

    #[derive(Debug, thiserror::Error)]
    #[error("not yet")]
    struct NotYet;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay() {
        test::setup();
        let scheduler = Scheduler::current();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let task = scheduler.schedule_with_fixed_delay(
            "count",
            Duration::from_secs(10),
            Duration::from_secs(5),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        assert_eq!(task.name(), "count");

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // runs at 10s, 15s and 20s
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        drop(task);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_resolved() {
        test::setup();
        let scheduler = Scheduler::current();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let mut handle = scheduler.retry_forever("flaky", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(NotYet)
                } else {
                    Ok(Resolution::Resolved)
                }
            }
        });
        assert_eq!(handle.label(), "flaky");
        assert_eq!(handle.state(), RetryState::Pending);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.state(), RetryState::Retrying);
        assert_eq!(handle.attempts(), 1);

        assert_eq!(handle.wait().await, RetryState::Resolved);
        assert_eq!(handle.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_aborted() {
        test::setup();
        let scheduler = Scheduler::current();
        let abort = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&abort);
        let mut handle = scheduler.retry_forever("abortable", Duration::from_secs(1), move || {
            let flag = Arc::clone(&flag);
            async move {
                match flag.load(Ordering::SeqCst) {
                    true => Ok(Resolution::Aborted),
                    false => Err(NotYet),
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(handle.attempts(), 5);

        abort.store(true, Ordering::SeqCst);
        assert_eq!(handle.wait().await, RetryState::Aborted);
        assert_eq!(handle.attempts(), 6);
    }
}
