use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::error::{GenError, Result};
use crate::service::StatusSource;
use crate::types::{Completion, StatusReport, TaskHandle};

/// Polls a task's status endpoint on a fixed cadence until it is ready,
/// fails, or runs out of attempts.
///
/// Checks for one handle are strictly sequential, and a handle can only be
/// polled by one loop at a time.
pub struct BoundedPoller<S> {
    source: S,
    config: PollConfig,
    active: Arc<Mutex<HashSet<String>>>,
}

impl<S> std::fmt::Debug for BoundedPoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPoller")
            .field("config", &self.config)
            .field("active", &self.active.lock().map(|a| a.len()).unwrap_or(0))
            .finish()
    }
}

/// Marks a handle as being polled; released on every exit path.
struct ActiveSlot {
    active: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.task_id);
        }
    }
}

impl<S: StatusSource> BoundedPoller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self {
            source,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Whether a poll loop is currently running for this task id.
    pub fn is_polling(&self, task_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(task_id))
            .unwrap_or(false)
    }

    fn claim(&self, handle: &TaskHandle) -> Result<ActiveSlot> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| GenError::Validation("Poller state is unavailable".into()))?;
        if !active.insert(handle.id.clone()) {
            return Err(GenError::Validation(format!(
                "Task {} is already being polled",
                handle.id
            )));
        }
        Ok(ActiveSlot {
            active: Arc::clone(&self.active),
            task_id: handle.id.clone(),
        })
    }

    /// Wait for `handle` to finish.
    ///
    /// Returns `Completion::Cancelled` if `cancel` fires first. Fails with
    /// `RemoteFailure` when the service reports the job failed, and with
    /// `Timeout` once `max_attempts` checks have all come back pending.
    pub async fn poll(&self, handle: &TaskHandle, cancel: &CancellationToken) -> Result<Completion> {
        if self.config.max_attempts == 0 {
            return Err(GenError::Validation(
                "Polling needs at least one attempt".into(),
            ));
        }
        let _slot = self.claim(handle)?;
        let max_attempts = self.config.max_attempts;

        if !sleep_or_cancel(self.config.initial_delay, cancel).await {
            tracing::debug!(task_id = %handle.id, "Polling cancelled before first check");
            return Ok(Completion::Cancelled);
        }

        for attempt in 1..=max_attempts {
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Completion::Cancelled),
                report = self.source.fetch_status(handle, self.config.media) => report,
            };

            match report {
                Ok(StatusReport::Ready(record)) => {
                    tracing::info!(task_id = %handle.id, attempt, url = %record.url, "Task ready");
                    return Ok(Completion::Ready(record));
                }
                Ok(StatusReport::Failed(reason)) => {
                    tracing::warn!(task_id = %handle.id, attempt, %reason, "Task failed remotely");
                    return Err(GenError::RemoteFailure(reason));
                }
                Ok(StatusReport::Pending) => {
                    tracing::debug!(task_id = %handle.id, attempt, max_attempts, "Task pending");
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %handle.id,
                        attempt,
                        error = %e,
                        "Status check failed, counting as pending",
                    );
                }
            }

            if attempt < max_attempts && !sleep_or_cancel(self.config.interval, cancel).await {
                return Ok(Completion::Cancelled);
            }
        }

        tracing::warn!(task_id = %handle.id, max_attempts, "Polling gave up");
        Err(GenError::Timeout {
            attempts: max_attempts,
        })
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
