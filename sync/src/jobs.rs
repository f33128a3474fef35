use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub const SUCCESS_DISMISS_AFTER: Duration = Duration::from_secs(3);
pub const ERROR_DISMISS_AFTER: Duration = Duration::from_secs(4);
/// Error message shown for a job whose guard was dropped before it finished.
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Transforming,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformJob {
    pub job_id: String,
    pub state: JobState,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Transforming,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub related_job_id: Option<String>,
}

impl Notification {
    fn transforming(active: usize) -> Self {
        let message = if active == 1 {
            "Transforming image…".to_string()
        } else {
            format!("Transforming {} images…", active)
        };
        Notification {
            kind: NotificationKind::Transforming,
            message,
            related_job_id: None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.kind != NotificationKind::Transforming
    }
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<String, TransformJob>,
    active: BTreeSet<String>,
    notification: Option<Notification>,
    dismiss_task: Option<JoinHandle<()>>,
    // Bumped whenever a terminal notification is shown or dismissed so a timer
    // that lost the race to `abort` cannot clear a newer notification.
    generation: u64,
}

impl TrackerState {
    fn aggregate(&self) -> Option<Notification> {
        match self.active.len() {
            0 => None,
            n => Some(Notification::transforming(n)),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(task) = self.dismiss_task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    /// Drop the job behind the visible terminal notification, if any.
    fn retire_terminal(&mut self) {
        if let Some(job_id) = self
            .notification
            .as_ref()
            .filter(|n| n.is_terminal())
            .and_then(|n| n.related_job_id.clone())
        {
            if !self.active.contains(&job_id) {
                self.jobs.remove(&job_id);
            }
        }
    }
}

/// Tracks photos that are being transformed remotely and exposes a single
/// aggregated notification.
///
/// Success and error notifications take priority over the aggregate
/// "transforming" message until they are dismissed, either manually or by
/// their timer.
#[derive(Clone)]
pub struct InFlightJobTracker {
    state: Arc<Mutex<TrackerState>>,
    notification_tx: Arc<watch::Sender<Option<Notification>>>,
    success_after: Duration,
    error_after: Duration,
}

impl Default for InFlightJobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightJobTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        InFlightJobTracker {
            state: Arc::new(Mutex::new(TrackerState::default())),
            notification_tx: Arc::new(tx),
            success_after: SUCCESS_DISMISS_AFTER,
            error_after: ERROR_DISMISS_AFTER,
        }
    }

    pub fn with_dismiss_delays(mut self, success: Duration, error: Duration) -> Self {
        self.success_after = success;
        self.error_after = error;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &TrackerState) {
        self.notification_tx.send_replace(state.notification.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Notification>> {
        self.notification_tx.subscribe()
    }

    pub fn notification(&self) -> Option<Notification> {
        self.lock().notification.clone()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn job(&self, job_id: &str) -> Option<TransformJob> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// Register `job_id` as transforming.
    pub fn begin(&self, job_id: &str) {
        let mut state = self.lock();
        state.jobs.insert(
            job_id.to_string(),
            TransformJob {
                job_id: job_id.to_string(),
                state: JobState::Transforming,
                error_message: None,
            },
        );
        state.active.insert(job_id.to_string());
        let terminal_visible = state
            .notification
            .as_ref()
            .map(Notification::is_terminal)
            .unwrap_or(false);
        if !terminal_visible {
            state.notification = state.aggregate();
        }
        tracing::debug!(job_id, active = state.active.len(), "Transform job started");
        self.publish(&state);
    }

    pub fn succeed(&self, job_id: &str) {
        self.finish(
            job_id,
            JobState::Succeeded,
            None,
            Notification {
                kind: NotificationKind::Success,
                message: "Image transformed".to_string(),
                related_job_id: Some(job_id.to_string()),
            },
            self.success_after,
        );
    }

    pub fn fail(&self, job_id: &str, error_message: &str) {
        self.finish(
            job_id,
            JobState::Failed,
            Some(error_message.to_string()),
            Notification {
                kind: NotificationKind::Error,
                message: format!("Transformation failed: {}", error_message),
                related_job_id: Some(job_id.to_string()),
            },
            self.error_after,
        );
    }

    /// Register `job_id` like [`begin`](Self::begin) and return a guard that
    /// reports the job failed with [`CANCELLED_MESSAGE`] if it is dropped
    /// before [`JobGuard::succeed`] or [`JobGuard::fail`].
    pub fn track(&self, job_id: &str) -> JobGuard {
        self.begin(job_id);
        JobGuard {
            tracker: self.clone(),
            job_id: job_id.to_string(),
            finished: false,
        }
    }

    fn finish(
        &self,
        job_id: &str,
        job_state: JobState,
        error_message: Option<String>,
        notification: Notification,
        dismiss_after: Duration,
    ) {
        let mut state = self.lock();
        if !state.active.remove(job_id) {
            tracing::debug!(job_id, "Finishing a job that was not tracked as active");
        }
        state.cancel_timer();
        state.retire_terminal();
        state.jobs.insert(
            job_id.to_string(),
            TransformJob {
                job_id: job_id.to_string(),
                state: job_state,
                error_message,
            },
        );
        state.notification = Some(notification);
        let generation = state.generation;
        state.dismiss_task = self.schedule_dismiss(generation, dismiss_after);
        tracing::info!(job_id, state = ?job_state, active = state.active.len(), "Transform job finished");
        self.publish(&state);
    }

    fn schedule_dismiss(&self, generation: u64, after: Duration) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No async runtime, notification will stay until dismissed");
                return None;
            }
        };
        let tracker = self.clone();
        Some(handle.spawn(async move {
            tokio::time::sleep(after).await;
            tracker.expire(generation);
        }))
    }

    fn expire(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.dismiss_task = None;
        state.retire_terminal();
        state.notification = state.aggregate();
        self.publish(&state);
    }

    /// Clear the current notification now. A dismissed success or error gives
    /// way to the aggregate message for any jobs still transforming.
    pub fn dismiss(&self) {
        let mut state = self.lock();
        state.cancel_timer();
        let was_terminal = state
            .notification
            .as_ref()
            .map(Notification::is_terminal)
            .unwrap_or(false);
        if was_terminal {
            state.retire_terminal();
            state.notification = state.aggregate();
        } else {
            state.notification = None;
        }
        self.publish(&state);
    }
}

/// A job registered through [`InFlightJobTracker::track`].
#[must_use = "dropping the guard reports the job as cancelled"]
pub struct JobGuard {
    tracker: InFlightJobTracker,
    job_id: String,
    finished: bool,
}

impl JobGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn succeed(mut self) {
        self.finished = true;
        self.tracker.succeed(&self.job_id);
    }

    pub fn fail(mut self, error_message: &str) {
        self.finished = true;
        self.tracker.fail(&self.job_id, error_message);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(job_id = %self.job_id, "Transform job dropped before finishing");
            self.tracker.fail(&self.job_id, CANCELLED_MESSAGE);
        }
    }
}
