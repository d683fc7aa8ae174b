//! Work handles and their observable lifecycle.
//!
//! The manager owns the scheduling state in an arena keyed by request id;
//! callers hold lightweight [`Work`] handles that share only the published
//! state, the terminal outcome, and the attempt counters. State is written
//! under the manager's queue lock and read lock-free through the watch
//! channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::core::error::{CommsError, CommsResult};
use crate::core::response::Response;

/// Lifecycle of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Created,
    Waiting,
    Running,
    Retrying,
    Redirecting,
    Completed,
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Cancelled)
    }
}

/// Terminal result of a work: the newest response produced across all
/// attempts, `None` when no response exists (cancelled, cache-only miss),
/// or the recorded error.
pub type WorkOutcome = CommsResult<Option<Response>>;

pub(crate) struct WorkShared {
    state_tx: watch::Sender<WorkState>,
    outcome: OnceLock<WorkOutcome>,
    redirects: AtomicU32,
    failure_retries: AtomicU32,
    response_retries: AtomicU32,
}

impl WorkShared {
    pub(crate) fn set_state(&self, state: WorkState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn record_counts(&self, redirects: u32, failures: u32, responses: u32) {
        self.redirects.store(redirects, Ordering::Relaxed);
        self.failure_retries.store(failures, Ordering::Relaxed);
        self.response_retries.store(responses, Ordering::Relaxed);
    }

    /// Publish the outcome and move to a terminal state. The outcome must
    /// be set before the state flips so waiters woken by the transition
    /// always observe it.
    pub(crate) fn finish(&self, outcome: WorkOutcome, state: WorkState) {
        debug_assert!(state.is_terminal());
        let _ = self.outcome.set(outcome);
        self.state_tx.send_replace(state);
    }
}

/// Caller-facing handle to a submitted work.
///
/// Handles are cheap to clone; all clones observe the same lifecycle.
/// Two works are equal iff their request ids are equal.
#[derive(Clone)]
pub struct Work {
    id: u32,
    shared: Arc<WorkShared>,
}

impl Work {
    pub(crate) fn new_queued(id: u32) -> Self {
        let (state_tx, _) = watch::channel(WorkState::Created);
        Self {
            id,
            shared: Arc::new(WorkShared {
                state_tx,
                outcome: OnceLock::new(),
                redirects: AtomicU32::new(0),
                failure_retries: AtomicU32::new(0),
                response_retries: AtomicU32::new(0),
            }),
        }
    }

    /// A work that is terminal at construction (cache hits, cache-only
    /// misses); `wait` returns immediately.
    pub(crate) fn new_completed(id: u32, outcome: WorkOutcome) -> Self {
        let work = Self::new_queued(id);
        work.shared.finish(outcome, WorkState::Completed);
        work
    }

    pub(crate) fn from_shared(id: u32, shared: Arc<WorkShared>) -> Self {
        Self { id, shared }
    }

    pub(crate) fn shared(&self) -> Arc<WorkShared> {
        self.shared.clone()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> WorkState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == WorkState::Cancelled
    }

    pub fn redirect_count(&self) -> u32 {
        self.shared.redirects.load(Ordering::Relaxed)
    }

    pub fn retry_count_failure(&self) -> u32 {
        self.shared.failure_retries.load(Ordering::Relaxed)
    }

    pub fn retry_count_response(&self) -> u32 {
        self.shared.response_retries.load(Ordering::Relaxed)
    }

    /// Block until the work reaches a terminal state, then return the
    /// newest response produced across all attempts, `None` if there is
    /// none, or re-raise the recorded error.
    pub async fn wait(&self) -> WorkOutcome {
        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| CommsError::Internal("work state channel closed".to_string()))?;
        self.outcome()
    }

    /// Like [`wait`](Self::wait) with a deadline; `None` on timeout. The
    /// timeout is a hint for this call only — the work keeps running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<WorkOutcome> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => Some(outcome),
            Err(_) => None,
        }
    }

    fn outcome(&self) -> WorkOutcome {
        self.shared
            .outcome
            .get()
            .cloned()
            .unwrap_or_else(|| Err(CommsError::Internal("work finished without outcome".to_string())))
    }
}

impl PartialEq for Work {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Work {}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
