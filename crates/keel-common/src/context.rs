//! Cancellation and deadline carrier passed to every reconcile call
//!
//! A [`ReconcileContext`] bundles a [`CancellationToken`] with an optional
//! deadline. The dispatch loop derives one per handler invocation from the
//! operator's shutdown token; blocking operations inside a handler (status
//! retries, polling) race their waits against [`ReconcileContext::cancelled`].

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ReconcileContext {
    /// Context cancelled only through `token`
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Context that never expires on its own
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Child context cancelled with the parent or after `timeout`
    ///
    /// The deadline is enforced by callers racing [`ReconcileContext::cancelled`];
    /// the dispatch loop also cancels the child token when the timeout fires.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the context is cancelled or past its deadline
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Resolve when the token is cancelled or the deadline passes
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Clamp a per-call timeout to the time remaining
    pub fn clamp(&self, timeout: Duration) -> Duration {
        self.remaining().map_or(timeout, |r| r.min(timeout))
    }
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self::background()
    }
}
