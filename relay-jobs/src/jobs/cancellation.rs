//! Cooperative cancellation.
//!
//! Cancellation is cooperative only: an in-flight job body is expected to
//! poll its [`CancellationToken`] and bail out; the layer never forcibly
//! terminates arbitrary work. Between attempts a job is cancelled by marking
//! its lineage, which the dispatcher checks before starting the next attempt.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use super::JobId;

/// Cancellation signal handed to every executing job body.
///
/// Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            state: Arc::new(TokenState { tx, rx }),
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.rx.borrow()
    }

    /// Request cancellation. All clones observe the signal.
    pub fn cancel(&self) {
        let _ = self.state.tx.send(true);
    }

    /// Wait until cancellation is requested.
    ///
    /// Returns immediately if already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender dropped; treat as cancelled.
                break;
            }
        }
    }

    /// Run a future, abandoning it if cancellation fires first.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the token was cancelled before the future
    /// completed.
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Result<T, ()>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Ok(result),
            () = self.cancelled() => Err(()),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the cancellation token of every in-flight attempt.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<JobId, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a job about to execute.
    pub fn register(&self, job_id: JobId, token: CancellationToken) {
        self.tokens.write().insert(job_id, token);
    }

    /// Remove a job's token after its attempt settles.
    pub fn unregister(&self, job_id: &JobId) {
        self.tokens.write().remove(job_id);
    }

    /// Signal cancellation to a specific in-flight job.
    ///
    /// Returns whether a token was found.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let tokens = self.tokens.read();
        tokens.get(job_id).map_or(false, |token| {
            token.cancel();
            debug!(job_id = %job_id, "Cancellation signalled to in-flight job");
            true
        })
    }

    /// Signal cancellation to every in-flight job (shutdown path).
    ///
    /// Returns the number of jobs signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.read();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Number of in-flight jobs currently registered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tokens.read().len()
    }
}
