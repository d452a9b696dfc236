//! Requests parked behind an in-flight refresh
//!
//! Each parked request holds a `Waiter`, the receiving half of a one-shot
//! channel. The refresh owner settles every sender with the same
//! `RefreshOutcome` and the queue is empty again.

use std::time::Duration;

use common::Secret;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Result of one refresh attempt, shared by every request that waited on it.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Success(Secret<String>),
    Failure(Error),
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Success(_) => "success",
            RefreshOutcome::Failure(_) => "failure",
        }
    }

    pub fn into_result(self) -> Result<Secret<String>> {
        match self {
            RefreshOutcome::Success(token) => Ok(token),
            RefreshOutcome::Failure(err) => Err(err),
        }
    }
}

/// Ordered list of pending continuations.
#[derive(Debug, Default)]
pub struct FailedRequestQueue {
    pending: Vec<oneshot::Sender<RefreshOutcome>>,
}

impl FailedRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a continuation and hand back the side the request waits on.
    pub fn enqueue(&mut self) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.pending.push(tx);
        Waiter { rx }
    }

    /// Settle every continuation with `outcome` and empty the queue.
    ///
    /// Returns how many continuations were settled. Waiters whose request was
    /// dropped in the meantime are skipped.
    pub fn drain(&mut self, outcome: &RefreshOutcome) -> usize {
        let count = self.pending.len();
        for tx in self.pending.drain(..) {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A parked request's view of the refresh it is waiting on.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl Waiter {
    /// Wait for the owning refresh to settle.
    ///
    /// A sender dropped without settling means the owner vanished mid-refresh
    /// and maps to `RefreshAborted`.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Secret<String>> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| Error::RefreshTimeout(limit))?,
            None => self.rx.await,
        };
        received.map_err(|_| Error::RefreshAborted)?.into_result()
    }
}
