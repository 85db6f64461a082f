//! One-shot reply channels for the ask/reply pattern
//!
//! A `ReplyChannel` travels inside a message to the handler; the matching
//! `PendingReply` stays with the caller. Exactly one resolution wins: the
//! first `reply`/`reply_error` call, a cancellation, or a timeout. Dropping
//! every clone of the channel without replying resolves the caller with
//! `AskError::Closed`, so a message discarded by a stopping agent never
//! leaves its caller waiting.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::errors::AskError;

type Slot<R> = Arc<Mutex<Option<oneshot::Sender<anyhow::Result<R>>>>>;

/// Producer half of a request/response exchange
///
/// Cheap to clone; all clones share the same single-use slot.
pub struct ReplyChannel<R> {
  slot: Slot<R>,
}

impl<R> Clone for ReplyChannel<R> {
  fn clone(&self) -> Self {
    Self {
      slot: Arc::clone(&self.slot),
    }
  }
}

impl<R> std::fmt::Debug for ReplyChannel<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReplyChannel")
      .field("resolved", &self.is_resolved())
      .finish()
  }
}

impl<R> ReplyChannel<R> {
  /// Create a connected channel / pending-reply pair
  pub fn new() -> (Self, PendingReply<R>) {
    let (tx, rx) = oneshot::channel();
    let channel = Self {
      slot: Arc::new(Mutex::new(Some(tx))),
    };
    (channel, PendingReply { rx })
  }

  /// Resolve with a value. Returns false if something else already won.
  pub fn reply(&self, value: R) -> bool {
    self.resolve(Ok(value))
  }

  /// Resolve with an error. Returns false if something else already won.
  pub fn reply_error(&self, error: impl Into<anyhow::Error>) -> bool {
    self.resolve(Err(error.into()))
  }

  /// Whether a resolution was attempted, or the caller stopped waiting
  pub fn is_resolved(&self) -> bool {
    match self.slot.lock().as_ref() {
      Some(tx) => tx.is_closed(),
      None => true,
    }
  }

  fn resolve(&self, outcome: anyhow::Result<R>) -> bool {
    let Some(tx) = self.slot.lock().take() else {
      return false;
    };
    // The caller may have timed out or been cancelled in the meantime
    tx.send(outcome).is_ok()
  }
}

/// Caller half of a request/response exchange
#[derive(Debug)]
pub struct PendingReply<R> {
  rx: oneshot::Receiver<anyhow::Result<R>>,
}

impl<R> PendingReply<R> {
  /// Wait for the handler's resolution, racing cancellation and an optional timeout
  pub async fn wait(self, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<R, AskError> {
    match timeout {
      Some(limit) => tokio::time::timeout(limit, self.wait_cancellable(cancel))
        .await
        .unwrap_or(Err(AskError::TimedOut(limit))),
      None => self.wait_cancellable(cancel).await,
    }
  }

  async fn wait_cancellable(self, cancel: &CancellationToken) -> Result<R, AskError> {
    tokio::select! {
      biased;
      outcome = self.rx => match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(AskError::Failed(error)),
        Err(_) => Err(AskError::Closed),
      },
      _ = cancel.cancelled() => Err(AskError::Cancelled),
    }
  }
}
