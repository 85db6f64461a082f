//! Mailbox - cancellable, optionally bounded FIFO queue
//!
//! A mailbox is the single queue every message for one agent passes through.
//! Any number of producers may `post`, exactly one consumer may `receive`.
//!
//! # Shutdown
//!
//! ```text
//! stop(false): closed for writes → queued messages still receivable → Closed once drained
//! stop(true):  closed for writes + cancelled → pending post/receive fail with Cancelled
//! ```
//!
//! Closing drops the stored sender. Producers blocked on a full bounded queue
//! observe the close signal and release their sender clones, so the receiver
//! sees end-of-stream exactly when the last accepted message has been taken.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default bound for agent input mailboxes
pub const DEFAULT_BOUNDED_CAPACITY: usize = 100;

// ============================================================================
// Capacity
// ============================================================================

/// Queue capacity of a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
  /// Posting never suspends
  Unbounded,
  /// Posting suspends once this many messages are queued (0 is treated as 1)
  Bounded(usize),
}

impl Capacity {
  /// Map the config convention (`0` = unbounded) onto a capacity
  pub fn from_config(value: usize) -> Self {
    if value == 0 { Self::Unbounded } else { Self::Bounded(value) }
  }

  /// The bound, if any
  pub fn bound(&self) -> Option<usize> {
    match self {
      Self::Unbounded => None,
      Self::Bounded(n) => Some((*n).max(1)),
    }
  }
}

impl Default for Capacity {
  fn default() -> Self {
    Self::Bounded(DEFAULT_BOUNDED_CAPACITY)
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a mailbox operation did not deliver a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
  #[error("Mailbox is closed")]
  Closed,
  #[error("Mailbox operation was cancelled")]
  Cancelled,
}

// ============================================================================
// Channel halves
// ============================================================================

enum Tx<M> {
  Bounded(mpsc::Sender<M>),
  Unbounded(mpsc::UnboundedSender<M>),
}

impl<M> Clone for Tx<M> {
  fn clone(&self) -> Self {
    match self {
      Self::Bounded(tx) => Self::Bounded(tx.clone()),
      Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
    }
  }
}

impl<M> Tx<M> {
  async fn send(&self, msg: M) -> Result<(), M> {
    match self {
      Self::Bounded(tx) => tx.send(msg).await.map_err(|e| e.0),
      Self::Unbounded(tx) => tx.send(msg).map_err(|e| e.0),
    }
  }
}

enum Rx<M> {
  Bounded(mpsc::Receiver<M>),
  Unbounded(mpsc::UnboundedReceiver<M>),
}

impl<M> Rx<M> {
  async fn recv(&mut self) -> Option<M> {
    match self {
      Self::Bounded(rx) => rx.recv().await,
      Self::Unbounded(rx) => rx.recv().await,
    }
  }

  fn try_recv(&mut self) -> Option<M> {
    match self {
      Self::Bounded(rx) => rx.try_recv().ok(),
      Self::Unbounded(rx) => rx.try_recv().ok(),
    }
  }
}

// ============================================================================
// Mailbox
// ============================================================================

/// Single-consumer, multi-producer FIFO queue with graceful and forced close
///
/// The consumer side is guarded by an async mutex so `receive` can be called
/// through a shared reference, but callers must not race two consumers
/// against one mailbox: each message is delivered to exactly one `receive`.
pub struct Mailbox<M> {
  /// Producer half; `None` once the mailbox is closed for writes
  tx: Mutex<Option<Tx<M>>>,
  rx: AsyncMutex<Rx<M>>,
  capacity: Capacity,
  /// Linked token: child of the owner's token, tripped by a forced stop
  cancel: CancellationToken,
  /// Closed for writes
  closed: CancellationToken,
  /// Closed and fully drained (or cancelled)
  drained: CancellationToken,
  /// Messages accepted but not yet received
  queued: AtomicUsize,
}

impl<M> Mailbox<M> {
  /// Create a mailbox whose cancellation is linked to `parent`
  pub fn new(capacity: Capacity, parent: &CancellationToken) -> Self {
    let (tx, rx) = match capacity.bound() {
      Some(bound) => {
        let (tx, rx) = mpsc::channel(bound);
        (Tx::Bounded(tx), Rx::Bounded(rx))
      }
      None => {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tx::Unbounded(tx), Rx::Unbounded(rx))
      }
    };

    Self {
      tx: Mutex::new(Some(tx)),
      rx: AsyncMutex::new(rx),
      capacity,
      cancel: parent.child_token(),
      closed: CancellationToken::new(),
      drained: CancellationToken::new(),
      queued: AtomicUsize::new(0),
    }
  }

  /// Enqueue a message, suspending while a bounded mailbox is full
  pub async fn post(&self, msg: M) -> Result<(), MailboxError> {
    if self.cancel.is_cancelled() {
      return Err(MailboxError::Cancelled);
    }
    let tx = self.tx.lock().clone().ok_or(MailboxError::Closed)?;

    // Count before sending so a racing receive never underflows
    self.queued.fetch_add(1, Ordering::AcqRel);

    let result = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(MailboxError::Cancelled),
      _ = self.closed.cancelled() => Err(MailboxError::Closed),
      sent = tx.send(msg) => sent.map_err(|_| MailboxError::Closed),
    };

    if result.is_err() {
      self.queued.fetch_sub(1, Ordering::AcqRel);
      self.complete_if_empty();
    }
    result
  }

  /// Take the next message in FIFO order
  ///
  /// Fails with `Closed` once the mailbox is closed and drained, or with
  /// `Cancelled` as soon as the cancellation signal fires.
  pub async fn receive(&self) -> Result<M, MailboxError> {
    if self.cancel.is_cancelled() {
      return Err(MailboxError::Cancelled);
    }

    let mut rx = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(MailboxError::Cancelled),
      rx = self.rx.lock() => rx,
    };

    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(MailboxError::Cancelled),
      msg = rx.recv() => match msg {
        Some(msg) => {
          self.queued.fetch_sub(1, Ordering::AcqRel);
          Ok(msg)
        }
        None => {
          if !self.drained.is_cancelled() {
            trace!("Mailbox drained");
            self.drained.cancel();
          }
          Err(MailboxError::Closed)
        }
      },
    }
  }

  /// Close the mailbox for writes
  ///
  /// With `force`, also trips the cancellation signal: pending posts and
  /// receives fail immediately and undelivered messages are abandoned.
  pub fn stop(&self, force: bool) {
    let was_open = self.tx.lock().take().is_some();
    self.closed.cancel();

    if force {
      self.cancel.cancel();
      self.drained.cancel();
    } else {
      self.complete_if_empty();
    }

    if was_open {
      debug!(force, queued = self.len(), "Mailbox closed");
    }
  }

  /// Drop every message still queued, returning how many were discarded
  ///
  /// Only meaningful once the consumer has stopped; if a receive is in
  /// progress nothing is discarded.
  pub fn discard(&self) -> usize {
    let Ok(mut rx) = self.rx.try_lock() else {
      return 0;
    };

    let mut discarded = 0;
    while let Some(msg) = rx.try_recv() {
      drop(msg);
      discarded += 1;
    }
    self.queued.fetch_sub(discarded, Ordering::AcqRel);
    self.complete_if_empty();
    discarded
  }

  /// Closed with nothing accepted or in flight: no receive can yield a message
  fn complete_if_empty(&self) {
    if self.closed.is_cancelled() && self.queued.load(Ordering::Acquire) == 0 && !self.drained.is_cancelled() {
      trace!("Mailbox drained");
      self.drained.cancel();
    }
  }

  /// Resolves once the mailbox is closed and drained, or cancelled
  pub async fn completion(&self) {
    tokio::select! {
      _ = self.drained.cancelled() => {}
      _ = self.cancel.cancelled() => {}
    }
  }

  /// Whether `completion` has resolved
  pub fn is_completed(&self) -> bool {
    self.drained.is_cancelled() || self.cancel.is_cancelled()
  }

  /// Whether the mailbox is closed for writes
  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Number of accepted messages not yet received
  pub fn len(&self) -> usize {
    self.queued.load(Ordering::Acquire)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> Capacity {
    self.capacity
  }

  /// The mailbox's linked cancellation token
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }
}

impl<M> std::fmt::Debug for Mailbox<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mailbox")
      .field("capacity", &self.capacity)
      .field("queued", &self.len())
      .field("closed", &self.is_closed())
      .field("completed", &self.is_completed())
      .finish()
  }
}
