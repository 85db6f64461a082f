//! Error taxonomy for agents
//!
//! Cancellation is an expected outcome and travels as a distinguished
//! variant (`MailboxError`, the cancelled family of `AskError`). Faults raised
//! by handler code are captured as `AgentFault` and broadcast once on the
//! agent's error sink.

use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::mailbox::MailboxError;

// ============================================================================
// Ask errors
// ============================================================================

/// Outcome of an `ask` that did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum AskError {
  #[error("Ask was cancelled")]
  Cancelled,
  #[error("Ask timed out after {0:?}")]
  TimedOut(Duration),
  #[error("Agent mailbox is closed")]
  Closed,
  #[error("Reply failed: {0:#}")]
  Failed(anyhow::Error),
}

impl AskError {
  /// True for every outcome in the cancelled family (cancel, timeout, closed)
  pub fn is_cancelled(&self) -> bool {
    !matches!(self, Self::Failed(_))
  }
}

impl From<MailboxError> for AskError {
  fn from(error: MailboxError) -> Self {
    match error {
      MailboxError::Closed => Self::Closed,
      MailboxError::Cancelled => Self::Cancelled,
    }
  }
}

// ============================================================================
// Faults
// ============================================================================

/// Where in an agent's background execution a fault was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultStage {
  MainStart,
  MainHandle,
  MainEnd,
  ScanStart,
  ScanHandle,
  ScanEnd,
  /// Published explicitly through `Agent::report_error`
  Reported,
}

impl fmt::Display for FaultStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stage = match self {
      Self::MainStart => "main on_start",
      Self::MainHandle => "main handle",
      Self::MainEnd => "main on_end",
      Self::ScanStart => "scan on_start",
      Self::ScanHandle => "scan handle",
      Self::ScanEnd => "scan on_end",
      Self::Reported => "reported",
    };
    f.write_str(stage)
  }
}

/// A fault raised by an agent's background execution
///
/// Cloneable so it can be fanned out to every error-sink subscriber.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Agent '{agent}' failed in {stage}: {error:#}")]
pub struct AgentFault {
  pub agent: Arc<str>,
  pub stage: FaultStage,
  pub error: Arc<anyhow::Error>,
}

impl AgentFault {
  pub fn new(agent: Arc<str>, stage: FaultStage, error: anyhow::Error) -> Self {
    Self {
      agent,
      stage,
      error: Arc::new(error),
    }
  }
}

// ============================================================================
// Agent errors
// ============================================================================

/// Errors returned synchronously by agent lifecycle calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
  #[error("Agent already started")]
  AlreadyStarted,
  #[error("No tokio runtime available to start the agent")]
  NoRuntime,
  #[error(transparent)]
  Fault(#[from] AgentFault),
}

// ============================================================================
// Classification
// ============================================================================

/// Whether an error raised by handler code is really a cancellation
///
/// Walks the whole cause chain, so a cancellation wrapped in context is
/// still recognized. Once `cancel` has fired every failure counts as
/// cancellation: the handler was being torn down.
pub(crate) fn is_cancellation(error: &anyhow::Error, cancel: &CancellationToken) -> bool {
  cancel.is_cancelled()
    || error.chain().any(|cause| {
      cause.downcast_ref::<MailboxError>().is_some()
        || cause.downcast_ref::<AskError>().is_some_and(AskError::is_cancelled)
    })
}

/// Render a panic payload for logging and fault reports
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
