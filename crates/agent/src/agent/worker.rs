//! Background loops driving the handlers
//!
//! Each loop runs `on_start`, then receives and dispatches until its mailbox
//! reports closed (drained) or cancelled, then always runs `on_end`. Handler
//! errors and panics are classified once the loop is done: cancellation ends
//! the loop quietly, anything else becomes an `AgentFault`.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LifecycleEvent, Shared};
use crate::{
  errors::{AgentFault, FaultStage, is_cancellation, panic_message},
  handler::{MessageHandler, ScanHandler},
  mailbox::MailboxError,
};

/// How a background loop finished
#[derive(Debug)]
pub(crate) enum LoopExit {
  /// Mailbox closed and every accepted message processed
  Drained,
  Cancelled,
  Faulted(AgentFault),
}

/// A loop ended on an error raised by handler code
struct Failure {
  stage: FaultStage,
  error: anyhow::Error,
  panicked: bool,
}

/// Run one handler callback, capturing both errors and panics
async fn guarded<T>(stage: FaultStage, call: impl Future<Output = anyhow::Result<T>>) -> Result<T, Failure> {
  match AssertUnwindSafe(call).catch_unwind().await {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(error)) => Err(Failure {
      stage,
      error,
      panicked: false,
    }),
    Err(payload) => Err(Failure {
      stage,
      error: anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref())),
      panicked: true,
    }),
  }
}

/// Fold the loop body and `on_end` outcomes into one exit
fn settle(
  agent: &Arc<str>,
  body: Result<LoopExit, Failure>,
  end: Result<(), Failure>,
  cancel: &CancellationToken,
) -> LoopExit {
  let failure = match (body, end) {
    (Ok(exit), Ok(())) => return exit,
    (Err(failure), Ok(())) | (Ok(_), Err(failure)) => failure,
    (Err(failure), Err(secondary)) => {
      warn!(agent = %agent, stage = %secondary.stage, error = %secondary.error, "on_end failed after an earlier failure");
      failure
    }
  };

  // Panics are bugs even mid-shutdown
  if !failure.panicked && is_cancellation(&failure.error, cancel) {
    debug!(agent = %agent, stage = %failure.stage, error = %failure.error, "Handler stopped by cancellation");
    return LoopExit::Cancelled;
  }

  LoopExit::Faulted(AgentFault::new(Arc::clone(agent), failure.stage, failure.error))
}

// ============================================================================
// Main loop
// ============================================================================

pub(super) async fn run_main_loop<M: Send + 'static>(
  shared: Arc<Shared<M>>,
  mut handler: Box<dyn MessageHandler<M>>,
) -> LoopExit {
  let cancel = shared.output.cancellation_token();
  shared.hooks.fire(LifecycleEvent::Starting);
  debug!(agent = %shared.name, "Main loop started");

  let body = main_body(&shared, handler.as_mut(), &cancel).await;
  let end = guarded(FaultStage::MainEnd, handler.on_end()).await;
  let exit = settle(&shared.name, body, end, &cancel);

  shared.loop_exited(&exit, &cancel);
  shared.main_done.cancel();
  info!(agent = %shared.name, exit = exit_kind(&exit), "Main loop exited");
  exit
}

async fn main_body<M: Send + 'static>(
  shared: &Shared<M>,
  handler: &mut dyn MessageHandler<M>,
  cancel: &CancellationToken,
) -> Result<LoopExit, Failure> {
  guarded(FaultStage::MainStart, handler.on_start()).await?;

  loop {
    let message = match shared.output.receive().await {
      Ok(message) => message,
      Err(MailboxError::Closed) => return Ok(LoopExit::Drained),
      Err(MailboxError::Cancelled) => return Ok(LoopExit::Cancelled),
    };
    guarded(FaultStage::MainHandle, handler.handle(message, cancel)).await?;
  }
}

// ============================================================================
// Scan loop
// ============================================================================

pub(super) async fn run_scan_loop<M: Send + 'static>(
  shared: Arc<Shared<M>>,
  mut scan: Box<dyn ScanHandler<M>>,
) -> LoopExit {
  let cancel = shared.input.cancellation_token();
  debug!(agent = %shared.name, "Scan loop started");

  let body = scan_body(&shared, scan.as_mut(), &cancel).await;
  let end = guarded(FaultStage::ScanEnd, scan.on_end()).await;

  // Nothing else writes to the output; close it so the main loop drains and exits
  shared.output.stop(false);

  let exit = settle(&shared.name, body, end, &cancel);
  shared.loop_exited(&exit, &cancel);
  info!(agent = %shared.name, exit = exit_kind(&exit), "Scan loop exited");
  exit
}

async fn scan_body<M: Send + 'static>(
  shared: &Shared<M>,
  scan: &mut dyn ScanHandler<M>,
  cancel: &CancellationToken,
) -> Result<LoopExit, Failure> {
  guarded(FaultStage::ScanStart, scan.on_start()).await?;

  loop {
    let message = match shared.input.receive().await {
      Ok(message) => message,
      Err(MailboxError::Closed) => return Ok(LoopExit::Drained),
      Err(MailboxError::Cancelled) => return Ok(LoopExit::Cancelled),
    };

    let forwarded = guarded(FaultStage::ScanHandle, scan.scan(message, cancel)).await?;
    for message in forwarded {
      if let Err(e) = shared.output.post(message).await {
        debug!(agent = %shared.name, error = %e, "Output mailbox rejected a scanned message");
        return Ok(LoopExit::Cancelled);
      }
    }
  }
}

fn exit_kind(exit: &LoopExit) -> &'static str {
  match exit {
    LoopExit::Drained => "drained",
    LoopExit::Cancelled => "cancelled",
    LoopExit::Faulted(_) => "faulted",
  }
}
