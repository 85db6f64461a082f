//! Handler contracts implemented by agent users
//!
//! Handlers own the agent's private state. The agent drives them from a
//! single background task, so `&mut self` access is never shared.
//!
//! Messages are usually a closed enum; handlers dispatch with an exhaustive
//! `match`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Main message handler
///
/// `on_start` runs once before the first message and `on_end` runs once
/// after the loop exits, whether it drained, was cancelled, or faulted.
#[async_trait]
pub trait MessageHandler<M>: Send + 'static
where
  M: Send + 'static,
{
  async fn on_start(&mut self) -> anyhow::Result<()> {
    Ok(())
  }

  /// Process one message. An error terminates the agent's main loop.
  async fn handle(&mut self, message: M, cancel: &CancellationToken) -> anyhow::Result<()>;

  async fn on_end(&mut self) -> anyhow::Result<()> {
    Ok(())
  }
}

/// Pre-processing stage run before the main handler sees a message
///
/// `scan` returns the messages to forward, in order: an empty vec absorbs
/// the message, `vec![message]` passes it through, several messages fan it out.
#[async_trait]
pub trait ScanHandler<M>: Send + 'static
where
  M: Send + 'static,
{
  async fn on_start(&mut self) -> anyhow::Result<()> {
    Ok(())
  }

  async fn scan(&mut self, message: M, cancel: &CancellationToken) -> anyhow::Result<Vec<M>>;

  async fn on_end(&mut self) -> anyhow::Result<()> {
    Ok(())
  }
}
