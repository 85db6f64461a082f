//! Scan stage counting the lines headed for a file agent

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use agentbox::{CancellationToken, ScanHandler, async_trait};
use tracing::trace;

use crate::messages::Message;

/// Counts line messages and forwards every message unchanged
pub struct LineCounterScan {
  counted: Arc<AtomicU64>,
}

impl LineCounterScan {
  /// `counted` may be shared between several scan stages
  pub fn new(counted: Arc<AtomicU64>) -> Self {
    Self { counted }
  }
}

#[async_trait]
impl ScanHandler<Message> for LineCounterScan {
  async fn scan(&mut self, message: Message, _cancel: &CancellationToken) -> anyhow::Result<Vec<Message>> {
    if matches!(message, Message::AddLine(_) | Message::AddLineAndReply { .. }) {
      let total = self.counted.fetch_add(1, Ordering::Relaxed) + 1;
      if total % 10_000 == 0 {
        trace!(total, "Lines scanned");
      }
    }
    Ok(vec![message])
  }
}
