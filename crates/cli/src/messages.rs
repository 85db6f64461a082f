//! Messages understood by the demo agents

use std::{path::PathBuf, time::Duration};

use agentbox::ReplyChannel;

/// Every message the coordinator and file agents exchange
///
/// File agents handle the line-oriented variants; the coordinator handles
/// `StartJob`. Each handler rejects what it does not understand.
#[derive(Debug)]
pub enum Message {
  /// Restart line numbering
  Reset,
  AddLine(String),
  /// Append a line and reply with it as written (numbered)
  AddLineAndReply { line: String, reply: ReplyChannel<String> },
  /// Flush and reply with a summary of the lines written so far
  WaitForCompletion(ReplyChannel<String>),
  /// Run one fan-out job writing into `work_dir`
  StartJob {
    work_dir: PathBuf,
    reply: ReplyChannel<JobReport>,
  },
}

/// Result of a completed job
#[derive(Debug, Clone)]
pub struct JobReport {
  pub elapsed: Duration,
  /// One summary line per file agent
  pub summaries: Vec<String>,
  /// Lines counted by the scan stages across all file agents
  pub scanned: u64,
}
