//! File-writer agent: appends numbered lines to one file

use std::path::{Path, PathBuf};

use agentbox::{CancellationToken, MessageHandler, async_trait};
use anyhow::{Context, Result};
use tokio::{
  fs::{File, OpenOptions},
  io::{AsyncWriteExt, BufWriter},
};
use tracing::debug;

use crate::messages::Message;

const BUFFER_SIZE: usize = 32 * 1024;

pub struct FileWriterHandler {
  path: PathBuf,
  writer: Option<BufWriter<File>>,
  lines: u64,
}

impl FileWriterHandler {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      writer: None,
      lines: 0,
    }
  }

  async fn write_line(&mut self, line: &str) -> Result<String> {
    let writer = self.writer.as_mut().context("Output file is not open")?;
    let numbered = format!("{}) {}", self.lines + 1, line);
    writer.write_all(numbered.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    self.lines += 1;
    Ok(numbered)
  }

  async fn flush(&mut self) -> Result<()> {
    if let Some(writer) = self.writer.as_mut() {
      writer
        .flush()
        .await
        .with_context(|| format!("Failed to flush {}", self.path.display()))?;
    }
    Ok(())
  }

  fn summary(&self) -> String {
    let name = self.path.file_name().map(Path::new).unwrap_or(self.path.as_path());
    format!("{}: processed {} lines", name.display(), self.lines)
  }
}

#[async_trait]
impl MessageHandler<Message> for FileWriterHandler {
  async fn on_start(&mut self) -> Result<()> {
    if let Some(dir) = self.path.parent() {
      tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await
      .with_context(|| format!("Failed to open {}", self.path.display()))?;

    self.writer = Some(BufWriter::with_capacity(BUFFER_SIZE, file));
    self.lines = 0;
    debug!(path = %self.path.display(), "File writer opened");
    Ok(())
  }

  async fn handle(&mut self, message: Message, _cancel: &CancellationToken) -> Result<()> {
    match message {
      Message::Reset => self.lines = 0,
      Message::AddLine(line) => {
        self.write_line(&line).await?;
      }
      Message::AddLineAndReply { line, reply } => match self.write_line(&line).await {
        Ok(numbered) => {
          reply.reply(numbered);
        }
        Err(e) => {
          reply.reply_error(e);
        }
      },
      Message::WaitForCompletion(reply) => {
        self.flush().await?;
        reply.reply(self.summary());
      }
      Message::StartJob { reply, .. } => {
        reply.reply_error(anyhow::anyhow!("File agents do not run jobs"));
      }
    }
    Ok(())
  }

  async fn on_end(&mut self) -> Result<()> {
    self.flush().await?;
    self.writer = None;
    debug!(path = %self.path.display(), lines = self.lines, "File writer closed");
    Ok(())
  }
}
