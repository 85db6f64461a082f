//! Coordinator agent: runs fan-out jobs across a pool of file agents
//!
//! A job:
//!
//! 1. Starts producers that look up their targets in an `AgentRegistry`
//!    (they wait until the file agents are registered)
//! 2. Spawns one file agent per output file, each with a line-counting scan stage
//! 3. Producers post generated lines round-robin across the agents
//! 4. Asks every agent to append a trailer and report completion
//! 5. Stops the agents gracefully and replies with the elapsed time

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Instant,
};

use agentbox::{Agent, AgentOptions, AgentRegistry, CancellationToken, Capacity, MessageHandler, async_trait};
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FileWriterHandler, LineCounterScan};
use crate::messages::{JobReport, Message};

type FileAgents = AgentRegistry<Arc<Agent<Message>>>;

/// Shape of a job
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
  /// Number of file agents (and producers)
  pub agents: usize,
  /// Total lines generated per job
  pub lines: usize,
  /// Input mailbox capacity of each file agent
  pub capacity: Capacity,
}

pub struct CoordinatorHandler {
  settings: JobSettings,
  jobs: u32,
}

impl CoordinatorHandler {
  pub fn new(settings: JobSettings) -> Self {
    Self { settings, jobs: 0 }
  }

  async fn run_job(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<JobReport> {
    let started = Instant::now();
    let JobSettings { agents, lines, capacity } = self.settings;
    anyhow::ensure!(agents > 0, "A job needs at least one file agent");

    let names: Vec<String> = (1..=agents).map(|i| format!("file-{i}")).collect();
    let registry = FileAgents::with_names(names.iter().cloned());

    // Producers start first and block on the registry until the agents exist
    let producers = Producers(
      (0..agents)
        .map(|producer| {
          let registry = registry.clone();
          let names = names.clone();
          tokio::spawn(async move { produce(registry, names, producer, lines).await })
        })
        .collect(),
    );

    tokio::fs::create_dir_all(work_dir)
      .await
      .with_context(|| format!("Failed to create job directory {}", work_dir.display()))?;

    let scanned = Arc::new(AtomicU64::new(0));
    for (index, name) in names.iter().enumerate() {
      let options = AgentOptions::new(name.clone())
        .with_capacity(capacity)
        .with_cancel(cancel.clone())
        .with_scan_handler(LineCounterScan::new(Arc::clone(&scanned)));
      let path = work_dir.join(format!("agentbox{}.txt", index + 1));
      let agent = Agent::spawn(FileWriterHandler::new(path), options)?;
      registry.add(name.clone(), Arc::new(agent));
    }

    producers.join().await?;

    let mut summaries = Vec::with_capacity(agents);
    for name in &names {
      let agent = registry.get(name).await?;

      let trailer = agent
        .ask(|reply| Message::AddLineAndReply {
          line: "-- end of job --".to_string(),
          reply,
        })
        .await?;
      debug!(agent = %name, trailer = %trailer, "Trailer written");

      summaries.push(agent.ask(Message::WaitForCompletion).await?);
    }

    let agents_to_stop: Vec<_> = names.iter().filter_map(|name| registry.try_get(name)).collect();
    let stops = agents_to_stop.iter().map(|agent| agent.stop(false, None));
    for result in futures::future::join_all(stops).await {
      result?;
    }
    registry.clear();

    Ok(JobReport {
      elapsed: started.elapsed(),
      summaries,
      scanned: scanned.load(Ordering::Relaxed),
    })
  }
}

/// Producer tasks of one job, aborted if the job bails out before joining them
struct Producers(Vec<JoinHandle<Result<()>>>);

impl Producers {
  async fn join(mut self) -> Result<()> {
    let handles = std::mem::take(&mut self.0);
    for result in futures::future::join_all(handles).await {
      result.context("Producer task panicked")??;
    }
    Ok(())
  }
}

impl Drop for Producers {
  fn drop(&mut self) {
    for handle in &self.0 {
      handle.abort();
    }
  }
}

/// Post this producer's share of the job's lines, round-robin across agents
async fn produce(registry: FileAgents, names: Vec<String>, producer: usize, lines: usize) -> Result<()> {
  let mut targets = Vec::with_capacity(names.len());
  for name in &names {
    targets.push(registry.get(name).await?);
  }

  let producers = names.len();
  let padding = uuid::Uuid::new_v4().to_string().repeat(4);
  for i in (producer..lines).step_by(producers) {
    let target = &targets[i % targets.len()];
    target
      .post(Message::AddLine(format!("Line{} {}", i % producers, padding)))
      .await
      .with_context(|| format!("Failed to post line {i} to {}", target.name()))?;
  }
  Ok(())
}

#[async_trait]
impl MessageHandler<Message> for CoordinatorHandler {
  async fn handle(&mut self, message: Message, cancel: &CancellationToken) -> Result<()> {
    match message {
      Message::StartJob { work_dir, reply } => {
        self.jobs += 1;
        info!(job = self.jobs, work_dir = %work_dir.display(), "Starting job");

        match self.run_job(&work_dir, cancel).await {
          Ok(report) => {
            info!(job = self.jobs, elapsed_ms = report.elapsed.as_millis() as u64, "Job finished");
            reply.reply(report);
          }
          Err(e) => {
            warn!(job = self.jobs, error = %e, "Job failed");
            reply.reply_error(e);
          }
        }
      }
      Message::WaitForCompletion(reply) => {
        reply.reply(format!("coordinator: ran {} jobs", self.jobs));
      }
      Message::AddLineAndReply { reply, .. } => {
        reply.reply_error(anyhow::anyhow!("The coordinator does not write lines"));
      }
      Message::Reset | Message::AddLine(_) => debug!("Coordinator ignored a line message"),
    }
    Ok(())
  }
}
