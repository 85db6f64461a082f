//! Run command: drive one coordinator through a series of jobs

use std::path::PathBuf;

use agentbox::{Agent, AgentConfig, AgentOptions, CancellationToken, Capacity};
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
  handlers::{CoordinatorHandler, JobSettings},
  messages::Message,
};

/// Arguments for `agentbox-demo run`
#[derive(Debug, Clone)]
pub struct RunArgs {
  pub work_dir: PathBuf,
  pub jobs: usize,
  pub agents: usize,
  pub lines: usize,
  pub config: Option<PathBuf>,
}

/// Run `jobs` jobs one after another, each in its own subdirectory of `work_dir`
///
/// Ctrl-C cancels the coordinator, which force-stops every file agent.
pub async fn cmd_run(args: RunArgs) -> Result<()> {
  let config = match &args.config {
    Some(path) => {
      AgentConfig::load(path).with_context(|| format!("Failed to load agent config from {}", path.display()))?
    }
    None => AgentConfig {
      name: "coordinator".to_string(),
      ..AgentConfig::default()
    },
  };

  let settings = JobSettings {
    agents: args.agents,
    lines: args.lines,
    capacity: Capacity::from_config(config.bounded_capacity),
  };

  let cancel = CancellationToken::new();
  tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, cancelling");
        cancel.cancel();
      }
    }
  });

  // The configured bound applies to the file agents
  let options = AgentOptions::from_config(&config)
    .with_capacity(Capacity::Unbounded)
    .with_cancel(cancel.clone());
  let coordinator = Agent::spawn(CoordinatorHandler::new(settings), options)?;

  info!(
    jobs = args.jobs,
    agents = settings.agents,
    lines = settings.lines,
    work_dir = %args.work_dir.display(),
    "Running jobs"
  );

  for job in 1..=args.jobs {
    let work_dir = args.work_dir.join(format!("job{job}"));
    let report = coordinator
      .ask(|reply| Message::StartJob { work_dir, reply })
      .await
      .with_context(|| format!("Job {job} failed"))?;

    for summary in &report.summaries {
      println!("  {summary}");
    }
    println!(
      "Job {job} took {} ms ({} lines scanned)",
      report.elapsed.as_millis(),
      report.scanned
    );
  }

  coordinator.stop(false, None).await?;
  Ok(())
}
