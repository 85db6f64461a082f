//! agentbox-demo - drive a coordinator agent that fans lines out to file agents

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod handlers;
mod logging;
mod messages;

use commands::{RunArgs, cmd_run};
use logging::init_cli_logging;

#[derive(Parser)]
#[command(name = "agentbox-demo")]
#[command(about = "Exercise mailbox agents with a file-writing fan-out job")]
#[command(after_help = "\
EXAMPLES:
  agentbox-demo run --work-dir /tmp/agentbox
  agentbox-demo run --work-dir /tmp/agentbox --jobs 1 --agents 8 --lines 500000
  RUST_LOG=agentbox=debug agentbox-demo run --work-dir /tmp/agentbox")]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run fan-out jobs, one subdirectory of the work dir per job
  Run {
    /// Directory the file agents write into
    #[arg(long, value_name = "DIR")]
    work_dir: PathBuf,
    /// Number of jobs to run one after another
    #[arg(long, default_value = "2")]
    jobs: usize,
    /// File agents (and producers) per job
    #[arg(long, default_value = "5")]
    agents: usize,
    /// Lines generated per job
    #[arg(long, default_value = "100000")]
    lines: usize,
    /// Agent config file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_cli_logging(cli.verbose);

  match cli.command {
    Commands::Run {
      work_dir,
      jobs,
      agents,
      lines,
      config,
    } => {
      cmd_run(RunArgs {
        work_dir,
        jobs,
        agents,
        lines,
        config,
      })
      .await
    }
  }
}
