//! Logging setup for the demo binary

use tracing_subscriber::EnvFilter;

/// Initialize console logging
///
/// `RUST_LOG` overrides the default level, e.g. `RUST_LOG=agentbox=debug`.
pub fn init_cli_logging(verbose: bool) {
  let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .init();
}
