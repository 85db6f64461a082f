//! Agent construction options and file-backed configuration
//!
//! `AgentOptions` is consumed by `Agent::new` and never mutated afterwards.
//! `AgentConfig` is the serializable subset that can live in a TOML file:
//!
//! ```toml
//! name = "writer"
//! bounded_capacity = 100     # 0 = unbounded
//! scan_bounded_capacity = 0  # 0 = unbounded
//! default_timeout_ms = 0     # 0 = wait forever
//! ```

use std::{fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
  handler::ScanHandler,
  mailbox::{Capacity, DEFAULT_BOUNDED_CAPACITY},
};

// ============================================================================
// AgentOptions
// ============================================================================

/// Options for a single agent
pub struct AgentOptions<M: Send + 'static> {
  /// Name used in logs and fault reports
  pub name: String,
  /// Capacity of the mailbox producers post into
  pub capacity: Capacity,
  /// Capacity of the scan-output mailbox (only used with a scan handler)
  pub scan_capacity: Capacity,
  /// External cancellation; the agent links its own token to it
  pub cancel: Option<CancellationToken>,
  /// Optional pre-processing stage
  pub scan_handler: Option<Box<dyn ScanHandler<M>>>,
  /// Runtime the main loop is spawned on (defaults to the caller's runtime)
  pub runtime: Option<Handle>,
  /// Runtime the scan loop is spawned on (defaults to `runtime`)
  pub scan_runtime: Option<Handle>,
  /// Timeout applied by `Agent::ask`
  pub default_timeout: Option<Duration>,
}

impl<M: Send + 'static> Default for AgentOptions<M> {
  fn default() -> Self {
    Self {
      name: "agent".to_string(),
      capacity: Capacity::default(),
      scan_capacity: Capacity::Unbounded,
      cancel: None,
      scan_handler: None,
      runtime: None,
      scan_runtime: None,
      default_timeout: None,
    }
  }
}

impl<M> AgentOptions<M>
where
  M: Send + 'static,
{
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }

  /// Build options from a loaded config (handlers and tokens are added separately)
  pub fn from_config(config: &AgentConfig) -> Self {
    Self {
      name: config.name.clone(),
      capacity: Capacity::from_config(config.bounded_capacity),
      scan_capacity: Capacity::from_config(config.scan_bounded_capacity),
      default_timeout: config.default_timeout(),
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_capacity(mut self, capacity: Capacity) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn with_scan_capacity(mut self, capacity: Capacity) -> Self {
    self.scan_capacity = capacity;
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = Some(cancel);
    self
  }

  pub fn with_scan_handler(mut self, handler: impl ScanHandler<M>) -> Self {
    self.scan_handler = Some(Box::new(handler));
    self
  }

  pub fn with_runtime(mut self, runtime: Handle) -> Self {
    self.runtime = Some(runtime);
    self
  }

  pub fn with_scan_runtime(mut self, runtime: Handle) -> Self {
    self.scan_runtime = Some(runtime);
    self
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = Some(timeout);
    self
  }
}

impl<M: Send + 'static> fmt::Debug for AgentOptions<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AgentOptions")
      .field("name", &self.name)
      .field("capacity", &self.capacity)
      .field("scan_capacity", &self.scan_capacity)
      .field("cancel", &self.cancel.is_some())
      .field("scan_handler", &self.scan_handler.is_some())
      .field("runtime", &self.runtime.is_some())
      .field("default_timeout", &self.default_timeout)
      .finish()
  }
}

// ============================================================================
// AgentConfig
// ============================================================================

/// Errors loading an `AgentConfig`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),
}

/// File-backed agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
  pub name: String,
  /// Input mailbox bound (0 = unbounded)
  pub bounded_capacity: usize,
  /// Scan-output mailbox bound (0 = unbounded)
  pub scan_bounded_capacity: usize,
  /// Default ask timeout in milliseconds (0 = no timeout)
  pub default_timeout_ms: u64,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      name: "agent".to_string(),
      bounded_capacity: DEFAULT_BOUNDED_CAPACITY,
      scan_bounded_capacity: 0,
      default_timeout_ms: 0,
    }
  }
}

impl AgentConfig {
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(content)?)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  pub fn default_timeout(&self) -> Option<Duration> {
    (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
  }
}
