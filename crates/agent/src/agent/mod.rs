//! Agent - serialized private state behind a mailbox
//!
//! An agent owns a handler and routes every mutation of the handler's state
//! through a single-consumer mailbox. Producers `post` (fire-and-forget) or
//! `ask` (request/response) from any number of tasks.
//!
//! # Pipeline
//!
//! ```text
//! without scan:  post/ask → mailbox ──────────────────────────────→ main loop → handler
//! with scan:     post/ask → input ──→ scan loop → scan handler ──→ output → main loop → handler
//! ```
//!
//! With a scan stage, only the scan loop writes to the output mailbox, so the
//! main handler sees messages in the order the scan stage forwarded them.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted --start()--> Running --stop()--> Stopping --> Stopped
//!                            └── loop fault or cancellation ──→ Stopped
//! ```
//!
//! Transitions are compare-and-swap guarded: exactly one concurrent `start`
//! wins, and exactly one concurrent `stop` runs the shutdown sequence while
//! the others wait for it to finish.

mod hooks;
mod worker;

use std::{
  sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use self::hooks::LifecycleEvent;
use self::{hooks::LifecycleHooks, worker::LoopExit};
use crate::{
  errors::{AgentError, AgentFault, AskError, FaultStage},
  handler::{MessageHandler, ScanHandler},
  mailbox::{Mailbox, MailboxError},
  options::AgentOptions,
  reply::ReplyChannel,
};

/// Buffer of the fault broadcast; slow subscribers lag rather than block the agent
const FAULT_BUFFER: usize = 64;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Observable lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
  NotStarted,
  Running,
  Stopping,
  Stopped,
}

impl AgentState {
  fn from_u8(value: u8) -> Self {
    match value {
      NOT_STARTED => Self::NotStarted,
      RUNNING => Self::Running,
      STOPPING => Self::Stopping,
      _ => Self::Stopped,
    }
  }
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the agent and its background loops
pub(crate) struct Shared<M: Send + 'static> {
  name: Arc<str>,
  input: Arc<Mailbox<M>>,
  /// Same mailbox as `input` when there is no scan stage
  output: Arc<Mailbox<M>>,
  has_scan: bool,
  state: AtomicU8,
  faults: broadcast::Sender<AgentFault>,
  hooks: LifecycleHooks,
  /// Tripped once the main handler has run its last callback
  main_done: CancellationToken,
}

impl<M: Send + 'static> Shared<M> {
  fn publish(&self, fault: AgentFault) {
    error!(agent = %self.name, stage = %fault.stage, error = %fault.error, "Agent fault");
    // Zero subscribers is a valid configuration
    let _ = self.faults.send(fault);
  }

  fn abandon_mailboxes(&self) {
    self.input.stop(true);
    self.output.stop(true);
    let discarded = self.input.discard() + if self.has_scan { self.output.discard() } else { 0 };
    if discarded > 0 {
      warn!(agent = %self.name, discarded, "Discarded undelivered messages");
    }
  }

  /// Bookkeeping once a background loop has finished
  ///
  /// Any exit other than a drain leaves no consumer behind, so both mailboxes
  /// are force-stopped and emptied to release blocked producers and askers.
  fn loop_exited(&self, exit: &LoopExit, cancel: &CancellationToken) {
    match exit {
      LoopExit::Drained => {}
      LoopExit::Cancelled => {
        if !cancel.is_cancelled() {
          warn!(agent = %self.name, "Loop ended on a cancellation error from handler code");
        }
        self.abandon_mailboxes();
      }
      LoopExit::Faulted(fault) => {
        self.publish(fault.clone());
        self.abandon_mailboxes();
      }
    }

    if self
      .state
      .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      info!(agent = %self.name, "Agent is no longer running");
    }
  }
}

// ============================================================================
// Agent
// ============================================================================

/// An actor-style unit owning a mailbox and a private processing loop
///
/// # Shutdown
///
/// - `stop(false, ..)` closes the mailbox and delivers every accepted message first
/// - `stop(true, ..)` cancels immediately and discards undelivered messages
/// - dropping the agent force-cancels its mailboxes without waiting
pub struct Agent<M: Send + 'static> {
  shared: Arc<Shared<M>>,
  handler: Mutex<Option<Box<dyn MessageHandler<M>>>>,
  scan_handler: Mutex<Option<Box<dyn ScanHandler<M>>>>,
  tasks: Mutex<Vec<JoinHandle<LoopExit>>>,
  /// Tripped once the winning `stop` has finished its shutdown sequence
  stop_done: CancellationToken,
  runtime: Option<Handle>,
  scan_runtime: Option<Handle>,
  default_timeout: Option<Duration>,
}

impl<M: Send + 'static> Agent<M> {
  /// Create an agent without starting it
  ///
  /// Messages posted before `start` are queued (subject to backpressure).
  pub fn new(handler: impl MessageHandler<M>, options: AgentOptions<M>) -> Self {
    let AgentOptions {
      name,
      capacity,
      scan_capacity,
      cancel,
      scan_handler,
      runtime,
      scan_runtime,
      default_timeout,
    } = options;

    let parent = cancel.unwrap_or_default();
    let input = Arc::new(Mailbox::new(capacity, &parent));
    let output = match scan_handler {
      // Only the scan loop writes here
      Some(_) => Arc::new(Mailbox::new(scan_capacity, &parent)),
      None => Arc::clone(&input),
    };
    let (faults, _) = broadcast::channel(FAULT_BUFFER);

    let shared = Shared {
      name: Arc::from(name),
      input,
      output,
      has_scan: scan_handler.is_some(),
      state: AtomicU8::new(NOT_STARTED),
      faults,
      hooks: LifecycleHooks::default(),
      main_done: CancellationToken::new(),
    };

    let handler: Box<dyn MessageHandler<M>> = Box::new(handler);

    Self {
      shared: Arc::new(shared),
      handler: Mutex::new(Some(handler)),
      scan_handler: Mutex::new(scan_handler),
      tasks: Mutex::new(Vec::new()),
      stop_done: CancellationToken::new(),
      runtime,
      scan_runtime,
      default_timeout,
    }
  }

  /// Create and start an agent
  pub fn spawn(handler: impl MessageHandler<M>, options: AgentOptions<M>) -> Result<Self, AgentError> {
    let agent = Self::new(handler, options);
    agent.start()?;
    Ok(agent)
  }

  /// Start the background loops
  ///
  /// Fails with `AlreadyStarted` on every call after the first, including
  /// after the agent has stopped; the running loops are unaffected.
  pub fn start(&self) -> Result<(), AgentError> {
    let main_runtime = match &self.runtime {
      Some(runtime) => runtime.clone(),
      None => Handle::try_current().map_err(|_| AgentError::NoRuntime)?,
    };
    let scan_runtime = self.scan_runtime.clone().unwrap_or_else(|| main_runtime.clone());

    // Held across the transition so a racing stop never misses a task handle
    let mut tasks = self.tasks.lock();

    self
      .shared
      .state
      .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .map_err(|_| AgentError::AlreadyStarted)?;

    let Some(handler) = self.handler.lock().take() else {
      return Err(AgentError::AlreadyStarted);
    };

    info!(agent = %self.shared.name, scan = self.shared.has_scan, "Starting agent");

    tasks.push(main_runtime.spawn(worker::run_main_loop(Arc::clone(&self.shared), handler)));

    if let Some(scan_handler) = self.scan_handler.lock().take() {
      tasks.push(scan_runtime.spawn(worker::run_scan_loop(Arc::clone(&self.shared), scan_handler)));
    }

    Ok(())
  }

  /// Stop the agent, gracefully or by force
  ///
  /// Idempotent: concurrent callers share one shutdown sequence and all
  /// return once it completes. With a `timeout`, returns when it elapses even
  /// if the loops have not drained; check `completion` for certainty.
  ///
  /// Cancellation during shutdown is expected and swallowed. A handler fault
  /// raised while draining is returned (and was already published).
  ///
  /// An agent whose loops already ended on their own (fault or cancellation
  /// from handler code) is `Stopped`: `stop` returns `Ok(())` at once, the
  /// `Stopping` and `Stopped` hooks never fire, and any fault is only
  /// observable through [`Agent::errors`].
  pub async fn stop(&self, force: bool, timeout: Option<Duration>) -> Result<(), AgentError> {
    let mut current = self.shared.state.load(Ordering::Acquire);
    loop {
      match current {
        NOT_STARTED | RUNNING => {
          match self
            .shared
            .state
            .compare_exchange(current, STOPPING, Ordering::AcqRel, Ordering::Acquire)
          {
            Ok(_) => return self.shutdown_sequence(force, timeout).await,
            Err(actual) => current = actual,
          }
        }
        STOPPING => {
          self.wait_for_stop(timeout).await;
          return Ok(());
        }
        _ => return Ok(()),
      }
    }
  }

  /// Forced stop: cancel immediately and discard undelivered messages
  pub async fn shutdown(&self) -> Result<(), AgentError> {
    self.stop(true, None).await
  }

  async fn shutdown_sequence(&self, force: bool, timeout: Option<Duration>) -> Result<(), AgentError> {
    let shared = &self.shared;
    info!(agent = %shared.name, force, "Stopping agent");

    shared.hooks.clear(LifecycleEvent::Starting);
    shared.hooks.fire(LifecycleEvent::Stopping);

    let tasks = std::mem::take(&mut *self.tasks.lock());
    let never_started = tasks.is_empty();

    shared.input.stop(force);
    // A running scan loop closes the output itself once the input is drained
    if shared.has_scan && (force || never_started) {
      shared.output.stop(force);
    }

    let result = self.await_loops(tasks, timeout).await;

    // Nothing will ever consume what is left; dropping it resolves pending asks
    if force || never_started {
      let mut discarded = shared.input.discard();
      if shared.has_scan {
        discarded += shared.output.discard();
      }
      if discarded > 0 {
        warn!(agent = %shared.name, discarded, "Discarded undelivered messages");
      }
    }

    if never_started {
      shared.main_done.cancel();
    }
    shared.state.store(STOPPED, Ordering::Release);
    self.stop_done.cancel();
    shared.hooks.fire(LifecycleEvent::Stopped);
    info!(agent = %shared.name, "Agent stopped");

    result
  }

  async fn await_loops(&self, tasks: Vec<JoinHandle<LoopExit>>, timeout: Option<Duration>) -> Result<(), AgentError> {
    let joined = futures::future::join_all(tasks);
    let exits = match timeout {
      Some(limit) => match tokio::time::timeout(limit, joined).await {
        Ok(exits) => exits,
        Err(_) => {
          warn!(
            agent = %self.shared.name,
            timeout_ms = limit.as_millis() as u64,
            "Agent did not finish draining before the stop timeout"
          );
          return Ok(());
        }
      },
      None => joined.await,
    };

    let mut result = Ok(());
    for exit in exits {
      match exit {
        Ok(LoopExit::Faulted(fault)) if result.is_ok() => result = Err(AgentError::Fault(fault)),
        Ok(_) => {}
        Err(e) => debug!(agent = %self.shared.name, error = %e, "Agent loop aborted"),
      }
    }
    result
  }

  async fn wait_for_stop(&self, timeout: Option<Duration>) {
    match timeout {
      Some(limit) => {
        let _ = tokio::time::timeout(limit, self.stop_done.cancelled()).await;
      }
      None => self.stop_done.cancelled().await,
    }
  }

  // ==========================================================================
  // Messaging
  // ==========================================================================

  /// Fire-and-forget send
  pub async fn post(&self, message: M) -> Result<(), MailboxError> {
    self.shared.input.post(message).await
  }

  /// Request/response send using the agent's default timeout
  pub async fn ask<R, F>(&self, build: F) -> Result<R, AskError>
  where
    F: FnOnce(ReplyChannel<R>) -> M,
  {
    self.ask_with_timeout(build, self.default_timeout).await
  }

  /// Request/response send
  ///
  /// `build` wraps the reply channel into a message. The timeout covers both
  /// posting and waiting. Exactly one outcome is returned: the handler's
  /// value or error, or a cancelled-family error (cancelled, timed out, or
  /// closed when the message could not be delivered or was discarded).
  pub async fn ask_with_timeout<R, F>(&self, build: F, timeout: Option<Duration>) -> Result<R, AskError>
  where
    F: FnOnce(ReplyChannel<R>) -> M,
  {
    let (channel, pending) = ReplyChannel::new();
    let message = build(channel);
    let cancel = self.cancellation_token();

    let exchange = async {
      self.post(message).await?;
      pending.wait(&cancel, None).await
    };

    match timeout {
      Some(limit) => tokio::time::timeout(limit, exchange)
        .await
        .unwrap_or(Err(AskError::TimedOut(limit))),
      None => exchange.await,
    }
  }

  /// Pull the next message the main handler would see
  ///
  /// For custom drivers of an agent that was never started. Racing this
  /// against a running main loop splits the stream between the two.
  pub async fn receive(&self) -> Result<M, MailboxError> {
    self.shared.output.receive().await
  }

  // ==========================================================================
  // Errors and lifecycle observation
  // ==========================================================================

  /// Subscribe to faults raised by the background loops
  pub fn errors(&self) -> broadcast::Receiver<AgentFault> {
    self.shared.faults.subscribe()
  }

  /// Publish a fault on the error sink
  pub fn report_error(&self, error: impl Into<anyhow::Error>) {
    let fault = AgentFault::new(Arc::clone(&self.shared.name), FaultStage::Reported, error.into());
    self.shared.publish(fault);
  }

  /// Register a fire-once hook for a lifecycle transition
  pub fn on_lifecycle(&self, event: LifecycleEvent, hook: impl FnOnce(LifecycleEvent) + Send + 'static) {
    self.shared.hooks.register(event, Box::new(hook));
  }

  pub fn on_starting(&self, hook: impl FnOnce() + Send + 'static) {
    self.on_lifecycle(LifecycleEvent::Starting, move |_| hook());
  }

  pub fn on_stopping(&self, hook: impl FnOnce() + Send + 'static) {
    self.on_lifecycle(LifecycleEvent::Stopping, move |_| hook());
  }

  pub fn on_stopped(&self, hook: impl FnOnce() + Send + 'static) {
    self.on_lifecycle(LifecycleEvent::Stopped, move |_| hook());
  }

  /// Resolves once the main loop's mailbox is closed and drained, or cancelled,
  /// and a started main loop has finished handling its last message
  pub async fn completion(&self) {
    self.shared.output.completion().await;
    if self.shared.state.load(Ordering::Acquire) != NOT_STARTED {
      self.shared.main_done.cancelled().await;
    }
  }

  // ==========================================================================
  // Accessors
  // ==========================================================================

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  pub fn state(&self) -> AgentState {
    AgentState::from_u8(self.shared.state.load(Ordering::Acquire))
  }

  pub fn is_started(&self) -> bool {
    self.state() == AgentState::Running
  }

  /// Running and still able to process messages
  pub fn is_running(&self) -> bool {
    self.is_started() && !self.shared.output.is_completed()
  }

  pub fn default_timeout(&self) -> Option<Duration> {
    self.default_timeout
  }

  /// Token handed to the main handler; cancelled by a forced stop
  pub fn cancellation_token(&self) -> CancellationToken {
    self.shared.output.cancellation_token()
  }

  /// Messages accepted but not yet handled (both mailboxes with a scan stage)
  pub fn queue_len(&self) -> usize {
    if self.shared.has_scan {
      self.shared.input.len() + self.shared.output.len()
    } else {
      self.shared.input.len()
    }
  }
}

impl<M: Send + 'static> Drop for Agent<M> {
  fn drop(&mut self) {
    // Loops hold their own reference to the shared state and exit on cancellation
    self.shared.input.stop(true);
    self.shared.output.stop(true);
  }
}

impl<M: Send + 'static> std::fmt::Debug for Agent<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Agent")
      .field("name", &self.shared.name)
      .field("state", &self.state())
      .field("scan", &self.shared.has_scan)
      .field("queued", &self.queue_len())
      .finish()
  }
}
