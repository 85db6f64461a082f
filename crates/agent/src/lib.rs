//! Mailbox-driven agents
//!
//! An [`Agent`] owns private state behind a single-consumer [`Mailbox`].
//! Callers interact only by message passing:
//!
//! - [`Agent::post`] enqueues a message (fire-and-forget, with backpressure)
//! - [`Agent::ask`] enqueues a message carrying a [`ReplyChannel`] and awaits the reply
//!
//! An optional [`ScanHandler`] stage filters, transforms or fans out messages
//! before the main [`MessageHandler`] sees them.
//!
//! # Example
//!
//! ```ignore
//! enum Counter { Add(u64), Total(ReplyChannel<u64>) }
//!
//! let agent = Agent::spawn(CounterHandler::default(), AgentOptions::new("counter"))?;
//! agent.post(Counter::Add(2)).await?;
//! let total = agent.ask(Counter::Total).await?;
//! agent.stop(false, None).await?;
//! ```

mod agent;
mod errors;
mod handler;
mod mailbox;
mod options;
mod registry;
mod reply;


pub use agent::{Agent, AgentState, LifecycleEvent};
pub use errors::{AgentError, AgentFault, AskError, FaultStage};
pub use handler::{MessageHandler, ScanHandler};
pub use mailbox::{Capacity, DEFAULT_BOUNDED_CAPACITY, Mailbox, MailboxError};
pub use options::{AgentConfig, AgentOptions, ConfigError};
pub use registry::{AgentRegistry, RegistryError};
pub use reply::{PendingReply, ReplyChannel};

// Re-exported for handler implementations
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
