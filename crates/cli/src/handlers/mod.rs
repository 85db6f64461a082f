//! Handlers for the demo agents

mod coordinator;
mod file_writer;
mod line_counter;

pub use coordinator::{CoordinatorHandler, JobSettings};
pub use file_writer::FileWriterHandler;
pub use line_counter::LineCounterScan;
