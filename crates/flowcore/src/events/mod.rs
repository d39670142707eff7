// crates/flowcore/src/events/mod.rs

mod base;
mod listener;

pub use base::{EventBus, ExecutionEvent, LogLine, RunLog, TaskListener};
pub use listener::{GraphListener, GraphListenerRegistry};
