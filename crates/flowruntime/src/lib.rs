//! Flow execution runtime
//!
//! This crate provides the engine that interprets definitions into
//! suspendable runs: the step registry, the resumable interpreter, the
//! pending-step registry and the continuation stores that let a run pick
//! up where it left off after the process restarts.

mod checkpoint;
mod execution;
mod executor;
mod expr;
mod pending;
mod registry;
mod runtime;
mod store;

pub use checkpoint::{
    BlockOutcome, Checkpoint, Frame, PendingRecord, Scope, Signal, ThreadId, ThreadState, ThreadStatus,
    CHECKPOINT_VERSION,
};
pub use execution::{ExecutionPhase, FlowExecution};
pub use expr::Evaluator;
pub use pending::{PendingEntry, PendingRegistry, PendingStepInfo};
pub use registry::{restore_json, ArgDefinition, StepDescriptor, StepMetadata, StepRegistry};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder, ResumeReport, RuntimeConfig};
pub use store::{ContinuationStore, FileContinuationStore, InMemoryContinuationStore};
