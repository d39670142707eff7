//! Core abstractions for the durable flow engine
//!
//! This crate provides the types every other crate depends on: the
//! definition tree, the append-only flow graph, environment and identity
//! resolution, and the step execution contract. It contains no engine.

pub mod env;
mod error;
pub mod events;
mod definition;
mod graph;
pub mod identity;
mod run;
mod step;
mod value;

pub use definition::{Branch, Construct, ConstructPath, Definition, DefinitionMode, Expr, StepCall};
pub use env::{AgentEnv, AgentProvider, EnvMap, EnvironmentOverlay, StaticAgentProvider};
pub use error::{
    AlreadyCompletedError, CheckpointError, DefinitionError, FailureKind, FlowError, ResumeError, StepFailure,
};
pub use events::*;
pub use graph::{FlowGraph, FlowNode, FlowNodeId, FlowNodeKind};
pub use identity::{IdentityPolicy, IdentityProvider, Principal, StaticIdentityProvider};
pub use run::{ResultCell, RunId, RunRecord, RunStatus};
pub use step::{
    AsAny, CompletionHandle, CompletionSink, ContextService, StepContext, StepExecution, StepExecutionId,
    StepOutcome, StepStart,
};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
