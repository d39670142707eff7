use crate::{
    AlreadyCompletedError, EnvironmentOverlay, FlowNodeId, Principal, ResultCell, RunId, StepFailure, TaskListener,
    Value,
};
use async_trait::async_trait;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type StepExecutionId = Uuid;

/// Result of a step's start routine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStart {
    /// Finished on the spot; the engine advances on the same call stack.
    Sync(Value),
    /// Waiting on something external; completion arrives through the
    /// context's `CompletionHandle`, possibly after a restart.
    Pending,
}

pub type StepOutcome = Result<Value, StepFailure>;

/// Context services a step kind relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextService {
    Listener,
    Environment,
    Identity,
    /// Only available inside a `node` block.
    Agent,
}

impl fmt::Display for ContextService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextService::Listener => "listener",
            ContextService::Environment => "environment",
            ContextService::Identity => "identity",
            ContextService::Agent => "agent",
        };
        f.write_str(s)
    }
}

/// Downcasting support for step executions held as trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One invocation of a step.
///
/// Instances are rebuilt from `save()` output after a restart, so any
/// field that cannot be serialized (listeners, timers, identities) must be
/// re-derived in `on_resume`.
#[async_trait]
pub trait StepExecution: AsAny + Send + Sync {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure>;

    /// Called once per restart, before the execution can be completed.
    fn on_resume(&mut self, _ctx: &StepContext) -> Result<(), StepFailure> {
        Ok(())
    }

    /// Interrupt an external wait. The engine records the abort itself.
    fn stop(&mut self, _ctx: &StepContext, _cause: &StepFailure) {}

    /// Fields that must survive a restart.
    fn save(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Short human readable state for administrative listings.
    fn status(&self) -> Option<String> {
        None
    }
}

/// Receives completion signals on behalf of a flow execution.
pub trait CompletionSink: Send + Sync {
    fn deliver(&self, step_id: StepExecutionId, outcome: StepOutcome);
}

/// The `complete(result)` side of a pending step. Cloneable, callable from
/// any thread; only the first call is delivered.
#[derive(Clone)]
pub struct CompletionHandle {
    step_id: StepExecutionId,
    completed: Arc<AtomicBool>,
    sink: Arc<dyn CompletionSink>,
}

impl CompletionHandle {
    pub fn new(step_id: StepExecutionId, sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            step_id,
            completed: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn complete(&self, outcome: StepOutcome) -> Result<(), AlreadyCompletedError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            tracing::warn!(step = %self.step_id, "duplicate completion ignored");
            return Err(AlreadyCompletedError(self.step_id));
        }
        self.sink.deliver(self.step_id, outcome);
        Ok(())
    }

    pub fn success(&self, value: impl Into<Value>) -> Result<(), AlreadyCompletedError> {
        self.complete(Ok(value.into()))
    }

    pub fn failure(&self, failure: StepFailure) -> Result<(), AlreadyCompletedError> {
        self.complete(Err(failure))
    }

    /// Close the handle without delivering anything. Returns false when a
    /// completion already went through.
    pub fn revoke(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn step_id(&self) -> StepExecutionId {
        self.step_id
    }
}

/// Everything a step may use, passed explicitly on every call.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub step_id: StepExecutionId,
    pub node_id: FlowNodeId,
    pub args: BTreeMap<String, Value>,
    pub env: EnvironmentOverlay,
    pub identity: Principal,
    /// Label of the enclosing `node` block, if any.
    pub agent: Option<String>,
    pub listener: TaskListener,
    /// Run result, for steps that mark the run unstable.
    pub result: ResultCell,
    pub completion: CompletionHandle,
    pub cancellation: CancellationToken,
}

impl StepContext {
    /// Get required argument or fail the step
    pub fn require_arg(&self, name: &str) -> Result<&Value, StepFailure> {
        self.args
            .get(name)
            .ok_or_else(|| StepFailure::new(format!("Missing required argument: {}", name)))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StepFailure> {
        self.require_arg(name)?
            .as_str()
            .ok_or_else(|| StepFailure::new(format!("Argument '{}' must be a string", name)))
    }

    /// Get argument with default
    pub fn arg_or(&self, name: &str, default: Value) -> Value {
        self.args.get(name).cloned().unwrap_or(default)
    }

    pub fn on_success(&self, value: impl Into<Value>) -> Result<(), AlreadyCompletedError> {
        self.completion.success(value)
    }

    pub fn on_failure(&self, failure: StepFailure) -> Result<(), AlreadyCompletedError> {
        self.completion.failure(failure)
    }
}
