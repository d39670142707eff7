use async_trait::async_trait;
use dashmap::DashMap;
use flowcore::{StepContext, StepExecution, StepFailure, StepStart, Value};
use flowruntime::{ArgDefinition, FlowRuntime, StepDescriptor, StepMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hands out `<id>/<n>` keys, numbering each semaphore id from 1.
///
/// Restored semaphores report their keys back, so a fresh board never
/// hands out a key that a resumed run still holds.
#[derive(Debug, Default)]
pub struct SemaphoreBoard {
    counters: DashMap<String, u32>,
}

impl SemaphoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, id: &str) -> String {
        let mut counter = self.counters.entry(id.to_string()).or_insert(0);
        *counter += 1;
        format!("{id}/{}", *counter)
    }

    /// Raise the counter for the id in `key` to at least its number.
    fn observe(&self, key: &str) {
        let Some((id, n)) = key.rsplit_once('/') else {
            return;
        };
        let Ok(n) = n.parse::<u32>() else {
            return;
        };
        self.counters
            .entry(id.to_string())
            .and_modify(|counter| *counter = (*counter).max(n))
            .or_insert(n);
    }
}

/// Blocks until released from outside the run.
#[derive(Debug, Serialize, Deserialize)]
pub struct SemaphoreStep {
    id: String,
    #[serde(skip)]
    board: Option<Arc<SemaphoreBoard>>,
    #[serde(default)]
    key: Option<String>,
}

impl SemaphoreStep {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

#[async_trait]
impl StepExecution for SemaphoreStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        let board = self
            .board
            .as_ref()
            .ok_or_else(|| StepFailure::new("semaphore started without a board"))?;
        let key = board.allocate(&self.id);
        ctx.listener.println(format!("[{key}] waiting"));
        self.key = Some(key);
        Ok(StepStart::Pending)
    }

    fn on_resume(&mut self, ctx: &StepContext) -> Result<(), StepFailure> {
        if self.key.is_none() {
            return Err(StepFailure::new(format!("semaphore {} lost its key", self.id)));
        }
        ctx.listener.println(format!("[{}] still waiting", self.key.as_deref().unwrap_or_default()));
        Ok(())
    }

    fn save(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn status(&self) -> Option<String> {
        self.key.clone()
    }
}

pub struct SemaphoreStepDescriptor {
    board: Arc<SemaphoreBoard>,
}

impl SemaphoreStepDescriptor {
    pub fn new(board: Arc<SemaphoreBoard>) -> Self {
        Self { board }
    }
}

impl StepDescriptor for SemaphoreStepDescriptor {
    fn function_name(&self) -> &str {
        "semaphore"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        let id = args
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StepFailure::new("semaphore needs a string 'id' argument"))?;
        Ok(Box::new(SemaphoreStep {
            id: id.to_string(),
            board: Some(Arc::clone(&self.board)),
            key: None,
        }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        let mut step: SemaphoreStep = serde_json::from_value(saved).map_err(|e| e.to_string())?;
        if let Some(key) = &step.key {
            self.board.observe(key);
        }
        step.board = Some(Arc::clone(&self.board));
        Ok(Box::new(step))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Wait until released by key".to_string(),
            category: "control".to_string(),
            args: vec![ArgDefinition::required("id", "Semaphore name; keys are <id>/<n>")],
            asynchronous: true,
        }
    }
}

/// Complete the semaphore waiting under `key` with `value`.
pub fn release(runtime: &FlowRuntime, key: &str, value: impl Into<Value>) -> bool {
    signal(runtime, key, Ok(value.into()))
}

/// Fail the semaphore waiting under `key`.
pub fn fail(runtime: &FlowRuntime, key: &str, message: &str) -> bool {
    signal(runtime, key, Err(StepFailure::new(message)))
}

fn signal(runtime: &FlowRuntime, key: &str, outcome: Result<Value, StepFailure>) -> bool {
    let mut outcome = Some(outcome);
    runtime.apply_to_all::<SemaphoreStep, _>(|step, ctx| {
        if step.key() != Some(key) {
            return;
        }
        if let Some(outcome) = outcome.take() {
            if let Err(e) = ctx.completion.complete(outcome) {
                tracing::warn!(key, "{e}");
            }
        }
    });
    outcome.is_none()
}
