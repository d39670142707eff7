use async_trait::async_trait;
use flowcore::{RunStatus, StepContext, StepExecution, StepFailure, StepStart, Value};
use flowruntime::{ArgDefinition, StepDescriptor, StepMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn message_arg(args: &BTreeMap<String, Value>, default: &str) -> String {
    args.get("message")
        .map(|v| v.to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Writes a message to the run log and returns it.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoStep {
    message: String,
}

#[async_trait]
impl StepExecution for EchoStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        ctx.listener.println(self.message.clone());
        Ok(StepStart::Sync(Value::String(self.message.clone())))
    }
}

pub struct EchoStepDescriptor;

impl StepDescriptor for EchoStepDescriptor {
    fn function_name(&self) -> &str {
        "echo"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        Ok(Box::new(EchoStep {
            message: message_arg(args, ""),
        }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<EchoStep>(saved)
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Print a message to the run log".to_string(),
            category: "debug".to_string(),
            args: vec![ArgDefinition::optional("message", "Text to print")],
            asynchronous: false,
        }
    }
}

/// Fails with the given message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorStep {
    message: String,
}

#[async_trait]
impl StepExecution for ErrorStep {
    async fn start(&mut self, _ctx: &StepContext) -> Result<StepStart, StepFailure> {
        Err(StepFailure::new(self.message.clone()))
    }
}

pub struct ErrorStepDescriptor;

impl StepDescriptor for ErrorStepDescriptor {
    fn function_name(&self) -> &str {
        "error"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        Ok(Box::new(ErrorStep {
            message: message_arg(args, "error"),
        }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<ErrorStep>(saved)
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Fail the step with a message".to_string(),
            category: "debug".to_string(),
            args: vec![ArgDefinition::required("message", "Failure message")],
            asynchronous: false,
        }
    }
}

/// Marks the run unstable without failing it.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnstableStep {
    message: String,
}

#[async_trait]
impl StepExecution for UnstableStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        ctx.listener.println(format!("WARNING: {}", self.message));
        ctx.result.mark(RunStatus::Unstable);
        Ok(StepStart::Sync(Value::Null))
    }
}

pub struct UnstableStepDescriptor;

impl StepDescriptor for UnstableStepDescriptor {
    fn function_name(&self) -> &str {
        "unstable"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        Ok(Box::new(UnstableStep {
            message: message_arg(args, "marked unstable"),
        }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<UnstableStep>(saved)
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Mark the run unstable".to_string(),
            category: "debug".to_string(),
            args: vec![ArgDefinition::optional("message", "Reason")],
            asynchronous: false,
        }
    }
}
