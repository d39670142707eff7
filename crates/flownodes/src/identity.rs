use async_trait::async_trait;
use flowcore::{ContextService, StepContext, StepExecution, StepFailure, StepStart, Value};
use flowruntime::{ArgDefinition, StepDescriptor, StepMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const IDENTITY_CONTEXT: &[ContextService] = &[ContextService::Listener, ContextService::Identity];

/// Prints and returns the identity the step runs as.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoamiStep {
    prefix: String,
}

#[async_trait]
impl StepExecution for WhoamiStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        ctx.listener.println(format!("{} {}", self.prefix, ctx.identity));
        Ok(StepStart::Sync(Value::String(ctx.identity.name().to_string())))
    }
}

pub struct WhoamiStepDescriptor;

impl StepDescriptor for WhoamiStepDescriptor {
    fn function_name(&self) -> &str {
        "whoami"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        let prefix = args
            .get("message")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "running as".to_string());
        Ok(Box::new(WhoamiStep { prefix }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<WhoamiStep>(saved)
    }

    fn required_context(&self) -> &'static [ContextService] {
        IDENTITY_CONTEXT
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Print the current identity".to_string(),
            category: "identity".to_string(),
            args: vec![ArgDefinition::optional("message", "Prefix, default \"running as\"")],
            asynchronous: false,
        }
    }
}

/// Waits for an external completion, reporting its identity when started
/// and again whenever it is brought back after a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CheckAuthStep {
    #[serde(default)]
    resumes: u32,
}

#[async_trait]
impl StepExecution for CheckAuthStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        ctx.listener.println(format!("running as {}", ctx.identity));
        Ok(StepStart::Pending)
    }

    fn on_resume(&mut self, ctx: &StepContext) -> Result<(), StepFailure> {
        self.resumes += 1;
        ctx.listener.println(format!("again running as {}", ctx.identity));
        Ok(())
    }

    fn save(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn status(&self) -> Option<String> {
        (self.resumes > 0).then(|| format!("resumed {} time(s)", self.resumes))
    }
}

pub struct CheckAuthStepDescriptor;

impl StepDescriptor for CheckAuthStepDescriptor {
    fn function_name(&self) -> &str {
        "check_auth"
    }

    fn create(&self, _args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        Ok(Box::new(CheckAuthStep::default()))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<CheckAuthStep>(saved)
    }

    fn required_context(&self) -> &'static [ContextService] {
        IDENTITY_CONTEXT
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Report the identity and wait for an external completion".to_string(),
            category: "identity".to_string(),
            args: Vec::new(),
            asynchronous: true,
        }
    }
}
