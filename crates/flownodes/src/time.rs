use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flowcore::{CompletionHandle, StepContext, StepExecution, StepFailure, StepStart, Value};
use flowruntime::{ArgDefinition, StepDescriptor, StepMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Waits until a deadline. The deadline is saved, so a restart only waits
/// for whatever time is left.
#[derive(Debug, Serialize, Deserialize)]
pub struct SleepStep {
    millis: u64,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
}

impl SleepStep {
    fn arm(&self, ctx: &StepContext) {
        let remaining = self
            .deadline
            .map(|d| (d - Utc::now()).num_milliseconds().max(0) as u64)
            .unwrap_or(self.millis);
        let completion: CompletionHandle = ctx.completion.clone();
        let cancel: CancellationToken = ctx.cancellation.clone();
        let millis = self.millis;
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(Duration::from_millis(remaining)) => {
                    let _ = completion.success(Value::Int(millis as i64));
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}

#[async_trait]
impl StepExecution for SleepStep {
    async fn start(&mut self, ctx: &StepContext) -> Result<StepStart, StepFailure> {
        ctx.listener.println(format!("Sleeping for {} ms", self.millis));
        let deadline = i64::try_from(self.millis)
            .ok()
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| StepFailure::new(format!("sleep of {} ms is out of range", self.millis)))?;
        self.deadline = Some(deadline);
        self.arm(ctx);
        Ok(StepStart::Pending)
    }

    fn on_resume(&mut self, ctx: &StepContext) -> Result<(), StepFailure> {
        self.arm(ctx);
        Ok(())
    }

    fn stop(&mut self, ctx: &StepContext, _cause: &StepFailure) {
        ctx.cancellation.cancel();
    }

    fn save(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn status(&self) -> Option<String> {
        self.deadline.map(|d| format!("until {}", d.to_rfc3339()))
    }
}

pub struct SleepStepDescriptor;

impl StepDescriptor for SleepStepDescriptor {
    fn function_name(&self) -> &str {
        "sleep"
    }

    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure> {
        let millis = args
            .get("millis")
            .and_then(Value::as_i64)
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| StepFailure::new("sleep needs a non-negative 'millis' argument"))?;
        Ok(Box::new(SleepStep {
            millis: millis as u64,
            deadline: None,
        }))
    }

    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String> {
        flowruntime::restore_json::<SleepStep>(saved)
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Wait for a number of milliseconds".to_string(),
            category: "time".to_string(),
            args: vec![ArgDefinition::required("millis", "Duration in milliseconds")],
            asynchronous: true,
        }
    }
}
