use crate::{FlowNodeId, RunId, RunStatus, StepExecutionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Events emitted while runs progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        job: String,
        timestamp: DateTime<Utc>,
    },
    RunSuspended {
        run_id: RunId,
        pending_steps: usize,
        timestamp: DateTime<Utc>,
    },
    RunResumed {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        run_id: RunId,
        step_id: StepExecutionId,
        node_id: FlowNodeId,
        step: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        run_id: RunId,
        node_id: FlowNodeId,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        run_id: RunId,
        node_id: FlowNodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Output {
        run_id: RunId,
        line: LogLine,
    },
}

/// One line of run output, attributed to the flow node that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<FlowNodeId>,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Ordered output of a run, readable at any time.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted lines.
    pub fn from_lines(lines: Vec<LogLine>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines)),
        }
    }

    pub fn append(&self, node: Option<FlowNodeId>, text: impl Into<String>) -> LogLine {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = LogLine {
            seq: lines.len() as u64,
            node,
            text: text.into(),
            at: Utc::now(),
        };
        lines.push(line.clone());
        line
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn text(&self) -> String {
        self.lines()
            .into_iter()
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|l| l.text.contains(needle))
    }
}

/// Output sink handed to a step: writes to the run log and broadcasts.
#[derive(Clone)]
pub struct TaskListener {
    run_id: RunId,
    node_id: Option<FlowNodeId>,
    log: RunLog,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl TaskListener {
    pub fn new(
        run_id: RunId,
        node_id: Option<FlowNodeId>,
        log: RunLog,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            run_id,
            node_id,
            log,
            sender,
        }
    }

    pub fn println(&self, text: impl Into<String>) {
        let line = self.log.append(self.node_id, text);
        tracing::debug!(run = %self.run_id, node = ?self.node_id, "{}", line.text);
        let _ = self.sender.send(ExecutionEvent::Output {
            run_id: self.run_id,
            line,
        });
    }

    pub fn node_id(&self) -> Option<FlowNodeId> {
        self.node_id
    }
}

/// Process-wide broadcast of execution events.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> broadcast::Sender<ExecutionEvent> {
        self.sender.clone()
    }

    pub fn create_listener(&self, run_id: RunId, node_id: Option<FlowNodeId>, log: RunLog) -> TaskListener {
        TaskListener::new(run_id, node_id, log, self.sender.clone())
    }
}
