//! Serializable shape of a suspended run.
//!
//! Everything needed to rebuild a `FlowExecution` after a restart lives
//! here: the definition, the graph, the interpreter threads with their
//! frame stacks, and the saved fields of every pending step.

use chrono::{DateTime, Utc};
use flowcore::{
    AgentEnv, ConstructPath, Definition, EnvMap, FlowGraph, FlowNodeId, LogLine, Principal, RunRecord, RunStatus,
    StepExecutionId, StepFailure, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bumped whenever the layout below changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

pub type ThreadId = u32;

/// Outcome of a construct once it has finished running.
pub type BlockOutcome = Result<(), StepFailure>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run: RunRecord,
    pub definition: Definition,
    pub graph: FlowGraph,
    pub threads: Vec<ThreadState>,
    pub next_thread: ThreadId,
    pub pending: Vec<PendingRecord>,
    pub env_overrides: EnvMap,
    pub vars: BTreeMap<String, Value>,
    pub principal: Principal,
    /// Result recorded by steps (e.g. unstable), combined with the body
    /// outcome when the run finishes.
    pub result: RunStatus,
    pub log: Vec<LogLine>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }
}

/// A step execution that was waiting when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: StepExecutionId,
    /// Registered step name used to restore the execution.
    pub kind: String,
    pub thread: ThreadId,
    pub node: FlowNodeId,
    pub args: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    pub saved: serde_json::Value,
    pub since: DateTime<Utc>,
}

/// One strand of control. The root thread has no parent; each parallel
/// branch runs on its own thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ThreadId>,
    /// Last flow node appended on this thread.
    pub head: FlowNodeId,
    pub frames: Vec<Frame>,
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ThreadStatus {
    Runnable { signal: Signal },
    Waiting { step: StepExecutionId },
    /// Parked on a parallel block until every branch finishes.
    Joining,
    Finished { outcome: BlockOutcome },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Start running the construct at `path`.
    Enter { path: ConstructPath },
    /// The construct below the top frame finished.
    Return { outcome: BlockOutcome },
}

/// An open construct on a thread's stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Sequence {
        path: ConstructPath,
        next: usize,
    },
    Retry {
        path: ConstructPath,
        start: FlowNodeId,
        attempt: u32,
        attempts: u32,
    },
    Try {
        path: ConstructPath,
        start: FlowNodeId,
        catching: bool,
    },
    Scope {
        path: ConstructPath,
        start: FlowNodeId,
        scope: Scope,
    },
    Parallel {
        path: ConstructPath,
        start: FlowNodeId,
        branches: Vec<ThreadId>,
    },
    /// Bottom frame of a branch thread.
    Branch { start: FlowNodeId },
}

/// Contextual state contributed by an open block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Env { vars: EnvMap },
    /// Environment reported by the agent when the block was entered.
    Agent { label: String, env: AgentEnv },
    Identity { principal: Principal },
}

impl Frame {
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Frame::Scope { scope, .. } => Some(scope),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_state_is_tagged_and_stable() {
        let thread = ThreadState {
            id: 0,
            parent: None,
            head: 4,
            frames: vec![
                Frame::Sequence {
                    path: ConstructPath::root(),
                    next: 2,
                },
                Frame::Retry {
                    path: ConstructPath(vec![1]),
                    start: 3,
                    attempt: 2,
                    attempts: 3,
                },
            ],
            status: ThreadStatus::Waiting {
                step: uuid::Uuid::nil(),
            },
        };
        let json = serde_json::to_value(&thread).unwrap();
        assert_eq!(json["frames"][1]["frame"], "retry");
        assert_eq!(json["frames"][1]["attempt"], 2);
        assert_eq!(json["status"]["state"], "waiting");
        let back: ThreadState = serde_json::from_value(json).unwrap();
        assert_eq!(back, thread);
    }

    #[test]
    fn failure_outcomes_survive_encoding() {
        let status = ThreadStatus::Finished {
            outcome: Err(StepFailure::aborted("stopped")),
        };
        let back: ThreadStatus = serde_json::from_str(&serde_json::to_string(&status).unwrap()).unwrap();
        match back {
            ThreadStatus::Finished { outcome: Err(f) } => assert!(f.is_abort()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
