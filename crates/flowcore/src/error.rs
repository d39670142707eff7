use crate::{RunId, StepExecutionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Step failure: {0}")]
    Step(#[from] StepFailure),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Resume error: {0}")]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    AlreadyCompleted(#[from] AlreadyCompletedError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed or unsupported pipeline definition; fatal to starting a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Cannot parse definition: {0}")]
    Parse(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Invalid construct at {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("{construct} is not allowed in restricted mode")]
    NotAllowedInRestrictedMode { construct: String },
}

/// Whether a failure came from the step's own logic or from an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Aborted,
}

/// A step's own logic failed. Recoverable by enclosing retry/try blocks
/// unless it is an abort.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    pub kind: FailureKind,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Error,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Aborted,
        }
    }

    pub fn is_abort(&self) -> bool {
        self.kind == FailureKind::Aborted
    }
}

/// Persisting a checkpoint failed. The run cannot safely continue.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint for run {run}: {source}")]
    Write {
        run: RunId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode checkpoint for run {run}: {source}")]
    Encode {
        run: RunId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Reconstruction after restart found inconsistent or missing state.
#[derive(Error, Debug)]
pub enum ResumeError {
    #[error("No checkpoint for run {0}")]
    Missing(RunId),

    #[error("Checkpoint for run {run} is unreadable: {reason}")]
    Corrupt { run: RunId, reason: String },

    #[error("Unsupported checkpoint format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Run {run} references unknown step kind '{kind}'")]
    UnknownStepKind { run: RunId, kind: String },

    #[error("Run {run} is inconsistent: {reason}")]
    Inconsistent { run: RunId, reason: String },
}

/// A completion arrived for a step that already completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Step execution {0} already completed")]
pub struct AlreadyCompletedError(pub StepExecutionId);
