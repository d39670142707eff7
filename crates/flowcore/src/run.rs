use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

pub type RunId = Uuid;

/// Terminal (or not yet terminal) status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending)
    }

    fn severity(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Success => 1,
            RunStatus::Unstable => 2,
            RunStatus::Failure => 3,
            RunStatus::Aborted => 4,
        }
    }

    /// The worse of two results.
    pub fn combine(self, other: RunStatus) -> RunStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Unstable => "UNSTABLE",
            RunStatus::Failure => "FAILURE",
            RunStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Run result recorded by steps while the body is still running.
///
/// Only ever gets worse: marking a run unstable and then successful leaves
/// it unstable.
#[derive(Debug, Clone)]
pub struct ResultCell(Arc<Mutex<RunStatus>>);

impl ResultCell {
    pub fn new(initial: RunStatus) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> RunStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark(&self, status: RunStatus) -> RunStatus {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *current = current.combine(status);
        *current
    }
}

impl Default for ResultCell {
    fn default() -> Self {
        Self::new(RunStatus::Success)
    }
}

/// Persisted attributes of one execution of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    /// Job identity the run belongs to; the key for identity assignment.
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: job.into(),
            started_at: Utc::now(),
            status: RunStatus::Pending,
            finished_at: None,
        }
    }
}
