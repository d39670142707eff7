use crate::checkpoint::ThreadId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowcore::{FlowNodeId, RunId, StepContext, StepExecution, StepExecutionId, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Administrative view of a waiting step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingStepInfo {
    pub step_id: StepExecutionId,
    pub run_id: RunId,
    pub kind: String,
    pub node_id: FlowNodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub since: DateTime<Utc>,
}

/// A started step waiting for its completion, together with the context
/// it was given.
pub struct PendingEntry {
    pub step_id: StepExecutionId,
    pub run_id: RunId,
    pub kind: String,
    pub node_id: FlowNodeId,
    pub thread: ThreadId,
    pub args: BTreeMap<String, Value>,
    pub bind: Option<String>,
    pub since: DateTime<Utc>,
    pub ctx: StepContext,
    execution: Mutex<Box<dyn StepExecution>>,
}

impl PendingEntry {
    pub fn new(
        kind: String,
        thread: ThreadId,
        args: BTreeMap<String, Value>,
        bind: Option<String>,
        since: DateTime<Utc>,
        ctx: StepContext,
        execution: Box<dyn StepExecution>,
    ) -> Self {
        Self {
            step_id: ctx.step_id,
            run_id: ctx.run_id,
            kind,
            node_id: ctx.node_id,
            thread,
            args,
            bind,
            since,
            ctx,
            execution: Mutex::new(execution),
        }
    }

    /// Run `f` with exclusive access to the step execution.
    pub fn with_execution<R>(&self, f: impl FnOnce(&mut dyn StepExecution, &StepContext) -> R) -> R {
        let mut guard = self.execution.lock().unwrap_or_else(PoisonError::into_inner);
        let exec: &mut dyn StepExecution = &mut **guard;
        f(exec, &self.ctx)
    }

    pub fn info(&self) -> PendingStepInfo {
        PendingStepInfo {
            step_id: self.step_id,
            run_id: self.run_id,
            kind: self.kind.clone(),
            node_id: self.node_id,
            status: self.with_execution(|exec, _| exec.status()),
            since: self.since,
        }
    }

    pub fn save(&self) -> serde_json::Value {
        self.with_execution(|exec, _| exec.save())
    }
}

/// Process-wide index of pending steps across all runs.
///
/// Entries are inserted only once fully initialized (restored and past
/// `on_resume`), so iteration never observes a half-built step.
#[derive(Default)]
pub struct PendingRegistry {
    entries: DashMap<StepExecutionId, Arc<PendingEntry>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<PendingEntry>) {
        self.entries.insert(entry.step_id, entry);
    }

    pub fn remove(&self, step_id: &StepExecutionId) -> Option<Arc<PendingEntry>> {
        self.entries.remove(step_id).map(|(_, entry)| entry)
    }

    pub fn get(&self, step_id: &StepExecutionId) -> Option<Arc<PendingEntry>> {
        self.entries.get(step_id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of matching entries, ordered by start time.
    pub fn list(&self, predicate: impl Fn(&PendingEntry) -> bool) -> Vec<PendingStepInfo> {
        let mut infos: Vec<PendingStepInfo> = self
            .snapshot()
            .into_iter()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.info())
            .collect();
        infos.sort_by_key(|info| (info.since, info.step_id));
        infos
    }

    /// Apply `action` to every pending execution matching `predicate`.
    ///
    /// Entries are collected before any action runs, so actions may
    /// complete their step (which removes it) without deadlocking the map.
    pub fn apply_to_all<P, F>(&self, predicate: P, mut action: F) -> usize
    where
        P: Fn(&PendingStepInfo) -> bool,
        F: FnMut(&mut dyn StepExecution, &StepContext),
    {
        let mut applied = 0;
        for entry in self.snapshot() {
            if !predicate(&entry.info()) {
                continue;
            }
            entry.with_execution(|exec, ctx| action(exec, ctx));
            applied += 1;
        }
        applied
    }

    /// Typed variant: only executions that downcast to `T`.
    pub fn apply_to_all_of<T, F>(&self, mut action: F) -> usize
    where
        T: StepExecution + 'static,
        F: FnMut(&mut T, &StepContext),
    {
        let mut applied = 0;
        for entry in self.snapshot() {
            entry.with_execution(|exec, ctx| {
                if let Some(typed) = exec.as_any_mut().downcast_mut::<T>() {
                    action(typed, ctx);
                    applied += 1;
                }
            });
        }
        applied
    }

    fn snapshot(&self) -> Vec<Arc<PendingEntry>> {
        let mut entries: Vec<Arc<PendingEntry>> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by_key(|entry| (entry.since, entry.step_id));
        entries
    }
}
