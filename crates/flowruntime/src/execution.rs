use crate::checkpoint::Checkpoint;
use crate::executor::{verify_checkpoint, ExecutionState};
use crate::runtime::EngineServices;
use chrono::Utc;
use flowcore::identity::reresolve_principal;
use flowcore::{
    CompletionSink, Definition, DefinitionMode, EnvMap, EnvironmentOverlay, ExecutionEvent, FlowError, FlowGraph,
    Principal, ResumeError, RunId, RunLog, RunRecord, RunStatus, StepExecutionId, StepOutcome, Value,
};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};

/// Where a run stands between two advances.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionPhase {
    Running,
    /// Every thread is parked on a pending step or a join.
    Suspended { pending: usize },
    Completed(RunStatus),
    /// A checkpoint could not be written or the state is inconsistent.
    Halted(String),
}

impl ExecutionPhase {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ExecutionPhase::Running)
    }
}

/// Live execution of one run. Exactly one exists per run in a process.
///
/// All mutation goes through the state mutex, so completions arriving
/// concurrently from any thread are applied one at a time.
pub struct FlowExecution {
    run_id: RunId,
    job: String,
    mode: DefinitionMode,
    services: Arc<EngineServices>,
    state: Mutex<ExecutionState>,
    phase: watch::Sender<ExecutionPhase>,
    inflight: AtomicUsize,
    log: RunLog,
    handle: Handle,
}

/// Routes completion handles back onto the runtime.
struct ExecutionSink {
    execution: Weak<FlowExecution>,
}

impl CompletionSink for ExecutionSink {
    fn deliver(&self, step_id: StepExecutionId, outcome: StepOutcome) {
        match self.execution.upgrade() {
            Some(execution) => execution.schedule_advance(step_id, outcome),
            None => tracing::warn!(step = %step_id, "completion for a run that is no longer loaded"),
        }
    }
}

fn current_handle() -> Result<Handle, FlowError> {
    Handle::try_current().map_err(|e| FlowError::Execution(format!("no tokio runtime: {e}")))
}

impl FlowExecution {
    /// Create a run and schedule its first advance. Returns before any
    /// step has started.
    pub(crate) fn start(
        services: Arc<EngineServices>,
        definition: Definition,
        job: &str,
        principal: Principal,
    ) -> Result<Arc<Self>, FlowError> {
        let handle = current_handle()?;
        let run = RunRecord::new(job);
        let mode = definition.mode;
        let definition = Arc::new(definition);

        let execution = Arc::new_cyclic(|weak: &Weak<FlowExecution>| {
            let sink: Arc<dyn CompletionSink> = Arc::new(ExecutionSink { execution: weak.clone() });
            let state = ExecutionState::new(&services, run, definition, principal, sink);
            let (phase, _) = watch::channel(ExecutionPhase::Running);
            FlowExecution {
                run_id: state.run.id,
                job: job.to_string(),
                mode,
                log: state.log.clone(),
                state: Mutex::new(state),
                services: Arc::clone(&services),
                phase,
                inflight: AtomicUsize::new(0),
                handle,
            }
        });

        tracing::info!(run = %execution.run_id, job, "run started");
        services.bus.emit(ExecutionEvent::RunStarted {
            run_id: execution.run_id,
            job: job.to_string(),
            timestamp: Utc::now(),
        });

        let driver = Arc::clone(&execution);
        execution.schedule(async move {
            let mut state = driver.state.lock().await;
            let driven = state.run_until_blocked(&driver.services).await;
            if let Err(e) = driver.settle(&mut state, driven).await {
                tracing::error!(run = %driver.run_id, error = %e, "run could not settle");
            }
        });
        Ok(execution)
    }

    /// Rebuild a run from its checkpoint and bring every pending step back
    /// to life. Completes before returning; the run is settled again
    /// afterwards.
    pub(crate) async fn resume(services: Arc<EngineServices>, checkpoint: Checkpoint) -> Result<Arc<Self>, FlowError> {
        let handle = current_handle()?;
        let run_id = checkpoint.run.id;
        if checkpoint.is_terminal() {
            return Err(ResumeError::Inconsistent {
                run: run_id,
                reason: format!("run already finished with {}", checkpoint.run.status),
            }
            .into());
        }
        verify_checkpoint(&checkpoint)?;

        let (principal, changed) = reresolve_principal(
            services.identity.as_ref(),
            services.identity_policy,
            &checkpoint.run.job,
            &checkpoint.principal,
        );
        if changed {
            tracing::warn!(
                run = %run_id,
                job = %checkpoint.run.job,
                before = %checkpoint.principal,
                after = %principal,
                "run identity changed across restart"
            );
        }

        let job = checkpoint.run.job.clone();
        let mode = checkpoint.definition.mode;
        let mut records = Vec::new();
        let execution = Arc::new_cyclic(|weak: &Weak<FlowExecution>| {
            let sink: Arc<dyn CompletionSink> = Arc::new(ExecutionSink { execution: weak.clone() });
            let (state, pending) = ExecutionState::from_checkpoint(checkpoint, principal, sink);
            records = pending;
            let (phase, _) = watch::channel(ExecutionPhase::Running);
            FlowExecution {
                run_id,
                job,
                mode,
                log: state.log.clone(),
                state: Mutex::new(state),
                services: Arc::clone(&services),
                phase,
                inflight: AtomicUsize::new(0),
                handle,
            }
        });

        let mut state = execution.state.lock().await;
        let mut restored = Ok(());
        for record in records {
            if let Err(e) = state.restore_pending(&services, record) {
                restored = Err(e);
                break;
            }
        }
        if let Err(e) = restored {
            for step_id in state.pending.keys() {
                services.pending.remove(step_id);
            }
            return Err(e);
        }

        tracing::info!(run = %run_id, pending = state.pending.len(), "run resumed");
        services.bus.emit(ExecutionEvent::RunResumed {
            run_id,
            timestamp: Utc::now(),
        });
        let driven = state.run_until_blocked(&services).await;
        execution.settle(&mut state, driven).await?;
        drop(state);
        Ok(execution)
    }

    fn schedule<F>(self: &Arc<Self>, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        self.handle.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(run = %this.run_id, panic = %message, "advance panicked; halting run");
                let mut state = this.state.lock().await;
                this.halt(&mut state, FlowError::Execution(format!("advance panicked: {message}")));
            }
            this.inflight.fetch_sub(1, Ordering::SeqCst);
            this.phase.send_modify(|_| {});
        });
    }

    fn schedule_advance(self: &Arc<Self>, step_id: StepExecutionId, outcome: StepOutcome) {
        let this = Arc::clone(self);
        self.schedule(async move {
            match this.advance(step_id, outcome).await {
                Ok(()) => {}
                Err(FlowError::AlreadyCompleted(e)) => {
                    tracing::warn!(run = %this.run_id, "{e}; completion ignored");
                }
                Err(e) => tracing::error!(run = %this.run_id, error = %e, "advance failed"),
            }
        });
    }

    /// Apply a step's result and run until the next suspension point.
    ///
    /// The only path by which a pending step's result changes the run.
    /// Completions for steps that are not pending (already completed,
    /// aborted, or unknown) are rejected with `AlreadyCompleted`.
    pub async fn advance(&self, step_id: StepExecutionId, outcome: StepOutcome) -> Result<(), FlowError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.halted {
            return Err(FlowError::Execution(format!("run {} is halted: {reason}", self.run_id)));
        }
        state.complete_step(&self.services, step_id, outcome)?;
        let driven = state.run_until_blocked(&self.services).await;
        self.settle(&mut state, driven).await
    }

    /// Abort the run: every pending step is stopped and fails with an
    /// abort, which no retry or try block intercepts.
    pub async fn abort(&self, reason: &str) -> Result<RunStatus, FlowError> {
        let mut state = self.state.lock().await;
        if let Some(status) = state.finished() {
            return Ok(status);
        }
        if let Some(reason) = &state.halted {
            return Err(FlowError::Execution(format!("run {} is halted: {reason}", self.run_id)));
        }
        tracing::info!(run = %self.run_id, reason, "aborting run");
        let driven = match state.abort_pending(&self.services, reason) {
            Ok(_) => state.run_until_blocked(&self.services).await,
            Err(e) => Err(e),
        };
        self.settle(&mut state, driven).await?;
        Ok(state.run.status)
    }

    /// Persist and publish the state reached after an advance.
    async fn settle(&self, state: &mut ExecutionState, driven: Result<(), FlowError>) -> Result<(), FlowError> {
        if let Err(e) = driven {
            return Err(self.halt(state, e));
        }
        if state.mode() == DefinitionMode::Full {
            if let Err(e) = self.services.store.save(&state.checkpoint()).await {
                tracing::error!(run = %self.run_id, error = %e, "checkpoint failed; halting run");
                return Err(self.halt(state, e.into()));
            }
            tracing::debug!(run = %self.run_id, "checkpoint saved");
        }

        let phase = match state.finished() {
            Some(status) => ExecutionPhase::Completed(status),
            None => {
                let pending = state.pending.len();
                self.services.bus.emit(ExecutionEvent::RunSuspended {
                    run_id: self.run_id,
                    pending_steps: pending,
                    timestamp: Utc::now(),
                });
                ExecutionPhase::Suspended { pending }
            }
        };
        self.phase.send_replace(phase);
        Ok(())
    }

    fn halt(&self, state: &mut ExecutionState, error: FlowError) -> FlowError {
        let reason = error.to_string();
        for (step_id, entry) in std::mem::take(&mut state.pending) {
            self.services.pending.remove(&step_id);
            entry.ctx.completion.revoke();
            entry.ctx.cancellation.cancel();
        }
        state.halted = Some(reason.clone());
        self.phase.send_replace(ExecutionPhase::Halted(reason));
        error
    }

    /// Wait until no scheduled advance is outstanding and return the
    /// phase the run settled in.
    pub async fn wait_until_settled(&self) -> ExecutionPhase {
        let mut rx = self.phase.subscribe();
        loop {
            if self.inflight.load(Ordering::SeqCst) == 0 {
                let phase = rx.borrow_and_update().clone();
                if phase.is_settled() {
                    return phase;
                }
            }
            if rx.changed().await.is_err() {
                return self.phase.borrow().clone();
            }
        }
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait_for_completion(&self) -> Result<RunStatus, FlowError> {
        let mut rx = self.phase.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                ExecutionPhase::Completed(status) => return Ok(status),
                ExecutionPhase::Halted(reason) => return Err(FlowError::Execution(reason)),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(FlowError::Execution(format!("run {} was dropped", self.run_id)));
            }
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn mode(&self) -> DefinitionMode {
        self.mode
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase.borrow().clone()
    }

    /// Output so far. Readable while the run is mid-execution.
    pub fn log(&self) -> RunLog {
        self.log.clone()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.lock().await.run.status
    }

    pub async fn record(&self) -> RunRecord {
        self.state.lock().await.run.clone()
    }

    pub async fn graph(&self) -> FlowGraph {
        self.state.lock().await.graph.clone()
    }

    pub async fn variables(&self) -> BTreeMap<String, Value> {
        self.state.lock().await.vars.clone()
    }

    pub async fn variable(&self, name: &str) -> Option<Value> {
        self.state.lock().await.vars.get(name).cloned()
    }

    pub async fn env_overrides(&self) -> EnvMap {
        self.state.lock().await.env_overrides.clone()
    }

    pub async fn pending_steps(&self) -> Vec<StepExecutionId> {
        self.state.lock().await.pending.keys().copied().collect()
    }

    /// Identity of the run, or of the scope around a pending step.
    pub async fn current_identity(&self, step: Option<StepExecutionId>) -> Principal {
        let state = self.state.lock().await;
        match step.and_then(|id| state.thread_of(id)) {
            Some(thread) => state.identity_for(thread),
            None => state.principal.clone(),
        }
    }

    /// Environment of the run, or as seen by a pending step.
    pub async fn environment(&self, step: Option<StepExecutionId>) -> EnvironmentOverlay {
        let state = self.state.lock().await;
        let thread = step.and_then(|id| state.thread_of(id)).unwrap_or(0);
        state.overlay_for(&self.services, thread)
    }

    pub async fn checkpoint(&self) -> Checkpoint {
        self.state.lock().await.checkpoint()
    }
}
