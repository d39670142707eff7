//! Resumable interpreter.
//!
//! A run is a set of threads, each with an explicit frame stack and a
//! pending signal. Nothing lives on the native call stack between
//! signals, so the whole state can be checkpointed whenever every thread
//! is waiting, joining or finished.

use crate::checkpoint::{
    BlockOutcome, Checkpoint, Frame, PendingRecord, Scope, Signal, ThreadId, ThreadState, ThreadStatus,
    CHECKPOINT_VERSION,
};
use crate::expr::Evaluator;
use crate::pending::PendingEntry;
use crate::runtime::EngineServices;
use chrono::Utc;
use flowcore::identity::current_identity;
use flowcore::{
    AlreadyCompletedError, CompletionHandle, CompletionSink, Construct, ConstructPath, ContextService, Definition,
    DefinitionMode, EnvMap, EnvironmentOverlay, ExecutionEvent, Expr, FlowError, FlowGraph, FlowNodeId,
    FlowNodeKind, Principal, ResultCell, ResumeError, RunLog, RunRecord, RunStatus, StepCall, StepContext,
    StepExecutionId, StepFailure, StepOutcome, StepStart, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ROOT_THREAD: ThreadId = 0;

/// Mutable state of one run, guarded by its execution's mutex.
pub(crate) struct ExecutionState {
    pub run: RunRecord,
    pub definition: Arc<Definition>,
    pub graph: FlowGraph,
    pub threads: BTreeMap<ThreadId, ThreadState>,
    pub next_thread: ThreadId,
    pub pending: BTreeMap<StepExecutionId, Arc<PendingEntry>>,
    pub env_overrides: EnvMap,
    pub vars: BTreeMap<String, Value>,
    pub principal: Principal,
    pub result: ResultCell,
    pub log: RunLog,
    /// Set when a checkpoint could not be written or the state turned out
    /// inconsistent; the run accepts no further work.
    pub halted: Option<String>,
    sink: Arc<dyn CompletionSink>,
}

fn inconsistent(run: &RunRecord, reason: impl Into<String>) -> FlowError {
    FlowError::Execution(format!("run {} is inconsistent: {}", run.id, reason.into()))
}

impl ExecutionState {
    /// Fresh run: appends the start node and parks the root thread on the
    /// definition body.
    pub fn new(
        services: &EngineServices,
        run: RunRecord,
        definition: Arc<Definition>,
        principal: Principal,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let mut state = Self {
            run,
            definition,
            graph: FlowGraph::new(),
            threads: BTreeMap::new(),
            next_thread: ROOT_THREAD + 1,
            pending: BTreeMap::new(),
            env_overrides: EnvMap::new(),
            vars: BTreeMap::new(),
            principal,
            result: ResultCell::default(),
            log: RunLog::new(),
            halted: None,
            sink,
        };
        let start = state.append(services, FlowNodeKind::Start, Vec::new(), "Start", None);
        state.threads.insert(
            ROOT_THREAD,
            ThreadState {
                id: ROOT_THREAD,
                parent: None,
                head: start,
                frames: Vec::new(),
                status: ThreadStatus::Runnable {
                    signal: Signal::Enter {
                        path: ConstructPath::root(),
                    },
                },
            },
        );
        state
    }

    /// Rebuild from a checkpoint. Pending steps are returned separately;
    /// they must be restored through `restore_pending` before the run can
    /// advance.
    pub fn from_checkpoint(
        checkpoint: Checkpoint,
        principal: Principal,
        sink: Arc<dyn CompletionSink>,
    ) -> (Self, Vec<PendingRecord>) {
        let state = Self {
            run: checkpoint.run,
            definition: Arc::new(checkpoint.definition),
            graph: checkpoint.graph,
            threads: checkpoint.threads.into_iter().map(|t| (t.id, t)).collect(),
            next_thread: checkpoint.next_thread,
            pending: BTreeMap::new(),
            env_overrides: checkpoint.env_overrides,
            vars: checkpoint.vars,
            principal,
            result: ResultCell::new(checkpoint.result),
            log: RunLog::from_lines(checkpoint.log),
            halted: None,
            sink,
        };
        (state, checkpoint.pending)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            run: self.run.clone(),
            definition: (*self.definition).clone(),
            graph: self.graph.clone(),
            threads: self.threads.values().cloned().collect(),
            next_thread: self.next_thread,
            pending: self
                .pending
                .values()
                .map(|entry| PendingRecord {
                    id: entry.step_id,
                    kind: entry.kind.clone(),
                    thread: entry.thread,
                    node: entry.node_id,
                    args: entry.args.clone(),
                    bind: entry.bind.clone(),
                    saved: entry.save(),
                    since: entry.since,
                })
                .collect(),
            env_overrides: self.env_overrides.clone(),
            vars: self.vars.clone(),
            principal: self.principal.clone(),
            result: self.result.get(),
            log: self.log.lines(),
            saved_at: Utc::now(),
        }
    }

    pub fn mode(&self) -> DefinitionMode {
        self.definition.mode
    }

    pub fn finished(&self) -> Option<RunStatus> {
        self.run.status.is_terminal().then_some(self.run.status)
    }

    // ---- context derivation ----

    /// Scopes opened around `thread`, outermost first, including those of
    /// the threads it was forked from.
    fn scopes(&self, thread: ThreadId) -> Vec<&Scope> {
        let mut chain = Vec::new();
        let mut current = Some(thread);
        while let Some(id) = current {
            match self.threads.get(&id) {
                Some(t) => {
                    chain.push(t);
                    current = t.parent;
                }
                None => break,
            }
        }
        chain
            .into_iter()
            .rev()
            .flat_map(|t| t.frames.iter().filter_map(Frame::scope))
            .collect()
    }

    pub fn overlay_for(&self, services: &EngineServices, thread: ThreadId) -> EnvironmentOverlay {
        let scopes = self.scopes(thread);
        let blocks: Vec<&EnvMap> = scopes
            .iter()
            .filter_map(|s| match s {
                Scope::Env { vars } => Some(vars),
                _ => None,
            })
            .collect();
        let agent = scopes.iter().rev().find_map(|s| match s {
            Scope::Agent { label, env } => Some((label.as_str(), env)),
            _ => None,
        });
        EnvironmentOverlay::compose(&services.ambient, agent, &self.env_overrides, &blocks)
    }

    pub fn identity_for(&self, thread: ThreadId) -> Principal {
        let scopes = self.scopes(thread);
        let principals: Vec<&Principal> = scopes
            .iter()
            .filter_map(|s| match s {
                Scope::Identity { principal } => Some(principal),
                _ => None,
            })
            .collect();
        current_identity(&self.principal, &principals)
    }

    fn agent_for(&self, thread: ThreadId) -> Option<String> {
        self.scopes(thread).iter().rev().find_map(|s| match s {
            Scope::Agent { label, .. } => Some(label.clone()),
            _ => None,
        })
    }

    fn context_for(
        &self,
        services: &EngineServices,
        thread: ThreadId,
        step_id: StepExecutionId,
        node_id: FlowNodeId,
        args: BTreeMap<String, Value>,
    ) -> StepContext {
        StepContext {
            run_id: self.run.id,
            step_id,
            node_id,
            args,
            env: self.overlay_for(services, thread),
            identity: self.identity_for(thread),
            agent: self.agent_for(thread),
            listener: services.bus.create_listener(self.run.id, Some(node_id), self.log.clone()),
            result: self.result.clone(),
            completion: CompletionHandle::new(step_id, Arc::clone(&self.sink)),
            cancellation: CancellationToken::new(),
        }
    }

    fn evaluate(&self, services: &EngineServices, thread: ThreadId, expr: &Expr) -> Result<Value, StepFailure> {
        let overlay = self.overlay_for(services, thread);
        Evaluator::new(&self.vars, &overlay).eval(expr)
    }

    // ---- graph ----

    fn append(
        &mut self,
        services: &EngineServices,
        kind: FlowNodeKind,
        parents: Vec<FlowNodeId>,
        label: impl Into<String>,
        error: Option<StepFailure>,
    ) -> FlowNodeId {
        let id = self.graph.append(kind, parents, label);
        if let Some(failure) = error {
            self.graph.attach_error(id, failure);
        }
        if let Some(node) = self.graph.node(id) {
            tracing::debug!(run = %self.run.id, node = id, label = %node.label, "flow node appended");
            services.listeners.notify(self.run.id, node);
        }
        id
    }

    fn println(&self, services: &EngineServices, node: FlowNodeId, text: impl Into<String>) {
        services
            .bus
            .create_listener(self.run.id, Some(node), self.log.clone())
            .println(text);
    }

    fn thread(&self, id: ThreadId) -> Result<&ThreadState, FlowError> {
        self.threads
            .get(&id)
            .ok_or_else(|| inconsistent(&self.run, format!("thread {id} does not exist")))
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut ThreadState, FlowError> {
        match self.threads.get_mut(&id) {
            Some(thread) => Ok(thread),
            None => Err(inconsistent(&self.run, format!("thread {id} does not exist"))),
        }
    }

    fn set_status(&mut self, id: ThreadId, status: ThreadStatus) -> Result<(), FlowError> {
        self.thread_mut(id)?.status = status;
        Ok(())
    }

    fn enter_next(&mut self, id: ThreadId, path: ConstructPath) -> Result<(), FlowError> {
        self.set_status(
            id,
            ThreadStatus::Runnable {
                signal: Signal::Enter { path },
            },
        )
    }

    fn return_with(&mut self, id: ThreadId, outcome: BlockOutcome) -> Result<(), FlowError> {
        self.set_status(
            id,
            ThreadStatus::Runnable {
                signal: Signal::Return { outcome },
            },
        )
    }

    fn open_block(&mut self, services: &EngineServices, thread: ThreadId, block: &str, label: String) -> Result<FlowNodeId, FlowError> {
        let head = self.thread(thread)?.head;
        let start = self.append(services, FlowNodeKind::BlockStart { block: block.to_string() }, vec![head], label, None);
        self.thread_mut(thread)?.head = start;
        Ok(start)
    }

    fn close_block(
        &mut self,
        services: &EngineServices,
        thread: ThreadId,
        start: FlowNodeId,
        outcome: &BlockOutcome,
    ) -> Result<FlowNodeId, FlowError> {
        let head = self.thread(thread)?.head;
        let label = self.graph.node(start).map(|n| n.label.clone()).unwrap_or_default();
        let end = self.append(
            services,
            FlowNodeKind::BlockEnd { start },
            vec![head],
            label,
            outcome.as_ref().err().cloned(),
        );
        self.thread_mut(thread)?.head = end;
        Ok(end)
    }

    // ---- interpreter ----

    /// Process signals until every thread is waiting, joining or finished.
    pub async fn run_until_blocked(&mut self, services: &EngineServices) -> Result<(), FlowError> {
        while let Some((id, signal)) = self.next_runnable() {
            match signal {
                Signal::Enter { path } => self.enter(services, id, path).await?,
                Signal::Return { outcome } => self.unwind(services, id, outcome)?,
            }
        }
        Ok(())
    }

    fn next_runnable(&self) -> Option<(ThreadId, Signal)> {
        self.threads.values().find_map(|t| match &t.status {
            ThreadStatus::Runnable { signal } => Some((t.id, signal.clone())),
            _ => None,
        })
    }

    async fn enter(&mut self, services: &EngineServices, thread: ThreadId, path: ConstructPath) -> Result<(), FlowError> {
        let definition = Arc::clone(&self.definition);
        let construct = definition
            .construct_at(&path)
            .ok_or_else(|| inconsistent(&self.run, format!("no construct at {path}")))?;

        match construct {
            Construct::Sequence(items) => {
                if items.is_empty() {
                    return self.return_with(thread, Ok(()));
                }
                self.thread_mut(thread)?.frames.push(Frame::Sequence {
                    path: path.clone(),
                    next: 1,
                });
                self.enter_next(thread, path.child(0))
            }
            Construct::Step(call) => self.start_step(services, thread, call).await,
            Construct::SetVar { name, value } => match self.evaluate(services, thread, value) {
                Ok(value) => {
                    self.vars.insert(name.clone(), value);
                    self.return_with(thread, Ok(()))
                }
                Err(failure) => self.return_with(thread, Err(failure)),
            },
            Construct::SetEnv { key, value } => match self.evaluate(services, thread, value) {
                Ok(value) => {
                    self.env_overrides.insert(key.clone(), value.to_string());
                    self.return_with(thread, Ok(()))
                }
                Err(failure) => self.return_with(thread, Err(failure)),
            },
            Construct::If { cond, otherwise, .. } => match self.evaluate(services, thread, cond) {
                Ok(value) if value.truthy() => self.enter_next(thread, path.child(0)),
                Ok(_) if otherwise.is_some() => self.enter_next(thread, path.child(1)),
                Ok(_) => self.return_with(thread, Ok(())),
                Err(failure) => self.return_with(thread, Err(failure)),
            },
            Construct::Retry { attempts, .. } => {
                let start = self.open_block(services, thread, "retry", format!("retry({attempts})"))?;
                self.thread_mut(thread)?.frames.push(Frame::Retry {
                    path: path.clone(),
                    start,
                    attempt: 1,
                    attempts: *attempts,
                });
                self.enter_next(thread, path.child(0))
            }
            Construct::Try { .. } => {
                let start = self.open_block(services, thread, "try", "try".to_string())?;
                self.thread_mut(thread)?.frames.push(Frame::Try {
                    path: path.clone(),
                    start,
                    catching: false,
                });
                self.enter_next(thread, path.child(0))
            }
            Construct::WithEnv { vars, .. } => {
                let start = self.open_block(services, thread, "with_env", "with_env".to_string())?;
                let overlay = self.overlay_for(services, thread);
                let evaluator = Evaluator::new(&self.vars, &overlay);
                let scope = vars
                    .iter()
                    .map(|(key, expr)| evaluator.eval_string(expr).map(|v| (key.clone(), v)))
                    .collect::<Result<EnvMap, StepFailure>>()
                    .map(|vars| Scope::Env { vars });
                self.enter_scope(services, thread, path, start, scope)
            }
            Construct::Node { label, .. } => {
                let start = self.open_block(services, thread, "node", format!("node ({label})"))?;
                let scope = services.agents.environment(label).map(|env| Scope::Agent {
                    label: label.clone(),
                    env,
                });
                if scope.is_ok() {
                    self.println(services, start, format!("Running on {label}"));
                }
                self.enter_scope(services, thread, path, start, scope)
            }
            Construct::AsIdentity { principal, .. } => {
                let start = self.open_block(services, thread, "as_identity", format!("as_identity ({principal})"))?;
                let scope = Ok(Scope::Identity {
                    principal: Principal::new(principal.clone()),
                });
                self.enter_scope(services, thread, path, start, scope)
            }
            Construct::Parallel(branches) => {
                let start = self.open_block(services, thread, "parallel", "parallel".to_string())?;
                let mut ids = Vec::with_capacity(branches.len());
                for (index, branch) in branches.iter().enumerate() {
                    let branch_start = self.append(
                        services,
                        FlowNodeKind::BlockStart {
                            block: "branch".to_string(),
                        },
                        vec![start],
                        format!("Branch: {}", branch.name),
                        None,
                    );
                    let id = self.next_thread;
                    self.next_thread += 1;
                    self.threads.insert(
                        id,
                        ThreadState {
                            id,
                            parent: Some(thread),
                            head: branch_start,
                            frames: vec![Frame::Branch { start: branch_start }],
                            status: ThreadStatus::Runnable {
                                signal: Signal::Enter {
                                    path: path.child(index),
                                },
                            },
                        },
                    );
                    ids.push(id);
                }
                let parent = self.thread_mut(thread)?;
                parent.frames.push(Frame::Parallel {
                    path,
                    start,
                    branches: ids,
                });
                parent.status = ThreadStatus::Joining;
                Ok(())
            }
        }
    }

    fn enter_scope(
        &mut self,
        services: &EngineServices,
        thread: ThreadId,
        path: ConstructPath,
        start: FlowNodeId,
        scope: Result<Scope, StepFailure>,
    ) -> Result<(), FlowError> {
        match scope {
            Ok(scope) => {
                self.thread_mut(thread)?.frames.push(Frame::Scope {
                    path: path.clone(),
                    start,
                    scope,
                });
                self.enter_next(thread, path.child(0))
            }
            Err(failure) => {
                let outcome = Err(failure);
                self.close_block(services, thread, start, &outcome)?;
                self.return_with(thread, outcome)
            }
        }
    }

    async fn start_step(&mut self, services: &EngineServices, thread: ThreadId, call: &StepCall) -> Result<(), FlowError> {
        let args = {
            let overlay = self.overlay_for(services, thread);
            let evaluator = Evaluator::new(&self.vars, &overlay);
            call.args
                .iter()
                .map(|(key, expr)| evaluator.eval(expr).map(|v| (key.clone(), v)))
                .collect::<Result<BTreeMap<String, Value>, StepFailure>>()
        };

        let head = self.thread(thread)?.head;
        let node_id = self.append(
            services,
            FlowNodeKind::Atom {
                step: call.name.clone(),
            },
            vec![head],
            call.name.clone(),
            None,
        );
        self.thread_mut(thread)?.head = node_id;

        let args = match args {
            Ok(args) => args,
            Err(failure) => return self.step_finished(services, thread, node_id, None, Err(failure)),
        };
        let Some(descriptor) = services.registry.get(&call.name) else {
            let failure = StepFailure::new(format!("Unknown step: {}", call.name));
            return self.step_finished(services, thread, node_id, None, Err(failure));
        };
        if descriptor.required_context().contains(&ContextService::Agent) && self.agent_for(thread).is_none() {
            let failure = StepFailure::new(format!("{} must run inside a node block", call.name));
            return self.step_finished(services, thread, node_id, None, Err(failure));
        }
        let mut execution = match descriptor.create(&args) {
            Ok(execution) => execution,
            Err(failure) => return self.step_finished(services, thread, node_id, None, Err(failure)),
        };

        let step_id = Uuid::new_v4();
        let ctx = self.context_for(services, thread, step_id, node_id, args.clone());
        services.bus.emit(ExecutionEvent::StepStarted {
            run_id: self.run.id,
            step_id,
            node_id,
            step: call.name.clone(),
            timestamp: Utc::now(),
        });

        match execution.start(&ctx).await {
            Ok(StepStart::Sync(value)) => {
                ctx.completion.revoke();
                self.step_finished(services, thread, node_id, call.bind.clone(), Ok(value))
            }
            Ok(StepStart::Pending) if self.mode() == DefinitionMode::Restricted => {
                let failure = StepFailure::new(format!(
                    "{} cannot wait for completion in restricted mode",
                    call.name
                ));
                ctx.completion.revoke();
                ctx.cancellation.cancel();
                execution.stop(&ctx, &failure);
                self.step_finished(services, thread, node_id, None, Err(failure))
            }
            Ok(StepStart::Pending) => {
                tracing::debug!(run = %self.run.id, step = %step_id, kind = %call.name, "step pending");
                let entry = Arc::new(PendingEntry::new(
                    call.name.clone(),
                    thread,
                    args,
                    call.bind.clone(),
                    Utc::now(),
                    ctx,
                    execution,
                ));
                self.pending.insert(step_id, Arc::clone(&entry));
                services.pending.insert(entry);
                self.set_status(thread, ThreadStatus::Waiting { step: step_id })
            }
            Err(failure) => {
                ctx.completion.revoke();
                self.step_finished(services, thread, node_id, None, Err(failure))
            }
        }
    }

    /// Record a step's result on its node and resume its thread.
    fn step_finished(
        &mut self,
        services: &EngineServices,
        thread: ThreadId,
        node_id: FlowNodeId,
        bind: Option<String>,
        outcome: StepOutcome,
    ) -> Result<(), FlowError> {
        match outcome {
            Ok(value) => {
                if let Some(name) = bind {
                    self.vars.insert(name, value);
                }
                services.bus.emit(ExecutionEvent::StepCompleted {
                    run_id: self.run.id,
                    node_id,
                    timestamp: Utc::now(),
                });
                self.return_with(thread, Ok(()))
            }
            Err(failure) => {
                self.graph.attach_error(node_id, failure.clone());
                self.println(services, node_id, format!("ERROR: {}", failure.message));
                services.bus.emit(ExecutionEvent::StepFailed {
                    run_id: self.run.id,
                    node_id,
                    error: failure.message.clone(),
                    timestamp: Utc::now(),
                });
                self.return_with(thread, Err(failure))
            }
        }
    }

    fn unwind(&mut self, services: &EngineServices, thread: ThreadId, outcome: BlockOutcome) -> Result<(), FlowError> {
        let frame = self.thread_mut(thread)?.frames.pop();
        let Some(frame) = frame else {
            if self.thread(thread)?.parent.is_some() {
                return Err(inconsistent(&self.run, format!("branch thread {thread} lost its frame")));
            }
            return self.finish(services, thread, outcome);
        };

        match frame {
            Frame::Sequence { path, next } => {
                let len = match self.definition.construct_at(&path) {
                    Some(Construct::Sequence(items)) => items.len(),
                    _ => return Err(inconsistent(&self.run, format!("no sequence at {path}"))),
                };
                if outcome.is_ok() && next < len {
                    self.thread_mut(thread)?.frames.push(Frame::Sequence {
                        path: path.clone(),
                        next: next + 1,
                    });
                    return self.enter_next(thread, path.child(next));
                }
                self.return_with(thread, outcome)
            }
            Frame::Retry {
                path,
                start,
                attempt,
                attempts,
            } => match outcome {
                Err(failure) if !failure.is_abort() && attempt < attempts => {
                    let head = self.thread(thread)?.head;
                    self.println(services, head, "Retrying");
                    tracing::debug!(run = %self.run.id, attempt = attempt + 1, attempts, "retrying block");
                    self.thread_mut(thread)?.frames.push(Frame::Retry {
                        path: path.clone(),
                        start,
                        attempt: attempt + 1,
                        attempts,
                    });
                    self.enter_next(thread, path.child(0))
                }
                outcome => {
                    self.close_block(services, thread, start, &outcome)?;
                    self.return_with(thread, outcome)
                }
            },
            Frame::Try {
                path,
                start,
                catching: false,
            } if matches!(&outcome, Err(f) if !f.is_abort()) => {
                if let (Some(Construct::Try { bind: Some(name), .. }), Err(failure)) =
                    (self.definition.construct_at(&path), &outcome)
                {
                    self.vars.insert(name.clone(), Value::String(failure.message.clone()));
                }
                self.thread_mut(thread)?.frames.push(Frame::Try {
                    path: path.clone(),
                    start,
                    catching: true,
                });
                self.enter_next(thread, path.child(1))
            }
            Frame::Try { start, .. } | Frame::Scope { start, .. } => {
                self.close_block(services, thread, start, &outcome)?;
                self.return_with(thread, outcome)
            }
            Frame::Branch { start } => {
                self.close_block(services, thread, start, &outcome)?;
                let parent = self.thread(thread)?.parent;
                self.set_status(thread, ThreadStatus::Finished { outcome })?;
                match parent {
                    Some(parent) => self.try_join(services, parent),
                    None => Err(inconsistent(&self.run, "branch frame on the root thread")),
                }
            }
            Frame::Parallel { .. } => Err(inconsistent(&self.run, "parallel block resumed before its join")),
        }
    }

    /// Close a parallel block once every branch has finished. The join
    /// node's parents are the heads of all branches.
    fn try_join(&mut self, services: &EngineServices, parent: ThreadId) -> Result<(), FlowError> {
        let (start, branches) = match self.thread(parent)?.frames.last() {
            Some(Frame::Parallel { start, branches, .. }) => (*start, branches.clone()),
            _ => return Err(inconsistent(&self.run, format!("thread {parent} is not joining"))),
        };
        let all_finished = branches.iter().all(|id| {
            matches!(
                self.threads.get(id).map(|t| &t.status),
                Some(ThreadStatus::Finished { .. })
            )
        });
        if !all_finished {
            return Ok(());
        }

        let mut heads = Vec::with_capacity(branches.len());
        let mut failures = Vec::new();
        for id in &branches {
            if let Some(branch) = self.threads.remove(id) {
                heads.push(branch.head);
                if let ThreadStatus::Finished { outcome: Err(failure) } = branch.status {
                    failures.push(failure);
                }
            }
        }
        // An abort outranks ordinary failures; otherwise declared order.
        let outcome = match failures.iter().position(StepFailure::is_abort) {
            Some(index) => Err(failures.swap_remove(index)),
            None if !failures.is_empty() => Err(failures.remove(0)),
            None => Ok(()),
        };

        let label = self.graph.node(start).map(|n| n.label.clone()).unwrap_or_default();
        let end = self.append(
            services,
            FlowNodeKind::BlockEnd { start },
            heads,
            label,
            outcome.as_ref().err().cloned(),
        );
        let thread = self.thread_mut(parent)?;
        thread.head = end;
        thread.frames.pop();
        thread.status = ThreadStatus::Runnable {
            signal: Signal::Return { outcome },
        };
        Ok(())
    }

    fn finish(&mut self, services: &EngineServices, thread: ThreadId, outcome: BlockOutcome) -> Result<(), FlowError> {
        let body = match &outcome {
            Ok(()) => RunStatus::Success,
            Err(failure) if failure.is_abort() => RunStatus::Aborted,
            Err(_) => RunStatus::Failure,
        };
        let status = self.result.mark(body);
        let head = self.thread(thread)?.head;
        let end = self.append(
            services,
            FlowNodeKind::End,
            vec![head],
            "End",
            outcome.as_ref().err().cloned(),
        );
        self.println(services, end, format!("Finished: {status}"));

        let finished_at = Utc::now();
        self.run.status = status;
        self.run.finished_at = Some(finished_at);
        let state = self.thread_mut(thread)?;
        state.head = end;
        state.status = ThreadStatus::Finished { outcome };

        let duration_ms = (finished_at - self.run.started_at).num_milliseconds().max(0) as u64;
        tracing::info!(run = %self.run.id, job = %self.run.job, %status, duration_ms, "run finished");
        services.bus.emit(ExecutionEvent::RunCompleted {
            run_id: self.run.id,
            status,
            duration_ms,
            timestamp: finished_at,
        });
        Ok(())
    }

    // ---- external inputs ----

    /// Apply a completion delivered for a pending step.
    pub fn complete_step(
        &mut self,
        services: &EngineServices,
        step_id: StepExecutionId,
        outcome: StepOutcome,
    ) -> Result<(), FlowError> {
        let entry = self
            .pending
            .remove(&step_id)
            .ok_or(AlreadyCompletedError(step_id))?;
        services.pending.remove(&step_id);
        entry.ctx.completion.revoke();
        entry.ctx.cancellation.cancel();
        self.step_finished(services, entry.thread, entry.node_id, entry.bind.clone(), outcome)
    }

    /// Stop every pending step and fail it with an abort.
    pub fn abort_pending(&mut self, services: &EngineServices, reason: &str) -> Result<usize, FlowError> {
        let failure = StepFailure::aborted(reason);
        let mut entries: Vec<Arc<PendingEntry>> = std::mem::take(&mut self.pending).into_values().collect();
        entries.sort_by_key(|entry| entry.thread);
        let count = entries.len();
        for entry in entries {
            services.pending.remove(&entry.step_id);
            entry.ctx.completion.revoke();
            entry.ctx.cancellation.cancel();
            entry.with_execution(|exec, ctx| exec.stop(ctx, &failure));
            self.step_finished(services, entry.thread, entry.node_id, None, Err(failure.clone()))?;
        }
        Ok(count)
    }

    /// Rebuild one pending step after a restart. The step is registered
    /// only once `on_resume` succeeded; a failing `on_resume` fails the
    /// step instead.
    pub fn restore_pending(&mut self, services: &EngineServices, record: PendingRecord) -> Result<(), FlowError> {
        let descriptor = services
            .registry
            .get(&record.kind)
            .ok_or_else(|| ResumeError::UnknownStepKind {
                run: self.run.id,
                kind: record.kind.clone(),
            })?;
        let mut execution = descriptor
            .restore(record.saved.clone())
            .map_err(|reason| ResumeError::Corrupt {
                run: self.run.id,
                reason: format!("step {} ({}): {reason}", record.id, record.kind),
            })?;
        let ctx = self.context_for(services, record.thread, record.id, record.node, record.args.clone());

        match execution.on_resume(&ctx) {
            Ok(()) => {
                let entry = Arc::new(PendingEntry::new(
                    record.kind,
                    record.thread,
                    record.args,
                    record.bind,
                    record.since,
                    ctx,
                    execution,
                ));
                self.pending.insert(record.id, Arc::clone(&entry));
                services.pending.insert(entry);
                Ok(())
            }
            Err(failure) => {
                ctx.completion.revoke();
                self.step_finished(services, record.thread, record.node, None, Err(failure))
            }
        }
    }

    /// Thread a pending step is waiting on, if the step is still pending.
    pub fn thread_of(&self, step_id: StepExecutionId) -> Option<ThreadId> {
        self.pending.get(&step_id).map(|entry| entry.thread)
    }
}

/// Structural checks on a checkpoint before anything is rebuilt from it.
pub(crate) fn verify_checkpoint(checkpoint: &Checkpoint) -> Result<(), ResumeError> {
    let run = checkpoint.run.id;
    let bad = |reason: String| ResumeError::Inconsistent { run, reason };

    checkpoint.graph.verify().map_err(bad)?;
    if !checkpoint.threads.iter().any(|t| t.id == ROOT_THREAD && t.parent.is_none()) {
        return Err(bad("root thread missing".into()));
    }
    for thread in &checkpoint.threads {
        if checkpoint.graph.node(thread.head).is_none() {
            return Err(bad(format!("thread {} head {} not in graph", thread.id, thread.head)));
        }
        match &thread.status {
            ThreadStatus::Runnable { .. } => {
                return Err(bad(format!("thread {} was saved mid-step", thread.id)));
            }
            ThreadStatus::Waiting { step } => {
                if !checkpoint.pending.iter().any(|p| p.id == *step && p.thread == thread.id) {
                    return Err(bad(format!("thread {} waits on unknown step {}", thread.id, step)));
                }
            }
            ThreadStatus::Joining | ThreadStatus::Finished { .. } => {}
        }
    }
    for record in &checkpoint.pending {
        let waiting = checkpoint.threads.iter().any(|t| {
            t.id == record.thread && matches!(t.status, ThreadStatus::Waiting { step } if step == record.id)
        });
        if !waiting {
            return Err(bad(format!("pending step {} has no waiting thread", record.id)));
        }
        if checkpoint.graph.node(record.node).is_none() {
            return Err(bad(format!("pending step {} node {} not in graph", record.id, record.node)));
        }
    }
    Ok(())
}
