use crate::execution::FlowExecution;
use crate::pending::{PendingRegistry, PendingStepInfo};
use crate::registry::StepRegistry;
use crate::store::{ContinuationStore, FileContinuationStore, InMemoryContinuationStore};
use dashmap::DashMap;
use flowcore::env::ambient_environment;
use flowcore::identity::resolve_principal;
use flowcore::{
    AgentEnv, AgentProvider, Definition, DefinitionError, DefinitionMode, EnvMap, EventBus, ExecutionEvent, FlowError,
    GraphListener, GraphListenerRegistry, IdentityPolicy, IdentityProvider, RunId, StaticAgentProvider,
    StaticIdentityProvider, StepContext, StepExecution, StepExecutionId, StepOutcome,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-lifetime collaborators shared by every run.
pub(crate) struct EngineServices {
    pub registry: Arc<StepRegistry>,
    pub listeners: Arc<GraphListenerRegistry>,
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn ContinuationStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub identity_policy: IdentityPolicy,
    pub agents: Arc<dyn AgentProvider>,
    pub pending: PendingRegistry,
    pub ambient: EnvMap,
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub identity_policy: IdentityPolicy,
    /// Global environment, lowest precedence.
    pub ambient_env: EnvMap,
    /// Put the hosting process's environment under `ambient_env`.
    pub inherit_process_env: bool,
    /// Directory for file-backed checkpoints; in memory when unset.
    pub state_dir: Option<PathBuf>,
    /// Job → principal assignments for the built-in identity provider.
    pub identities: BTreeMap<String, String>,
    /// Agent label → environment for the built-in agent provider; a null
    /// value unsets the variable on that agent.
    pub agents: BTreeMap<String, AgentEnv>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            identity_policy: IdentityPolicy::default(),
            ambient_env: EnvMap::new(),
            inherit_process_env: false,
            state_dir: None,
            identities: BTreeMap::new(),
            agents: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Outcome of `resume_all`.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<RunId>,
    /// Terminal runs found in the store and left alone.
    pub finished: Vec<RunId>,
    pub failed: Vec<(RunId, String)>,
}

pub struct FlowRuntimeBuilder {
    config: RuntimeConfig,
    registry: StepRegistry,
    store: Option<Arc<dyn ContinuationStore>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    agents: Option<Arc<dyn AgentProvider>>,
    listeners: Vec<Arc<dyn GraphListener>>,
}

impl FlowRuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn ContinuationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    pub fn agent_provider(mut self, provider: Arc<dyn AgentProvider>) -> Self {
        self.agents = Some(provider);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn GraphListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> FlowRuntime {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| match &config.state_dir {
            Some(dir) => Arc::new(FileContinuationStore::new(dir.clone())) as Arc<dyn ContinuationStore>,
            None => Arc::new(InMemoryContinuationStore::new()),
        });
        let identity = self.identity.unwrap_or_else(|| {
            let provider = config
                .identities
                .iter()
                .fold(StaticIdentityProvider::new(), |p, (job, principal)| p.assign(job.clone(), principal.clone()));
            Arc::new(provider)
        });
        let agents = self
            .agents
            .unwrap_or_else(|| Arc::new(StaticAgentProvider::new(config.agents.clone())));
        let listeners = Arc::new(GraphListenerRegistry::new());
        for listener in self.listeners {
            listeners.register(listener);
        }

        let services = EngineServices {
            registry: Arc::new(self.registry),
            listeners,
            bus: Arc::new(EventBus::new(config.event_buffer_size)),
            store,
            identity,
            identity_policy: config.identity_policy,
            agents,
            pending: PendingRegistry::new(),
            ambient: ambient_environment(&config.ambient_env, config.inherit_process_env),
        };
        FlowRuntime {
            services: Arc::new(services),
            executions: DashMap::new(),
        }
    }
}

/// Main runtime for executing flows
pub struct FlowRuntime {
    services: Arc<EngineServices>,
    executions: DashMap<RunId, Arc<FlowExecution>>,
}

impl FlowRuntime {
    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder {
            config: RuntimeConfig::default(),
            registry: StepRegistry::new(),
            store: None,
            identity: None,
            agents: None,
            listeners: Vec::new(),
        }
    }

    /// Runtime with the given registry and defaults for everything else.
    pub fn new(registry: StepRegistry) -> Self {
        Self::builder().registry(registry).build()
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.services.registry
    }

    pub fn store(&self) -> Arc<dyn ContinuationStore> {
        Arc::clone(&self.services.store)
    }

    /// Listeners may also be added after startup; they see nodes appended
    /// from then on.
    pub fn listeners(&self) -> &GraphListenerRegistry {
        &self.services.listeners
    }

    /// Parse and validate a definition against the registered steps.
    pub fn validate(&self, text: &str, mode: DefinitionMode) -> Result<Definition, DefinitionError> {
        let definition = Definition::parse(text, mode)?;
        definition.validate(|name| self.services.registry.contains(name))?;
        Ok(definition)
    }

    /// Start a run from the textual definition. Returns as soon as the run
    /// exists; the body executes on the tokio runtime.
    pub fn start(&self, text: &str, mode: DefinitionMode, job: &str) -> Result<Arc<FlowExecution>, FlowError> {
        let definition = self.validate(text, mode)?;
        self.start_definition(definition, job)
    }

    pub fn start_definition(&self, definition: Definition, job: &str) -> Result<Arc<FlowExecution>, FlowError> {
        definition.validate(|name| self.services.registry.contains(name))?;
        let principal = resolve_principal(self.services.identity.as_ref(), job);
        let execution = FlowExecution::start(Arc::clone(&self.services), definition, job, principal)?;
        self.executions.insert(execution.run_id(), Arc::clone(&execution));
        Ok(execution)
    }

    /// Resume a single persisted run.
    pub async fn resume(&self, run_id: RunId) -> Result<Arc<FlowExecution>, FlowError> {
        if let Some(existing) = self.execution(run_id) {
            return Ok(existing);
        }
        let checkpoint = self.services.store.load(run_id).await?;
        let execution = FlowExecution::resume(Arc::clone(&self.services), checkpoint).await?;
        self.executions.insert(run_id, Arc::clone(&execution));
        Ok(execution)
    }

    /// Resume every non-terminal run in the store. One run failing to
    /// resume does not prevent the others.
    pub async fn resume_all(&self) -> Result<ResumeReport, FlowError> {
        let mut report = ResumeReport::default();
        for run_id in self.services.store.list().await? {
            if self.executions.contains_key(&run_id) {
                continue;
            }
            let checkpoint = match self.services.store.load(run_id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    tracing::error!(run = %run_id, error = %e, "cannot load checkpoint");
                    report.failed.push((run_id, e.to_string()));
                    continue;
                }
            };
            if checkpoint.is_terminal() {
                report.finished.push(run_id);
                continue;
            }
            match FlowExecution::resume(Arc::clone(&self.services), checkpoint).await {
                Ok(execution) => {
                    self.executions.insert(run_id, execution);
                    report.resumed.push(run_id);
                }
                Err(e) => {
                    tracing::error!(run = %run_id, error = %e, "cannot resume run");
                    report.failed.push((run_id, e.to_string()));
                }
            }
        }
        tracing::info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "resumed persisted runs"
        );
        Ok(report)
    }

    pub fn execution(&self, run_id: RunId) -> Option<Arc<FlowExecution>> {
        self.executions.get(&run_id).map(|e| Arc::clone(e.value()))
    }

    pub fn executions(&self) -> Vec<Arc<FlowExecution>> {
        self.executions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Pending steps across all loaded runs, optionally of one kind.
    pub fn list_pending(&self, kind: Option<&str>) -> Vec<PendingStepInfo> {
        self.services
            .pending
            .list(|entry| kind.map_or(true, |k| entry.kind == k))
    }

    /// Deliver a result to a pending step on its behalf and wait for the
    /// run to settle.
    pub async fn complete_pending(&self, step_id: StepExecutionId, outcome: StepOutcome) -> Result<(), FlowError> {
        let entry = self
            .services
            .pending
            .get(&step_id)
            .ok_or(flowcore::AlreadyCompletedError(step_id))?;
        entry.ctx.completion.complete(outcome)?;
        if let Some(execution) = self.execution(entry.run_id) {
            execution.wait_until_settled().await;
        }
        Ok(())
    }

    pub fn apply_to_all_pending<P, F>(&self, predicate: P, action: F) -> usize
    where
        P: Fn(&PendingStepInfo) -> bool,
        F: FnMut(&mut dyn StepExecution, &StepContext),
    {
        self.services.pending.apply_to_all(predicate, action)
    }

    /// Apply `action` to every pending execution of type `T`.
    pub fn apply_to_all<T, F>(&self, action: F) -> usize
    where
        T: StepExecution + 'static,
        F: FnMut(&mut T, &StepContext),
    {
        self.services.pending.apply_to_all_of::<T, F>(action)
    }

    pub async fn abort(&self, run_id: RunId, reason: &str) -> Result<flowcore::RunStatus, FlowError> {
        let execution = self.execution(run_id).ok_or(FlowError::RunNotFound(run_id))?;
        execution.abort(reason).await
    }

    /// Wait until every loaded run has no outstanding advance.
    pub async fn wait_until_settled(&self) {
        let executions = self.executions();
        join_all(executions.iter().map(|e| e.wait_until_settled())).await;
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.services.bus.subscribe()
    }
}
