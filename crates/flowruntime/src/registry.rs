use flowcore::{ContextService, StepExecution, StepFailure, Value};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Describes a step kind and builds its executions.
pub trait StepDescriptor: Send + Sync {
    /// Name the step is invoked by in definitions (e.g. "semaphore", "echo")
    fn function_name(&self) -> &str;

    /// Create a fresh execution from evaluated arguments
    fn create(&self, args: &BTreeMap<String, Value>) -> Result<Box<dyn StepExecution>, StepFailure>;

    /// Rebuild a suspended execution from the fields it saved
    fn restore(&self, saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String>;

    /// Context services the step relies on
    fn required_context(&self) -> &'static [ContextService] {
        &[ContextService::Listener]
    }

    /// Optional: description and argument list for listings
    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Deserialize saved fields straight into a step type.
pub fn restore_json<T>(saved: serde_json::Value) -> Result<Box<dyn StepExecution>, String>
where
    T: StepExecution + DeserializeOwned + 'static,
{
    serde_json::from_value::<T>(saved)
        .map(|step| Box::new(step) as Box<dyn StepExecution>)
        .map_err(|e| e.to_string())
}

/// Metadata about a step kind
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    pub args: Vec<ArgDefinition>,
    /// Whether the step may return `Pending`
    pub asynchronous: bool,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            args: Vec::new(),
            asynchronous: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ArgDefinition {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}

/// Registry of available step kinds, populated at process start
pub struct StepRegistry {
    descriptors: HashMap<String, Arc<dyn StepDescriptor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: HashMap::new(),
        }
    }

    /// Register a step descriptor
    pub fn register(&mut self, descriptor: Arc<dyn StepDescriptor>) {
        let name = descriptor.function_name().to_string();
        tracing::info!("Registering step: {}", name);
        if self.descriptors.insert(name.clone(), descriptor).is_some() {
            tracing::warn!("Step {} registered twice; keeping the latest", name);
        }
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<dyn StepDescriptor>> {
        self.descriptors.get(function_name).cloned()
    }

    pub fn contains(&self, function_name: &str) -> bool {
        self.descriptors.contains_key(function_name)
    }

    /// Get all registered step names, sorted
    pub fn list_function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.descriptors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get metadata for a step kind
    pub fn get_metadata(&self, function_name: &str) -> Option<StepMetadata> {
        self.descriptors.get(function_name).map(|d| d.metadata())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
