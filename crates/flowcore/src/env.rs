//! Layered environment variable resolution.

use crate::StepFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type EnvMap = BTreeMap<String, String>;

/// Environment reported by an agent. A `None` value unsets the variable,
/// hiding whatever the ambient layer holds for it.
pub type AgentEnv = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvLayer {
    pub name: String,
    /// `None` masks every layer below this one.
    pub vars: BTreeMap<String, Option<String>>,
}

impl EnvLayer {
    fn set(name: String, vars: &EnvMap) -> Self {
        Self {
            name,
            vars: vars.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect(),
        }
    }
}

/// Ordered list of named layers, consulted most specific first.
///
/// Never persisted as such: it is rebuilt on every access from the
/// ambient configuration, the captured agent snapshot, the run-scoped
/// overrides and the open block scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    layers: Vec<EnvLayer>,
}

impl EnvironmentOverlay {
    /// Compose the overlay. `blocks` are ordered outermost first, as they
    /// appear on a frame stack.
    pub fn compose(
        ambient: &EnvMap,
        agent: Option<(&str, &AgentEnv)>,
        overrides: &EnvMap,
        blocks: &[&EnvMap],
    ) -> Self {
        let mut layers = Vec::with_capacity(blocks.len() + 3);
        for (depth, vars) in blocks.iter().enumerate().rev() {
            layers.push(EnvLayer::set(format!("block[{depth}]"), vars));
        }
        layers.push(EnvLayer::set("run".into(), overrides));
        if let Some((label, vars)) = agent {
            layers.push(EnvLayer {
                name: format!("agent:{label}"),
                vars: vars.clone(),
            });
        }
        layers.push(EnvLayer::set("ambient".into(), ambient));
        Self { layers }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.resolve(key).map(|(value, _)| value)
    }

    /// Value and the name of the layer that supplied it.
    pub fn resolve(&self, key: &str) -> Option<(&str, &str)> {
        for layer in &self.layers {
            match layer.vars.get(key) {
                Some(Some(value)) => return Some((value.as_str(), layer.name.as_str())),
                Some(None) => return None,
                None => {}
            }
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resolve(key).is_some()
    }

    /// Flattened view, as a child process would see it.
    pub fn snapshot(&self) -> EnvMap {
        let mut merged = EnvMap::new();
        for layer in self.layers.iter().rev() {
            for (key, value) in &layer.vars {
                match value {
                    Some(value) => merged.insert(key.clone(), value.clone()),
                    None => merged.remove(key),
                };
            }
        }
        merged
    }

    pub fn layers(&self) -> &[EnvLayer] {
        &self.layers
    }
}

/// Ambient variables: the configured map, optionally on top of the
/// hosting process's own environment.
pub fn ambient_environment(configured: &EnvMap, inherit_process_env: bool) -> EnvMap {
    let mut ambient = EnvMap::new();
    if inherit_process_env {
        ambient.extend(std::env::vars());
    }
    ambient.extend(configured.iter().map(|(k, v)| (k.clone(), v.clone())));
    ambient
}

/// Reports the environment of the agent a `node` block runs on.
pub trait AgentProvider: Send + Sync {
    fn environment(&self, label: &str) -> Result<AgentEnv, StepFailure>;
}

/// Agents with fixed environments, keyed by label.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentProvider {
    agents: BTreeMap<String, AgentEnv>,
}

impl StaticAgentProvider {
    pub fn new(agents: BTreeMap<String, AgentEnv>) -> Self {
        Self { agents }
    }

    pub fn with_agent(mut self, label: impl Into<String>, env: AgentEnv) -> Self {
        self.agents.insert(label.into(), env);
        self
    }
}

impl AgentProvider for StaticAgentProvider {
    fn environment(&self, label: &str) -> Result<AgentEnv, StepFailure> {
        self.agents
            .get(label)
            .cloned()
            .ok_or_else(|| StepFailure::new(format!("No agent with label '{label}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn agent(pairs: &[(&str, Option<&str>)]) -> AgentEnv {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn precedence_block_over_run_over_agent_over_ambient() {
        let ambient = map(&[("K", "v0"), ("HOME", "/root")]);
        let agent = agent(&[("K", Some("agent")), ("PERMACHINE", Some("set"))]);
        let run = map(&[("K", "v1")]);
        let block = map(&[("K", "v2")]);

        let inside = EnvironmentOverlay::compose(&ambient, Some(("linux", &agent)), &run, &[&block]);
        assert_eq!(inside.resolve("K"), Some(("v2", "block[0]")));

        let outside = EnvironmentOverlay::compose(&ambient, Some(("linux", &agent)), &run, &[]);
        assert_eq!(outside.get("K"), Some("v1"));
        assert_eq!(outside.get("PERMACHINE"), Some("set"));

        let bare = EnvironmentOverlay::compose(&ambient, None, &EnvMap::new(), &[]);
        assert_eq!(bare.get("K"), Some("v0"));
        assert_eq!(bare.get("MISSING"), None);
    }

    #[test]
    fn innermost_block_wins() {
        let outer = map(&[("X", "outer"), ("Y", "outer")]);
        let inner = map(&[("X", "inner")]);
        let overlay = EnvironmentOverlay::compose(&EnvMap::new(), None, &EnvMap::new(), &[&outer, &inner]);
        assert_eq!(overlay.get("X"), Some("inner"));
        assert_eq!(overlay.get("Y"), Some("outer"));
        assert_eq!(overlay.snapshot().get("X").map(String::as_str), Some("inner"));
    }

    #[test]
    fn unknown_agent_fails() {
        let provider = StaticAgentProvider::default().with_agent("linux", AgentEnv::new());
        assert!(provider.environment("linux").is_ok());
        assert!(provider.environment("windows").is_err());
    }

    #[test]
    fn agent_can_unset_ambient_variables() {
        let ambient = map(&[("BUILD_TAG", "controller"), ("HOME", "/root")]);
        let agent = agent(&[("BUILD_TAG", None)]);
        let run = map(&[("HOME", "/home/agent")]);

        let overlay = EnvironmentOverlay::compose(&ambient, Some(("linux", &agent)), &EnvMap::new(), &[]);
        assert_eq!(overlay.get("BUILD_TAG"), None);
        assert!(!overlay.contains("BUILD_TAG"));
        assert!(!overlay.snapshot().contains_key("BUILD_TAG"));
        assert_eq!(overlay.get("HOME"), Some("/root"));

        let block = map(&[("BUILD_TAG", "block")]);
        let reset = EnvironmentOverlay::compose(&ambient, Some(("linux", &agent)), &run, &[&block]);
        assert_eq!(reset.resolve("BUILD_TAG"), Some(("block", "block[0]")));
        assert_eq!(reset.snapshot().get("BUILD_TAG").map(String::as_str), Some("block"));
        assert_eq!(reset.get("HOME"), Some("/home/agent"));
    }
}
