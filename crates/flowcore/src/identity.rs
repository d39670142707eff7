//! Who a run, or a step inside it, executes as.
//!
//! Resolution is a pure function of persisted run inputs (the job
//! identity) and the provider's configuration, never of the calling
//! thread, so the same principal comes back after a restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub const SYSTEM: &'static str = "SYSTEM";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Assigns principals to jobs. External collaborator.
pub trait IdentityProvider: Send + Sync {
    /// `None` when no assignment applies; the run then executes as SYSTEM.
    fn principal_for(&self, job: &str) -> Option<Principal>;
}

/// Fixed job → principal table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    assignments: HashMap<String, Principal>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, job: impl Into<String>, principal: impl Into<String>) -> Self {
        self.assignments.insert(job.into(), Principal::new(principal));
        self
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn principal_for(&self, job: &str) -> Option<Principal> {
        self.assignments.get(job).cloned()
    }
}

/// When the run principal is asked for again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Keep the principal captured at run start for the run's lifetime.
    ResolveOnce,
    /// Ask the provider again, with the persisted job identity, every time
    /// the run is resumed from a checkpoint.
    #[default]
    ResolveOnResume,
}

pub fn resolve_principal(provider: &dyn IdentityProvider, job: &str) -> Principal {
    provider.principal_for(job).unwrap_or_else(Principal::system)
}

/// Principal for a run on resume, given what was persisted.
///
/// Returns the principal to use and whether it differs from the persisted
/// one.
pub fn reresolve_principal(
    provider: &dyn IdentityProvider,
    policy: IdentityPolicy,
    job: &str,
    persisted: &Principal,
) -> (Principal, bool) {
    match policy {
        IdentityPolicy::ResolveOnce => (persisted.clone(), false),
        IdentityPolicy::ResolveOnResume => {
            let fresh = resolve_principal(provider, job);
            let changed = fresh != *persisted;
            (fresh, changed)
        }
    }
}

/// Identity for a run and, optionally, the block scopes around a step.
///
/// `scopes` are ordered outermost first; the innermost wins.
pub fn current_identity(run_principal: &Principal, scopes: &[&Principal]) -> Principal {
    scopes
        .last()
        .map(|p| (*p).clone())
        .unwrap_or_else(|| run_principal.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_jobs_run_as_system() {
        let provider = StaticIdentityProvider::new().assign("demo", "someone");
        assert_eq!(resolve_principal(&provider, "demo").name(), "someone");
        assert_eq!(resolve_principal(&provider, "other"), Principal::system());
    }

    #[test]
    fn reresolution_is_stable_under_unchanged_configuration() {
        let provider = StaticIdentityProvider::new().assign("demo", "someone");
        let before = resolve_principal(&provider, "demo");
        let (after, changed) =
            reresolve_principal(&provider, IdentityPolicy::ResolveOnResume, "demo", &before);
        assert_eq!(after, before);
        assert!(!changed);
    }

    #[test]
    fn policy_decides_whether_configuration_changes_apply() {
        let persisted = Principal::new("someone");
        let changed_provider = StaticIdentityProvider::new().assign("demo", "else");

        let (p, changed) =
            reresolve_principal(&changed_provider, IdentityPolicy::ResolveOnResume, "demo", &persisted);
        assert_eq!(p.name(), "else");
        assert!(changed);

        let (p, changed) =
            reresolve_principal(&changed_provider, IdentityPolicy::ResolveOnce, "demo", &persisted);
        assert_eq!(p, persisted);
        assert!(!changed);
    }

    #[test]
    fn innermost_scope_wins() {
        let run = Principal::new("someone");
        let a = Principal::new("a");
        let b = Principal::new("b");
        assert_eq!(current_identity(&run, &[]), run);
        assert_eq!(current_identity(&run, &[&a, &b]), b);
    }
}
