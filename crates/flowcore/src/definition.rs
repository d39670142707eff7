use crate::{DefinitionError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Whether a definition may suspend across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionMode {
    /// Arbitrary nesting, asynchronous steps, checkpointed suspension.
    #[default]
    Full,
    /// Steps must complete synchronously; nothing is checkpointed.
    Restricted,
}

/// A parsed pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Definition {
    pub name: String,
    #[serde(default)]
    pub mode: DefinitionMode,
    pub body: Construct,
}

impl Definition {
    pub fn new(name: impl Into<String>, body: Construct) -> Self {
        Self {
            name: name.into(),
            mode: DefinitionMode::Full,
            body,
        }
    }

    pub fn with_mode(mut self, mode: DefinitionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parse the textual form. The `mode` flag given at intake wins over
    /// anything written in the document.
    pub fn parse(text: &str, mode: DefinitionMode) -> Result<Self, DefinitionError> {
        let mut definition: Definition =
            serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.mode = mode;
        Ok(definition)
    }

    /// Look up the construct a program counter points at.
    pub fn construct_at(&self, path: &ConstructPath) -> Option<&Construct> {
        path.0
            .iter()
            .try_fold(&self.body, |construct, &index| construct.child(index as usize))
    }

    /// Structural checks performed before a run is created.
    pub fn validate<F>(&self, is_known_step: F) -> Result<(), DefinitionError>
    where
        F: Fn(&str) -> bool,
    {
        self.validate_construct(&self.body, &ConstructPath::root(), &is_known_step)
    }

    fn validate_construct<F>(
        &self,
        construct: &Construct,
        path: &ConstructPath,
        is_known_step: &F,
    ) -> Result<(), DefinitionError>
    where
        F: Fn(&str) -> bool,
    {
        let invalid = |reason: &str| DefinitionError::Invalid {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let restricted = self.mode == DefinitionMode::Restricted;

        match construct {
            Construct::Step(call) => {
                if !is_known_step(&call.name) {
                    return Err(DefinitionError::UnknownStep(call.name.clone()));
                }
            }
            Construct::Retry { attempts, .. } if *attempts == 0 => {
                return Err(invalid("retry needs at least one attempt"));
            }
            Construct::Parallel(branches) => {
                if restricted {
                    return Err(DefinitionError::NotAllowedInRestrictedMode {
                        construct: "parallel".into(),
                    });
                }
                if branches.is_empty() {
                    return Err(invalid("parallel needs at least one branch"));
                }
                let mut seen = HashSet::new();
                for branch in branches {
                    if !seen.insert(branch.name.as_str()) {
                        return Err(invalid(&format!("duplicate branch '{}'", branch.name)));
                    }
                }
            }
            Construct::SetVar { name, .. } if name.is_empty() => {
                return Err(invalid("variable name is empty"));
            }
            Construct::SetEnv { key, .. } if key.is_empty() => {
                return Err(invalid("environment key is empty"));
            }
            _ => {}
        }

        for (index, child) in construct.children().into_iter().enumerate() {
            self.validate_construct(child, &path.child(index), is_known_step)?;
        }
        Ok(())
    }
}

/// Program counter into a definition: child indices from the root body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ConstructPath(pub Vec<u32>);

impl ConstructPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index as u32);
        Self(indices)
    }
}

impl fmt::Display for ConstructPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("/"))
    }
}

/// Control structure of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Construct {
    Sequence(Vec<Construct>),
    Step(StepCall),
    SetVar {
        name: String,
        value: Expr,
    },
    SetEnv {
        key: String,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Box<Construct>,
        #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<Construct>>,
    },
    Retry {
        attempts: u32,
        body: Box<Construct>,
    },
    Try {
        body: Box<Construct>,
        catch: Box<Construct>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },
    WithEnv {
        vars: BTreeMap<String, Expr>,
        body: Box<Construct>,
    },
    Node {
        label: String,
        body: Box<Construct>,
    },
    AsIdentity {
        principal: String,
        body: Box<Construct>,
    },
    Parallel(Vec<Branch>),
}

impl Construct {
    pub fn step(name: impl Into<String>) -> Self {
        Construct::Step(StepCall::new(name))
    }

    /// Child construct by index, using the same numbering as `ConstructPath`.
    pub fn child(&self, index: usize) -> Option<&Construct> {
        match self {
            Construct::Sequence(items) => items.get(index),
            Construct::If { then, otherwise, .. } => match index {
                0 => Some(then),
                1 => otherwise.as_deref(),
                _ => None,
            },
            Construct::Try { body, catch, .. } => match index {
                0 => Some(body),
                1 => Some(catch),
                _ => None,
            },
            Construct::Retry { body, .. }
            | Construct::WithEnv { body, .. }
            | Construct::Node { body, .. }
            | Construct::AsIdentity { body, .. } => (index == 0).then_some(body.as_ref()),
            Construct::Parallel(branches) => branches.get(index).map(|b| &b.body),
            Construct::Step(_) | Construct::SetVar { .. } | Construct::SetEnv { .. } => None,
        }
    }

    pub fn children(&self) -> Vec<&Construct> {
        (0..).map_while(|i| self.child(i)).collect()
    }
}

/// Invocation of a registered step by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepCall {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

impl StepCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
            bind: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Expr) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn bind(mut self, var: impl Into<String>) -> Self {
        self.bind = Some(var.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub name: String,
    pub body: Construct,
}

/// Expressions evaluated by the interpreter against run variables and the
/// environment overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Lit(Value),
    /// Run variable, falling back to the environment when undefined.
    Var(String),
    Env(String),
    /// String with `${name}` / `${env.NAME}` placeholders.
    Template(String),
    Add(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Lit(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn template(text: impl Into<String>) -> Self {
        Expr::Template(text.into())
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::Add(Box::new(lhs), Box::new(rhs))
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Expr::Lt(Box::new(lhs), Box::new(rhs))
    }
}
