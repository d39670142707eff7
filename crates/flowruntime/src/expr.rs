//! Expression evaluation against run variables and the environment overlay.

use flowcore::{EnvironmentOverlay, Expr, StepFailure, Value};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::cmp::Ordering;
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*(env\.)?([A-Za-z_][A-Za-z0-9_]*)\s*\}").expect("placeholder regex"));

pub struct Evaluator<'a> {
    vars: &'a BTreeMap<String, Value>,
    env: &'a EnvironmentOverlay,
}

impl<'a> Evaluator<'a> {
    pub fn new(vars: &'a BTreeMap<String, Value>, env: &'a EnvironmentOverlay) -> Self {
        Self { vars, env }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, StepFailure> {
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::Env(name) => Ok(self
                .env
                .get(name)
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null)),
            Expr::Template(text) => self.interpolate(text).map(Value::String),
            Expr::Add(lhs, rhs) => add(self.eval(lhs)?, self.eval(rhs)?),
            Expr::Lt(lhs, rhs) => {
                let ordering = compare(&self.eval(lhs)?, &self.eval(rhs)?)?;
                Ok(Value::Bool(ordering == Ordering::Less))
            }
            Expr::Eq(lhs, rhs) => Ok(Value::Bool(loosely_equal(&self.eval(lhs)?, &self.eval(rhs)?))),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            Expr::And(items) => {
                for item in items {
                    if !self.eval(item)?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if self.eval(item)?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
        }
    }

    /// Evaluate and render as a string, the way environment values are stored.
    pub fn eval_string(&self, expr: &Expr) -> Result<String, StepFailure> {
        self.eval(expr).map(|v| v.to_string())
    }

    /// Run variables shadow the environment; the environment is consulted
    /// only for names that are otherwise undefined.
    fn lookup(&self, name: &str) -> Result<Value, StepFailure> {
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        self.env
            .get(name)
            .map(|v| Value::String(v.to_string()))
            .ok_or_else(|| StepFailure::new(format!("No such property: {name}")))
    }

    fn interpolate(&self, text: &str) -> Result<String, StepFailure> {
        let mut failure = None;
        let rendered = PLACEHOLDER.replace_all(text, |caps: &Captures| {
            let name = &caps[2];
            if caps.get(1).is_some() {
                return self.env.get(name).unwrap_or_default().to_string();
            }
            match self.lookup(name) {
                Ok(value) => value.to_string(),
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, StepFailure> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| StepFailure::new("integer overflow")),
        (Value::String(a), b) => Ok(Value::String(format!("{a}{b}"))),
        (a, Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Float(x + y)),
            _ => Err(StepFailure::new(format!(
                "Cannot add {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<Ordering, StepFailure> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| StepFailure::new("Cannot compare NaN")),
            _ => Err(StepFailure::new(format!(
                "Cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => lhs == rhs,
    }
}
