//! Event patterns: what a waiting flow expects to see next.

use crate::expr::var_name;
use parley_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A constraint on one event parameter.
///
/// In flow files a constraint is written as a plain value; strings of the
/// form `"$name"` refer to a bound variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Constraint {
    /// Parameter must equal this value.
    Literal(Value),
    /// Parameter must equal the current value of this variable.
    Var(String),
}

impl From<Value> for Constraint {
    fn from(value: Value) -> Self {
        if let Some(name) = value.as_str().and_then(var_name) {
            return Constraint::Var(name.to_string());
        }
        Constraint::Literal(value)
    }
}

impl From<Constraint> for Value {
    fn from(constraint: Constraint) -> Self {
        match constraint {
            Constraint::Literal(value) => value,
            Constraint::Var(name) => Value::Str(format!("${name}")),
        }
    }
}

impl From<&str> for Constraint {
    fn from(text: &str) -> Self {
        Constraint::from(Value::from(text))
    }
}

/// An expected event.
///
/// Unconstrained parameters are wildcards. `capture` copies event
/// parameters into flow variables when the pattern matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    pub event: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Constraint>,

    /// Event parameter → variable name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capture: BTreeMap<String, String>,

    /// Claim the event so that no other equally-specific instance consumes it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclusive: bool,
}

impl EventPattern {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            params: BTreeMap::new(),
            capture: BTreeMap::new(),
            exclusive: false,
        }
    }

    /// Constrain a parameter.
    pub fn with(mut self, param: impl Into<String>, constraint: impl Into<Constraint>) -> Self {
        self.params.insert(param.into(), constraint.into());
        self
    }

    /// Capture a parameter into a variable.
    pub fn capture(mut self, param: impl Into<String>, var: impl Into<String>) -> Self {
        self.capture.insert(param.into(), var.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Number of constrained parameters.
    pub fn specificity(&self) -> usize {
        self.params.len()
    }

    /// Variables referenced by constraints.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.params.values().filter_map(|c| match c {
            Constraint::Var(name) => Some(name.as_str()),
            Constraint::Literal(_) => None,
        })
    }
}

impl std::fmt::Display for EventPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.event)?;
        for (i, (param, constraint)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match constraint {
                Constraint::Literal(Value::Str(s)) => write!(f, "{param}={s:?}")?,
                Constraint::Literal(value) => write!(f, "{param}={value}")?,
                Constraint::Var(name) => write!(f, "{param}=${name}")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_from_value() {
        assert_eq!(Constraint::from("$user"), Constraint::Var("user".into()));
        assert_eq!(Constraint::from("hi"), Constraint::Literal(Value::from("hi")));
        assert_eq!(
            Constraint::from(Value::from(3)),
            Constraint::Literal(Value::from(3))
        );
    }

    #[test]
    fn specificity_counts_constraints() {
        let wildcard = EventPattern::new("UserSaid").capture("text", "text");
        let exact = EventPattern::new("UserSaid").with("text", "hi");
        assert_eq!(wildcard.specificity(), 0);
        assert_eq!(exact.specificity(), 1);
    }

    #[test]
    fn pattern_deserializes_from_json() {
        let pattern: EventPattern = serde_json::from_str(
            r#"{"event": "UserSaid", "params": {"text": "hi", "who": "$user"}, "exclusive": true}"#,
        )
        .unwrap();
        assert!(pattern.exclusive);
        assert_eq!(pattern.specificity(), 2);
        assert_eq!(pattern.variables().collect::<Vec<_>>(), vec!["user"]);
        assert_eq!(pattern.to_string(), r#"UserSaid(text="hi", who=$user)"#);
    }
}
