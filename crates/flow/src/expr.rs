//! Value expressions used in `send`, `start`, `assign`, and `execute`.
//!
//! Expressions are written as plain values in flow files. A string of the
//! form `"$name"` is a variable reference; a string containing `{$name}`
//! is a template; lists and maps evaluate element-wise; everything else is
//! a literal.

use parley_core::{FlowError, Params, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read access to bound variables.
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Lookup for Params {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// If `text` is a variable reference (`$ident`), return the identifier.
pub fn var_name(text: &str) -> Option<&str> {
    let name = text.strip_prefix('$')?;
    is_ident(name).then_some(name)
}

pub(crate) fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One piece of a string template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Var(String),
}

/// An expression evaluated against a flow instance's scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Expr {
    Literal(Value),
    Var(String),
    Template(Vec<Segment>),
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// Evaluate against `scope`. Referencing an unbound variable is a
    /// pattern error.
    pub fn eval(&self, scope: &dyn Lookup) -> Result<Value, FlowError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => resolve(scope, name).cloned(),
            Expr::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Var(name) => out.push_str(&resolve(scope, name)?.render()),
                    }
                }
                Ok(Value::Str(out))
            }
            Expr::List(items) => items
                .iter()
                .map(|item| item.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Map(entries) => entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), item.eval(scope)?)))
                .collect::<Result<BTreeMap<_, _>, FlowError>>()
                .map(Value::Map),
        }
    }

    /// Every variable this expression reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => out.push(name),
            Expr::Template(segments) => {
                for segment in segments {
                    if let Segment::Var(name) = segment {
                        out.push(name);
                    }
                }
            }
            Expr::List(items) => items.iter().for_each(|item| item.collect_variables(out)),
            Expr::Map(entries) => entries.values().for_each(|item| item.collect_variables(out)),
        }
    }
}

fn resolve<'a>(scope: &'a dyn Lookup, name: &str) -> Result<&'a Value, FlowError> {
    scope
        .lookup(name)
        .ok_or_else(|| FlowError::Pattern(format!("unbound variable ${name}")))
}

/// Evaluate a parameter map.
pub fn eval_params(
    params: &BTreeMap<String, Expr>,
    scope: &dyn Lookup,
) -> Result<Params, FlowError> {
    params
        .iter()
        .map(|(key, expr)| Ok((key.clone(), expr.eval(scope)?)))
        .collect()
}

/// Split `text` into template segments, or `None` when it has no `{$var}`.
fn parse_template(text: &str) -> Option<Vec<Segment>> {
    if !text.contains("{$") {
        return None;
    }
    let mut segments = Vec::new();
    let mut rest = text;
    let mut literal = String::new();
    while let Some(start) = rest.find("{$") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_ident(&after[..end]) => {
                literal.push_str(&rest[..start]);
                if !literal.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Var(after[..end].to_string()));
                rest = &after[end + 1..];
            }
            _ => {
                literal.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Text(literal));
    }
    segments
        .iter()
        .any(|s| matches!(s, Segment::Var(_)))
        .then_some(segments)
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        match value {
            Value::Str(text) => {
                if let Some(name) = var_name(&text) {
                    Expr::Var(name.to_string())
                } else if let Some(segments) = parse_template(&text) {
                    Expr::Template(segments)
                } else {
                    Expr::Literal(Value::Str(text))
                }
            }
            Value::List(items) => Expr::List(items.into_iter().map(Expr::from).collect()),
            Value::Map(entries) => Expr::Map(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, Expr::from(item)))
                    .collect(),
            ),
            other => Expr::Literal(other),
        }
    }
}

impl From<Expr> for Value {
    fn from(expr: Expr) -> Self {
        match expr {
            Expr::Literal(value) => value,
            Expr::Var(name) => Value::Str(format!("${name}")),
            Expr::Template(segments) => Value::Str(
                segments
                    .into_iter()
                    .map(|segment| match segment {
                        Segment::Text(text) => text,
                        Segment::Var(name) => format!("{{${name}}}"),
                    })
                    .collect(),
            ),
            Expr::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Expr::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, Value::from(item)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Expr {
    fn from(text: &str) -> Self {
        Expr::from(Value::from(text))
    }
}
