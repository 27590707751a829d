//! The flow statement tree as written in flow files.

use crate::expr::Expr;
use crate::pattern::EventPattern;
use crate::predicate::Predicate;
use parley_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, reusable pattern of expected and emitted events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,

    /// Parameter names, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub body: Vec<Statement>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>, body: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            description: String::new(),
            body,
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One statement of a flow body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    /// Block until an event matching the pattern arrives.
    Match(EventPattern),

    /// Emit an event.
    Send {
        event: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, Expr>,
    },

    /// Start a child flow and continue without waiting.
    Start {
        flow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, Expr>,
        /// Detached children survive their parent.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        detached: bool,
    },

    /// Start a child flow and block until it finishes.
    Await {
        flow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, Expr>,
        /// Runs when the child fails; without it the failure aborts this flow.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure: Option<Vec<Statement>>,
    },

    Sequence {
        body: Vec<Statement>,
    },

    /// `a or b`: the first branch whose lead matches wins, the rest are
    /// abandoned. A branch leading with a nested alternative or sequence is
    /// flattened into the enclosing choice.
    Alternative {
        branches: Vec<Vec<Statement>>,
    },

    /// Loop forever.
    Repeat {
        body: Vec<Statement>,
    },

    /// `when a ... or when b ...` with an optional timeout in seconds.
    WaitAny {
        branches: Vec<Vec<Statement>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_timeout: Vec<Statement>,
    },

    If {
        condition: Predicate,
        #[serde(default)]
        then: Vec<Statement>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<Statement>,
    },

    /// Bind a flow variable, or a session context entry when `global`.
    Assign {
        var: String,
        value: Expr,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        global: bool,
    },

    /// Call an external action and block until it completes.
    Execute {
        action: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, Expr>,
        /// Variable receiving the action's result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure: Option<Vec<Statement>>,
    },

    /// Stop this flow (and its non-detached children).
    Abort {
        #[serde(default)]
        reason: String,
    },
}

fn exprs<I, K>(params: I) -> BTreeMap<String, Expr>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    params
        .into_iter()
        .map(|(k, v)| (k.into(), Expr::from(v)))
        .collect()
}

impl Statement {
    pub fn expect(pattern: EventPattern) -> Self {
        Statement::Match(pattern)
    }

    /// `send` with parameters written in source form (`"$x"`, `"{$x}"`).
    pub fn send<I, K>(event: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Statement::Send {
            event: event.into(),
            params: exprs(params),
        }
    }

    /// Shorthand for `send BotSay(text=...)`.
    pub fn say(text: &str) -> Self {
        Statement::send(parley_core::names::BOT_SAY, [("text", Value::from(text))])
    }

    pub fn start(flow: impl Into<String>) -> Self {
        Statement::Start {
            flow: flow.into(),
            args: BTreeMap::new(),
            detached: false,
        }
    }

    pub fn await_flow(flow: impl Into<String>) -> Self {
        Statement::Await {
            flow: flow.into(),
            args: BTreeMap::new(),
            on_failure: None,
        }
    }

    pub fn alternative(branches: Vec<Vec<Statement>>) -> Self {
        Statement::Alternative { branches }
    }

    pub fn repeat(body: Vec<Statement>) -> Self {
        Statement::Repeat { body }
    }

    pub fn wait_any(branches: Vec<Vec<Statement>>, timeout: Option<f64>, on_timeout: Vec<Statement>) -> Self {
        Statement::WaitAny {
            branches,
            timeout,
            on_timeout,
        }
    }

    pub fn assign(var: impl Into<String>, value: impl Into<Value>) -> Self {
        Statement::Assign {
            var: var.into(),
            value: Expr::from(value.into()),
            global: false,
        }
    }

    pub fn execute<I, K>(action: impl Into<String>, params: I, result: Option<&str>) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Statement::Execute {
            action: action.into(),
            params: exprs(params),
            result: result.map(str::to_string),
            on_failure: None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Statement::Abort {
            reason: reason.into(),
        }
    }

    /// Whether this statement suspends the flow when it runs.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Statement::Match(_)
                | Statement::Await { .. }
                | Statement::Execute { .. }
                | Statement::Alternative { .. }
                | Statement::WaitAny { .. }
        )
    }

    /// Short tag used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Match(_) => "match",
            Statement::Send { .. } => "send",
            Statement::Start { .. } => "start",
            Statement::Await { .. } => "await",
            Statement::Sequence { .. } => "sequence",
            Statement::Alternative { .. } => "alternative",
            Statement::Repeat { .. } => "repeat",
            Statement::WaitAny { .. } => "wait_any",
            Statement::If { .. } => "if",
            Statement::Assign { .. } => "assign",
            Statement::Execute { .. } => "execute",
            Statement::Abort { .. } => "abort",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_flow_from_toml() {
        let def: FlowDefinition = toml::from_str(
            r#"
            name = "greet"
            parameters = ["name"]
            body = [
              { type = "match", event = "UserSaid", params = { text = "hi" } },
              { type = "send", event = "BotSay", params = { text = "Hello {$name}" } },
              { type = "if", condition = "$name == \"Ada\"", then = [{ type = "abort", reason = "done" }] },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(def.name, "greet");
        assert_eq!(def.parameters, vec!["name"]);
        assert_eq!(def.body.len(), 3);
        assert!(matches!(&def.body[0], Statement::Match(p) if p.event == "UserSaid"));
        assert!(matches!(&def.body[2], Statement::If { otherwise, .. } if otherwise.is_empty()));
    }

    #[test]
    fn deserialize_wait_any_with_timeout_from_json() {
        let stmt: Statement = serde_json::from_str(
            r#"{
                "type": "wait_any",
                "branches": [[{"type": "match", "event": "UserSaid"}]],
                "timeout": 12,
                "on_timeout": [{"type": "send", "event": "BotSay", "params": {"text": "Still there?"}}]
            }"#,
        )
        .unwrap();
        match stmt {
            Statement::WaitAny {
                branches,
                timeout,
                on_timeout,
            } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(timeout, Some(12.0));
                assert_eq!(on_timeout.len(), 1);
            }
            other => panic!("expected wait_any, got {}", other.kind()),
        }
    }

    #[test]
    fn unknown_statement_type_fails() {
        let result: Result<Statement, _> = serde_json::from_str(r#"{"type": "teleport"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn builders_produce_expected_shapes() {
        let say = Statement::say("Hello World!");
        assert!(matches!(&say, Statement::Send { event, params }
            if event == "BotSay" && params["text"] == Expr::from("Hello World!")));
        assert!(!say.is_blocking());
        assert!(Statement::await_flow("child").is_blocking());
        assert_eq!(Statement::abort("x").kind(), "abort");
    }

    #[test]
    fn if_else_serializes_with_else_key() {
        let stmt = Statement::If {
            condition: "$x".parse().unwrap(),
            then: vec![Statement::say("yes")],
            otherwise: vec![Statement::say("no")],
        };
        let json = serde_json::to_string(&stmt).unwrap();
        assert!(json.contains(r#""else""#));
        let back: Statement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stmt);
    }
}
