//! Events: the immutable typed records the runtime consumes and emits.
//!
//! An event is built by its producer (the transport layer, a flow's `send`
//! statement, the action bridge) and stamped with a `sequence_id` when the
//! session takes it in. After that it is shared read-only. Two events are the
//! same occurrence only when their sequence ids match; equal names and
//! parameters do not make two events the same.

use crate::value::{Params, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event tags.
pub mod names {
    /// A finished user utterance. Parameters: `text`.
    pub const USER_SAID: &str = "UserSaid";
    /// The user stayed silent (raised by the transport layer).
    pub const USER_SILENT: &str = "UserSilent";
    /// The bot should say something. Parameters: `text`.
    pub const BOT_SAY: &str = "BotSay";
    /// The bot should perform a gesture. Parameters: `gesture`.
    pub const BOT_GESTURE: &str = "BotGesture";
    /// An action-bridge call finished. Parameters: `call_id`, `action`, `result`.
    pub const ACTION_FINISHED: &str = "ActionFinished";
    /// An action-bridge call failed. Parameters: `call_id`, `action`, `error`.
    pub const ACTION_FAILED: &str = "ActionFailed";
    /// A `wait_any` timeout elapsed. Parameters: `timer_id`.
    pub const TIMEOUT: &str = "Timeout";
    /// A flow instance started. Parameters: `flow`, `instance_id`.
    pub const FLOW_STARTED: &str = "FlowStarted";
    /// A flow instance completed. Parameters: `flow`, `instance_id`.
    pub const FLOW_FINISHED: &str = "FlowFinished";
    /// A flow instance was aborted. Parameters: `flow`, `instance_id`, `reason`.
    pub const FLOW_FAILED: &str = "FlowFailed";
}

/// An immutable typed occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    name: String,

    #[serde(default)]
    parameters: Params,

    /// Assigned by the session on intake; `0` until then.
    #[serde(default)]
    sequence_id: u64,

    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Params::new(),
            sequence_id: 0,
            created_at: Utc::now(),
        }
    }

    /// Create an event with the given parameters.
    pub fn with_params(name: impl Into<String>, parameters: Params) -> Self {
        Self {
            parameters,
            ..Self::new(name)
        }
    }

    /// Shorthand for a `UserSaid` event.
    pub fn user_said(text: impl Into<String>) -> Self {
        Self::new(names::USER_SAID).with("text", text.into())
    }

    /// Add a parameter (builder style, before the event is submitted).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Stamp the event with its session sequence id.
    pub fn sequenced(mut self, sequence_id: u64) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &Params {
        &self.parameters
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// The `text` parameter, if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.param("text").and_then(Value::as_str)
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether both records describe the same occurrence.
    pub fn same_occurrence(&self, other: &Event) -> bool {
        self.sequence_id != 0 && self.sequence_id == other.sequence_id
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.parameters.is_empty() {
            let rendered: Vec<String> = self
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={}", v.to_json()))
                .collect();
            write!(f, "({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_parameters() {
        let event = Event::user_said("hi").with("confidence", 0.9);
        assert_eq!(event.name(), names::USER_SAID);
        assert_eq!(event.text(), Some("hi"));
        assert_eq!(event.param("confidence"), Some(&Value::Number(0.9)));
        assert_eq!(event.sequence_id(), 0);
    }

    #[test]
    fn identity_is_sequence_id_not_payload() {
        let a = Event::user_said("hi").sequenced(1);
        let b = Event::user_said("hi").sequenced(2);
        let a_again = a.clone();
        assert!(!a.same_occurrence(&b));
        assert!(a.same_occurrence(&a_again));
        // Unstamped events never count as the same occurrence.
        assert!(!Event::new("X").same_occurrence(&Event::new("X")));
    }

    #[test]
    fn display_lists_parameters() {
        let event = Event::new(names::BOT_SAY).with("text", "Hello");
        assert_eq!(event.to_string(), r#"BotSay(text="Hello")"#);
    }

    #[test]
    fn deserializes_from_script_line() {
        let event: Event =
            serde_json::from_str(r#"{"name": "UserSaid", "parameters": {"text": "hello"}}"#)
                .unwrap();
        assert_eq!(event.text(), Some("hello"));
    }
}
