//! The action abstraction over external capabilities.
//!
//! Actions are what flows reach out to through the action bridge: an LLM
//! generation, a registered function, an utterance renderer. The runtime
//! never blocks on them; it records a call id and parks the flow until the
//! completion comes back as an event.

use crate::error::ActionError;
use crate::ids::CallId;
use crate::value::{Params, Value};
use async_trait::async_trait;
use std::collections::HashMap;

/// A request produced by the interpreter to start an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Correlates the eventual completion with the waiting flow instance
    pub call_id: CallId,

    /// Name of the action to run
    pub action: String,

    /// Evaluated arguments
    pub params: Params,
}

/// The core Action trait.
///
/// Each capability implements this trait and is registered in the
/// [`ActionRegistry`] under its name.
#[async_trait]
pub trait Action: Send + Sync {
    /// The unique name flows use to call this action.
    fn name(&self) -> &str;

    /// A short description (shown by `parley inspect`).
    fn description(&self) -> &str;

    /// Run the action.
    async fn execute(&self, params: Params) -> std::result::Result<Value, ActionError>;
}

/// A registry of available actions.
///
/// Flow libraries are validated against [`ActionRegistry::names`], and the
/// runtime looks actions up here when it services an [`ActionRequest`].
pub struct ActionRegistry {
    actions: HashMap<String, Box<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action. Replaces any existing action with the same name.
    pub fn register(&mut self, action: Box<dyn Action>) {
        let name = action.name().to_string();
        self.actions.insert(name, action);
    }

    /// Get an action by name.
    pub fn get(&self, name: &str) -> Option<&dyn Action> {
        self.actions.get(name).map(|a| a.as_ref())
    }

    /// Execute a request.
    pub async fn execute(&self, request: &ActionRequest) -> std::result::Result<Value, ActionError> {
        let action = self
            .actions
            .get(&request.action)
            .ok_or_else(|| ActionError::NotFound(request.action.clone()))?;
        action.execute(request.params.clone()).await
    }

    /// All registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Name and description pairs, sorted by name.
    pub fn describe(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .actions
            .values()
            .map(|a| (a.name(), a.description()))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uppercases its `text` argument.
    struct ShoutAction;

    #[async_trait]
    impl Action for ShoutAction {
        fn name(&self) -> &str {
            "shout"
        }
        fn description(&self) -> &str {
            "Uppercases the input"
        }
        async fn execute(&self, params: Params) -> std::result::Result<Value, ActionError> {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ActionError::InvalidArguments("missing text".into()))?;
            Ok(Value::from(text.to_uppercase()))
        }
    }

    fn request(action: &str, params: Params) -> ActionRequest {
        ActionRequest {
            call_id: CallId(1),
            action: action.into(),
            params,
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ActionRegistry::new();
        registry.register(Box::new(ShoutAction));
        assert!(registry.get("shout").is_some());
        assert!(registry.get("whisper").is_none());
        assert_eq!(registry.names(), vec!["shout"]);
        assert_eq!(registry.describe(), vec![("shout", "Uppercases the input")]);
    }

    #[tokio::test]
    async fn registry_executes_action() {
        let mut registry = ActionRegistry::new();
        registry.register(Box::new(ShoutAction));
        let mut params = Params::new();
        params.insert("text".into(), Value::from("hey"));
        let result = registry.execute(&request("shout", params)).await.unwrap();
        assert_eq!(result, Value::from("HEY"));
    }

    #[tokio::test]
    async fn registry_reports_missing_action() {
        let registry = ActionRegistry::new();
        let err = registry
            .execute(&request("nope", Params::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::NotFound(_)));
    }

    #[tokio::test]
    async fn action_errors_pass_through() {
        let mut registry = ActionRegistry::new();
        registry.register(Box::new(ShoutAction));
        let err = registry
            .execute(&request("shout", Params::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidArguments(_)));
    }
}
