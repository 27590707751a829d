//! Built-in actions flows can `execute`.
//!
//! - `render_utterance`: fills `{name}` placeholders in a template
//! - `generate_text`: asks a [`TextGenerator`] (an LLM backend) for text
//! - [`FnAction`]: adapts a plain closure into an action

use async_trait::async_trait;
use parley_core::{Action, ActionError, ActionRegistry, Params, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Renders bot utterances from templates.
///
/// Either pass the template inline as `template`, or name a registered one
/// with `utterance`. Every `{key}` in the template is replaced by the
/// rendered parameter `key`; unknown placeholders are an error.
#[derive(Debug, Default)]
pub struct RenderUtterance {
    templates: HashMap<String, String>,
}

impl RenderUtterance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(name.into(), template.into());
        self
    }

    fn template<'a>(&'a self, params: &'a Params) -> Result<&'a str, ActionError> {
        if let Some(inline) = params.get("template").and_then(Value::as_str) {
            return Ok(inline);
        }
        let name = params
            .get("utterance")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ActionError::InvalidArguments("Missing 'template' or 'utterance' argument".into())
            })?;
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ActionError::InvalidArguments(format!("Unknown utterance '{name}'")))
    }
}

#[async_trait]
impl Action for RenderUtterance {
    fn name(&self) -> &str {
        "render_utterance"
    }

    fn description(&self) -> &str {
        "Render a bot utterance from a template, substituting {name} placeholders."
    }

    async fn execute(&self, params: Params) -> Result<Value, ActionError> {
        let template = self.template(&params)?;
        fill(template, &params).map(Value::from)
    }
}

/// Substitute `{key}` placeholders. `{{` and `}}` are literal braces.
fn fill(template: &str, params: &Params) -> Result<String, ActionError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let key: String = chars.by_ref().take_while(|&c| c != '}').collect();
                let value = params.get(key.trim()).ok_or_else(|| {
                    ActionError::InvalidArguments(format!("No value for placeholder '{{{key}}}'"))
                })?;
                out.push_str(&value.render());
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// A text-generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, String>;
}

/// Generates a reply with a [`TextGenerator`].
///
/// Takes a required `prompt` and an optional `instructions` preamble.
pub struct GenerateText {
    generator: Arc<dyn TextGenerator>,
}

impl GenerateText {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Action for GenerateText {
    fn name(&self) -> &str {
        "generate_text"
    }

    fn description(&self) -> &str {
        "Generate free text from a prompt with the configured language model."
    }

    async fn execute(&self, params: Params) -> Result<Value, ActionError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidArguments("Missing 'prompt' argument".into()))?;
        let prompt = match params.get("instructions").and_then(Value::as_str) {
            Some(instructions) => format!("{instructions}\n\n{prompt}"),
            None => prompt.to_string(),
        };
        self.generator
            .generate(&prompt)
            .await
            .map(Value::from)
            .map_err(|reason| ActionError::ExecutionFailed {
                action: self.name().to_string(),
                reason,
            })
    }
}

type Handler = dyn Fn(Params) -> Result<Value, ActionError> + Send + Sync;

/// An action backed by a synchronous closure.
pub struct FnAction {
    name: String,
    description: String,
    handler: Box<Handler>,
}

impl FnAction {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(Params) -> Result<Value, ActionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, params: Params) -> Result<Value, ActionError> {
        (self.handler)(params)
    }
}

/// A registry with the actions every deployment has.
pub fn builtin_actions() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(Box::new(RenderUtterance::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn render_inline_template() {
        let action = RenderUtterance::new();
        let result = action
            .execute(params(&[
                ("template", Value::from("Hello {name}, you have {count} {{new}} messages")),
                ("name", Value::from("Ada")),
                ("count", Value::from(3)),
            ]))
            .await
            .unwrap();
        assert_eq!(result, Value::from("Hello Ada, you have 3 {new} messages"));
    }

    #[tokio::test]
    async fn render_named_template() {
        let action = RenderUtterance::new().with_template("greet", "Hi {who}!");
        let result = action
            .execute(params(&[
                ("utterance", Value::from("greet")),
                ("who", Value::from("there")),
            ]))
            .await
            .unwrap();
        assert_eq!(result, Value::from("Hi there!"));
    }

    #[tokio::test]
    async fn render_reports_missing_placeholder() {
        let action = RenderUtterance::new();
        let err = action
            .execute(params(&[("template", Value::from("Hi {who}"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidArguments(msg) if msg.contains("who")));

        let err = action.execute(Params::new()).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidArguments(_)));
    }

    struct Echo;

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, prompt: &str) -> Result<String, String> {
            if prompt.is_empty() {
                Err("empty prompt".into())
            } else {
                Ok(format!("echo: {prompt}"))
            }
        }
    }

    #[tokio::test]
    async fn generate_text_uses_backend() {
        let action = GenerateText::new(Arc::new(Echo));
        let result = action
            .execute(params(&[
                ("prompt", Value::from("hi")),
                ("instructions", Value::from("be brief")),
            ]))
            .await
            .unwrap();
        assert_eq!(result, Value::from("echo: be brief\n\nhi"));

        let err = action
            .execute(params(&[("prompt", Value::from(""))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::ExecutionFailed { action, .. } if action == "generate_text"));
    }

    #[tokio::test]
    async fn fn_action_wraps_closure() {
        let action = FnAction::new("double", "Doubles n", |params: Params| {
            let n = params
                .get("n")
                .and_then(Value::as_f64)
                .ok_or_else(|| ActionError::InvalidArguments("n".into()))?;
            Ok(Value::from(n * 2.0))
        });
        assert_eq!(action.name(), "double");
        let result = action
            .execute(params(&[("n", Value::from(21))]))
            .await
            .unwrap();
        assert_eq!(result, Value::from(42.0));
    }

    #[test]
    fn builtins_include_renderer() {
        assert_eq!(builtin_actions().names(), vec!["render_utterance"]);
    }
}
