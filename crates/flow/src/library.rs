//! Loading, validating, and sharing flow definitions.

use crate::DefinitionError;
use crate::program::Program;
use crate::statement::{FlowDefinition, Statement};
use crate::vocabulary::{EventDecl, Vocabulary};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The on-disk shape of a flow file (TOML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFile {
    /// Extra event tags used by these flows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventDecl>,

    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

impl FlowFile {
    /// Parse file contents; `.json` files are JSON, everything else TOML.
    pub fn parse(path: &Path, content: &str) -> Result<Self, DefinitionError> {
        let parsed = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(content).map_err(|e| e.to_string())
        } else {
            toml::from_str(content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| DefinitionError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn read(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path).map_err(|e| DefinitionError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &content)
    }
}

/// A validated definition together with its compiled program.
#[derive(Debug)]
pub struct CompiledFlow {
    definition: FlowDefinition,
    program: Program,
}

impl CompiledFlow {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn parameters(&self) -> &[String] {
        &self.definition.parameters
    }
}

/// An immutable, validated set of flows plus the vocabulary they were
/// checked against. Shared read-only by every session.
#[derive(Debug)]
pub struct FlowLibrary {
    flows: BTreeMap<String, Arc<CompiledFlow>>,
    vocabulary: Vocabulary,
}

impl FlowLibrary {
    /// Validate and compile a set of definitions.
    pub fn new(
        vocabulary: Vocabulary,
        definitions: Vec<FlowDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut signatures: BTreeMap<&str, &[String]> = BTreeMap::new();
        for def in &definitions {
            if def.name.trim().is_empty() {
                return Err(DefinitionError::EmptyName);
            }
            if signatures
                .insert(def.name.as_str(), def.parameters.as_slice())
                .is_some()
            {
                return Err(DefinitionError::DuplicateFlow(def.name.clone()));
            }
            let mut seen = HashSet::new();
            for parameter in &def.parameters {
                if !seen.insert(parameter.as_str()) {
                    return Err(DefinitionError::DuplicateParameter {
                        flow: def.name.clone(),
                        parameter: parameter.clone(),
                    });
                }
            }
        }

        let checker = Checker {
            vocabulary: &vocabulary,
            signatures: &signatures,
        };
        for def in &definitions {
            checker.block(&def.name, &def.body)?;
        }

        let mut flows = BTreeMap::new();
        for definition in definitions {
            let program = Program::compile(&definition)?;
            debug!(
                flow = %definition.name,
                instructions = program.len(),
                "Compiled flow"
            );
            flows.insert(
                definition.name.clone(),
                Arc::new(CompiledFlow {
                    definition,
                    program,
                }),
            );
        }

        Ok(Self { flows, vocabulary })
    }

    /// Build from a parsed flow file, extending `vocabulary` with its events.
    pub fn from_file(mut vocabulary: Vocabulary, file: FlowFile) -> Result<Self, DefinitionError> {
        vocabulary.extend(&file.events)?;
        Self::new(vocabulary, file.flows)
    }

    pub fn from_toml_str(vocabulary: Vocabulary, content: &str) -> Result<Self, DefinitionError> {
        let file = FlowFile::parse(Path::new("<inline>.toml"), content)?;
        Self::from_file(vocabulary, file)
    }

    pub fn from_json_str(vocabulary: Vocabulary, content: &str) -> Result<Self, DefinitionError> {
        let file = FlowFile::parse(Path::new("<inline>.json"), content)?;
        Self::from_file(vocabulary, file)
    }

    /// Read and merge several flow files into one library.
    pub fn load_files(
        mut vocabulary: Vocabulary,
        paths: &[PathBuf],
    ) -> Result<Self, DefinitionError> {
        let mut definitions = Vec::new();
        for path in paths {
            let file = FlowFile::read(path)?;
            vocabulary.extend(&file.events)?;
            info!(
                path = %path.display(),
                flows = file.flows.len(),
                "Loaded flow file"
            );
            definitions.extend(file.flows);
        }
        Self::new(vocabulary, definitions)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CompiledFlow>> {
        self.flows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    /// Flow names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledFlow>> {
        self.flows.values()
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Every action name referenced by an `execute` statement.
    pub fn actions_used(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for flow in self.flows.values() {
            collect_actions(&flow.definition.body, &mut out);
        }
        out
    }

    /// Check that every referenced action is available.
    pub fn validate_actions(&self, available: &[&str]) -> Result<(), DefinitionError> {
        for flow in self.flows.values() {
            let mut used = BTreeSet::new();
            collect_actions(&flow.definition.body, &mut used);
            if let Some(missing) = used.into_iter().find(|a| !available.contains(a)) {
                return Err(DefinitionError::UnknownAction {
                    flow: flow.name().to_string(),
                    action: missing.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn collect_actions<'a>(body: &'a [Statement], out: &mut BTreeSet<&'a str>) {
    for statement in body {
        match statement {
            Statement::Execute {
                action, on_failure, ..
            } => {
                out.insert(action);
                if let Some(handler) = on_failure {
                    collect_actions(handler, out);
                }
            }
            Statement::Await {
                on_failure: Some(handler),
                ..
            } => collect_actions(handler, out),
            Statement::Sequence { body } | Statement::Repeat { body } => collect_actions(body, out),
            Statement::Alternative { branches } => {
                branches.iter().for_each(|b| collect_actions(b, out));
            }
            Statement::WaitAny {
                branches,
                on_timeout,
                ..
            } => {
                branches.iter().for_each(|b| collect_actions(b, out));
                collect_actions(on_timeout, out);
            }
            Statement::If {
                then, otherwise, ..
            } => {
                collect_actions(then, out);
                collect_actions(otherwise, out);
            }
            _ => {}
        }
    }
}

/// Cross-reference checks: event tags, flow targets, argument names.
struct Checker<'a> {
    vocabulary: &'a Vocabulary,
    signatures: &'a BTreeMap<&'a str, &'a [String]>,
}

impl Checker<'_> {
    fn block(&self, flow: &str, body: &[Statement]) -> Result<(), DefinitionError> {
        body.iter().try_for_each(|statement| self.statement(flow, statement))
    }

    fn event(&self, flow: &str, event: &str) -> Result<(), DefinitionError> {
        if self.vocabulary.contains(event) {
            Ok(())
        } else {
            Err(DefinitionError::UnknownEvent {
                flow: flow.to_string(),
                event: event.to_string(),
            })
        }
    }

    fn target<'e>(
        &self,
        flow: &str,
        target: &str,
        mut args: impl Iterator<Item = &'e String>,
    ) -> Result<(), DefinitionError> {
        let parameters = self
            .signatures
            .get(target)
            .ok_or_else(|| DefinitionError::UnknownFlow {
                flow: flow.to_string(),
                target: target.to_string(),
            })?;
        match args.find(|arg| !parameters.contains(arg)) {
            Some(arg) => Err(DefinitionError::UnknownParameter {
                flow: flow.to_string(),
                target: target.to_string(),
                parameter: arg.clone(),
            }),
            None => Ok(()),
        }
    }

    fn statement(&self, flow: &str, statement: &Statement) -> Result<(), DefinitionError> {
        match statement {
            Statement::Match(pattern) => self.event(flow, &pattern.event),
            Statement::Send { event, .. } => self.event(flow, event),
            Statement::Start { flow: target, args, .. } => self.target(flow, target, args.keys()),
            Statement::Await {
                flow: target,
                args,
                on_failure,
            } => {
                self.target(flow, target, args.keys())?;
                match on_failure {
                    Some(handler) => self.block(flow, handler),
                    None => Ok(()),
                }
            }
            Statement::Execute { on_failure, .. } => match on_failure {
                Some(handler) => self.block(flow, handler),
                None => Ok(()),
            },
            Statement::Sequence { body } | Statement::Repeat { body } => self.block(flow, body),
            Statement::Alternative { branches } => {
                branches.iter().try_for_each(|b| self.block(flow, b))
            }
            Statement::WaitAny {
                branches,
                on_timeout,
                ..
            } => {
                branches.iter().try_for_each(|b| self.block(flow, b))?;
                self.block(flow, on_timeout)
            }
            Statement::If {
                then, otherwise, ..
            } => {
                self.block(flow, then)?;
                self.block(flow, otherwise)
            }
            Statement::Assign { var, .. } => {
                if crate::expr::is_ident(var) {
                    Ok(())
                } else {
                    Err(DefinitionError::Invalid {
                        flow: flow.to_string(),
                        reason: format!("invalid variable name '{var}'"),
                    })
                }
            }
            Statement::Abort { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::EventKind;
    use parley_core::Value;
    use std::io::Write;

    const HELLO: &str = r#"
[[flows]]
name = "main"
body = [
  { type = "alternative", branches = [
      [{ type = "match", event = "UserSaid", params = { text = "hi" } }],
      [{ type = "match", event = "UserSaid", params = { text = "hello" } }],
  ] },
  { type = "send", event = "BotSay", params = { text = "Hello World!" } },
]
"#;

    #[test]
    fn loads_hello_world_from_toml() {
        let library = FlowLibrary::from_toml_str(Vocabulary::standard(), HELLO).unwrap();
        assert_eq!(library.len(), 1);
        let main = library.get("main").unwrap();
        assert_eq!(main.name(), "main");
        assert!(main.program().len() >= 3);
    }

    #[test]
    fn rejects_unknown_event() {
        let err = FlowLibrary::new(
            Vocabulary::standard(),
            vec![FlowDefinition::new(
                "main",
                vec![Statement::send("BotSayy", [("text", Value::from("x"))])],
            )],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownEvent { event, .. } if event == "BotSayy"));
    }

    #[test]
    fn file_events_extend_vocabulary() {
        let library = FlowLibrary::from_json_str(
            Vocabulary::standard(),
            r#"{
                "events": [{"name": "BotShowCard", "kind": "output"}],
                "flows": [{"name": "card", "body": [{"type": "send", "event": "BotShowCard"}]}]
            }"#,
        )
        .unwrap();
        assert_eq!(
            library.vocabulary().kind("BotShowCard"),
            Some(EventKind::Output)
        );
    }

    #[test]
    fn rejects_unknown_flow_and_parameter() {
        let child = FlowDefinition::new("child", vec![Statement::say("hi")]).with_parameters(["name"]);

        let err = FlowLibrary::new(
            Vocabulary::standard(),
            vec![child.clone(), FlowDefinition::new("main", vec![Statement::start("ghost")])],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownFlow { target, .. } if target == "ghost"));

        let bad_arg = Statement::Start {
            flow: "child".into(),
            args: [("nmae".to_string(), crate::Expr::from("x"))].into(),
            detached: false,
        };
        let err = FlowLibrary::new(
            Vocabulary::standard(),
            vec![child, FlowDefinition::new("main", vec![bad_arg])],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownParameter { parameter, .. } if parameter == "nmae"));
    }

    #[test]
    fn rejects_duplicates() {
        let def = FlowDefinition::new("main", vec![Statement::say("hi")]);
        let err = FlowLibrary::new(Vocabulary::standard(), vec![def.clone(), def]).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateFlow(name) if name == "main"));

        let def = FlowDefinition::new("greet", vec![]).with_parameters(["a", "a"]);
        let err = FlowLibrary::new(Vocabulary::standard(), vec![def]).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateParameter { .. }));
    }

    #[test]
    fn bad_predicate_is_a_parse_error() {
        let err = FlowLibrary::from_toml_str(
            Vocabulary::standard(),
            r#"
[[flows]]
name = "main"
body = [{ type = "if", condition = "$x ==", then = [] }]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::Parse { .. }));
    }

    #[test]
    fn action_validation() {
        let library = FlowLibrary::new(
            Vocabulary::standard(),
            vec![FlowDefinition::new(
                "main",
                vec![Statement::execute(
                    "generate_text",
                    [("prompt", Value::from("hi"))],
                    Some("reply"),
                )],
            )],
        )
        .unwrap();
        assert_eq!(
            library.actions_used().into_iter().collect::<Vec<_>>(),
            vec!["generate_text"]
        );
        assert!(library.validate_actions(&["generate_text"]).is_ok());
        assert!(matches!(
            library.validate_actions(&["render_utterance"]),
            Err(DefinitionError::UnknownAction { action, .. }) if action == "generate_text"
        ));
    }

    #[test]
    fn load_files_merges_and_reports_paths() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("greeting.toml");
        std::fs::File::create(&first)
            .unwrap()
            .write_all(HELLO.as_bytes())
            .unwrap();
        let second = dir.path().join("extra.json");
        std::fs::write(
            &second,
            r#"{"flows": [{"name": "bye", "body": [{"type": "match", "event": "UserSaid", "params": {"text": "bye"}}]}]}"#,
        )
        .unwrap();

        let library =
            FlowLibrary::load_files(Vocabulary::standard(), &[first, second]).unwrap();
        assert_eq!(library.names().collect::<Vec<_>>(), vec!["bye", "main"]);

        let missing = dir.path().join("missing.toml");
        let err = FlowLibrary::load_files(Vocabulary::standard(), &[missing]).unwrap_err();
        assert!(matches!(err, DefinitionError::Read { .. }));
    }
}
