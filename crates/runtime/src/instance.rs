//! Flow instances: live cursors over compiled flows.

use parley_core::{CallId, InstanceId, Params, TimerId};
use parley_flow::{CompiledFlow, Pc, Select};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle state of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, not yet run.
    Starting,
    /// Executing non-blocking statements.
    Active,
    /// Suspended at a select.
    Waiting,
    Completed,
    Aborted,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Aborted)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Active => "active",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// What an armed select arm is waiting on, aligned with `Select::arms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// A matching event.
    Event,
    /// The lifecycle outcome of this child.
    Child(InstanceId),
    /// The completion of this action call.
    Call(CallId),
}

/// The state of a suspended instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Wait {
    /// Program counter of the select being waited on.
    pub select: Pc,
    pub arms: Vec<Armed>,
    pub timer: Option<TimerId>,
}

/// One live execution of a flow definition.
#[derive(Debug, Clone)]
pub struct FlowInstance {
    pub(crate) id: InstanceId,
    pub(crate) flow: Arc<CompiledFlow>,
    pub(crate) pc: Pc,
    pub(crate) locals: Params,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) children: BTreeSet<InstanceId>,
    pub(crate) detached: bool,
    pub(crate) depth: usize,
    pub(crate) status: InstanceStatus,
    pub(crate) wait: Option<Wait>,
    pub(crate) outcome: Option<String>,
}

impl FlowInstance {
    pub(crate) fn new(
        id: InstanceId,
        flow: Arc<CompiledFlow>,
        args: Params,
        parent: Option<InstanceId>,
        depth: usize,
        detached: bool,
    ) -> Self {
        let mut locals = Params::new();
        for name in flow.parameters() {
            locals.insert(name.clone(), args.get(name).cloned().unwrap_or_default());
        }
        Self {
            id,
            flow,
            pc: 0,
            locals,
            parent,
            children: BTreeSet::new(),
            detached,
            depth,
            status: InstanceStatus::Starting,
            wait: None,
            outcome: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn flow_name(&self) -> &str {
        self.flow.name()
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Program counter into the compiled flow.
    pub fn pc(&self) -> Pc {
        self.pc
    }

    pub fn locals(&self) -> &Params {
        &self.locals
    }

    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Live, non-detached children.
    pub fn children(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.children.iter().copied()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Nesting depth; root flows are 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn wait(&self) -> Option<&Wait> {
        self.wait.as_ref()
    }

    /// Abort reason, once aborted.
    pub fn outcome(&self) -> Option<&str> {
        self.outcome.as_deref()
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub(crate) fn is_parameter(&self, name: &str) -> bool {
        self.flow.parameters().iter().any(|p| p == name)
    }

    /// The select this instance is suspended on.
    pub(crate) fn select(&self) -> Option<&Select> {
        let wait = self.wait.as_ref()?;
        match self.flow.program().get(wait.select) {
            Some(parley_flow::Instr::Select(select)) => Some(select),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Value;
    use parley_flow::{FlowDefinition, FlowLibrary, Statement, Vocabulary};

    fn compiled() -> Arc<CompiledFlow> {
        let library = FlowLibrary::new(
            Vocabulary::standard(),
            vec![
                FlowDefinition::new("greet", vec![Statement::say("hi {$name}")])
                    .with_parameters(["name", "title"]),
            ],
        )
        .unwrap();
        library.get("greet").unwrap().clone()
    }

    #[test]
    fn parameters_bind_args_or_null() {
        let mut args = Params::new();
        args.insert("name".into(), Value::from("Ada"));
        args.insert("ignored".into(), Value::from(1));
        let instance = FlowInstance::new(InstanceId(1), compiled(), args, None, 0, false);

        assert_eq!(instance.locals()["name"], Value::from("Ada"));
        assert_eq!(instance.locals()["title"], Value::Null);
        assert!(!instance.locals().contains_key("ignored"));
        assert!(instance.is_parameter("title"));
        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert!(instance.is_live());
        assert!(instance.select().is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Aborted.is_terminal());
        assert!(!InstanceStatus::Waiting.is_terminal());
        assert_eq!(InstanceStatus::Waiting.to_string(), "waiting");
    }
}
