//! Flow definitions: the static description of expected conversations.
//!
//! A flow is a named, reusable pattern of expected events and emitted
//! events/actions. Definitions are loaded once (from TOML or JSON, or built
//! in code), validated against the event [`Vocabulary`], compiled into a
//! flat [`Program`], and then shared read-only by every session.
//!
//! # Example flow file
//!
//! ```toml
//! [[flows]]
//! name = "main"
//! body = [
//!   { type = "alternative", branches = [
//!       [{ type = "match", event = "UserSaid", params = { text = "hi" } }],
//!       [{ type = "match", event = "UserSaid", params = { text = "hello" } }],
//!   ] },
//!   { type = "send", event = "BotSay", params = { text = "Hello World!" } },
//! ]
//! ```
//!
//! # Layers
//!
//! ```text
//!  FlowFile (serde) ──▶ FlowDefinition ──validate──▶ Program ──▶ CompiledFlow
//!                              │                                    │
//!                         Vocabulary                           FlowLibrary
//! ```

mod expr;
mod library;
mod pattern;
mod predicate;
mod program;
mod statement;
mod vocabulary;

pub use expr::{Expr, Lookup, Segment, eval_params, var_name};
pub use library::{CompiledFlow, FlowFile, FlowLibrary};
pub use pattern::{Constraint, EventPattern};
pub use predicate::{Predicate, parse_predicate};
pub use program::{Arm, Instr, Lead, MAX_TIMEOUT_SECS, Pc, Program, Select};
pub use statement::{FlowDefinition, Statement};
pub use vocabulary::{EventDecl, EventKind, Vocabulary};

use std::path::PathBuf;

/// Re-export for convenience.
pub type DefinitionResult<T> = std::result::Result<T, DefinitionError>;

/// Errors raised while loading, validating, or compiling flow definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("flow definition has an empty name")]
    EmptyName,

    #[error("flow '{0}' is defined more than once")]
    DuplicateFlow(String),

    #[error("flow '{flow}' declares parameter '{parameter}' more than once")]
    DuplicateParameter { flow: String, parameter: String },

    #[error("flow '{flow}' references unknown event '{event}'")]
    UnknownEvent { flow: String, event: String },

    #[error("flow '{flow}' references unknown flow '{target}'")]
    UnknownFlow { flow: String, target: String },

    #[error("flow '{flow}' passes unknown parameter '{parameter}' to '{target}'")]
    UnknownParameter {
        flow: String,
        target: String,
        parameter: String,
    },

    #[error("flow '{flow}' calls unknown action '{action}'")]
    UnknownAction { flow: String, action: String },

    #[error("flow '{flow}': every branch must start with match, await, or execute")]
    NonBlockingLead { flow: String },

    #[error("flow '{flow}': repeat body can never block")]
    NonBlockingLoop { flow: String },

    #[error("flow '{flow}': {reason}")]
    Invalid { flow: String, reason: String },

    #[error("event '{name}' declared as {existing:?} and {incoming:?}")]
    ConflictingEventKind {
        name: String,
        existing: EventKind,
        incoming: EventKind,
    },

    #[error("invalid predicate '{source_text}': {detail}")]
    Predicate { source_text: String, detail: String },

    #[error("failed to read flow file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse flow file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

impl From<DefinitionError> for parley_core::RuntimeError {
    fn from(err: DefinitionError) -> Self {
        parley_core::RuntimeError::Definition(err.to_string())
    }
}
