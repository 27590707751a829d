//! The event vocabulary: every event tag a flow may match or send.
//!
//! Tags are checked when definitions load, so a misspelled event name is a
//! load error instead of a flow that silently never matches.

use crate::DefinitionError;
use parley_core::names;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the runtime treats an event tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Raised by the outside world (user utterances, gestures, timers).
    #[default]
    Input,
    /// Bot-facing: subject to action arbitration and returned to the caller.
    Output,
    /// Exchanged between flows and the runtime only.
    Internal,
}

/// A vocabulary entry as written in config or flow files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDecl {
    pub name: String,

    #[serde(default)]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Registry of known event tags.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    events: BTreeMap<String, EventKind>,
}

impl Vocabulary {
    /// An empty vocabulary.
    pub fn empty() -> Self {
        Self {
            events: BTreeMap::new(),
        }
    }

    /// The standard tags every runtime understands.
    pub fn standard() -> Self {
        let mut vocabulary = Self::empty();
        for (name, kind) in [
            (names::USER_SAID, EventKind::Input),
            (names::USER_SILENT, EventKind::Input),
            (names::BOT_SAY, EventKind::Output),
            (names::BOT_GESTURE, EventKind::Output),
            (names::ACTION_FINISHED, EventKind::Internal),
            (names::ACTION_FAILED, EventKind::Internal),
            (names::TIMEOUT, EventKind::Internal),
            (names::FLOW_STARTED, EventKind::Internal),
            (names::FLOW_FINISHED, EventKind::Internal),
            (names::FLOW_FAILED, EventKind::Internal),
        ] {
            vocabulary.events.insert(name.to_string(), kind);
        }
        vocabulary
    }

    /// Declare a tag. Re-declaring with the same kind is a no-op.
    pub fn declare(&mut self, name: &str, kind: EventKind) -> Result<(), DefinitionError> {
        if name.trim().is_empty() {
            return Err(DefinitionError::Invalid {
                flow: "(vocabulary)".into(),
                reason: "event name cannot be empty".into(),
            });
        }
        match self.events.get(name) {
            Some(existing) if *existing != kind => Err(DefinitionError::ConflictingEventKind {
                name: name.to_string(),
                existing: *existing,
                incoming: kind,
            }),
            Some(_) => Ok(()),
            None => {
                self.events.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Declare every entry of a list.
    pub fn extend(&mut self, decls: &[EventDecl]) -> Result<(), DefinitionError> {
        for decl in decls {
            self.declare(&decl.name, decl.kind)?;
        }
        Ok(())
    }

    pub fn kind(&self, name: &str) -> Option<EventKind> {
        self.events.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    /// Whether events with this tag are bot-facing.
    pub fn is_output(&self, name: &str) -> bool {
        self.kind(name) == Some(EventKind::Output)
    }

    /// All tags in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, EventKind)> {
        self.events.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::standard()
    }
}
