//! Runtime notices: structured observability for flow execution.
//!
//! Notices are published when something interesting happens inside a
//! session: flows start, finish or abort, bot actions lose arbitration,
//! action calls are dispatched or their completions discarded. Observers
//! subscribe without coupling to the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All runtime notices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// A session was created and its root flows activated
    SessionOpened {
        session: String,
        main_flows: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A session was destroyed or discarded
    SessionClosed {
        session: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A flow instance was created
    FlowStarted {
        session: String,
        instance: u64,
        flow: String,
        depth: usize,
        timestamp: DateTime<Utc>,
    },

    /// A flow instance exhausted its body
    FlowCompleted {
        session: String,
        instance: u64,
        flow: String,
        timestamp: DateTime<Utc>,
    },

    /// A flow instance was aborted
    FlowAborted {
        session: String,
        instance: u64,
        flow: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A bot-facing event lost arbitration and was discarded
    BotActionDeferred {
        session: String,
        instance: u64,
        event: String,
        winner: u64,
        timestamp: DateTime<Utc>,
    },

    /// An action call was handed to the bridge
    ActionDispatched {
        session: String,
        call_id: u64,
        action: String,
        instance: u64,
        timestamp: DateTime<Utc>,
    },

    /// An action completion arrived for an aborted instance and was dropped
    CompletionDiscarded {
        session: String,
        call_id: u64,
        timestamp: DateTime<Utc>,
    },
}

impl Notice {
    /// Short name of the notice variant, for logs and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::SessionOpened { .. } => "session_opened",
            Notice::SessionClosed { .. } => "session_closed",
            Notice::FlowStarted { .. } => "flow_started",
            Notice::FlowCompleted { .. } => "flow_completed",
            Notice::FlowAborted { .. } => "flow_aborted",
            Notice::BotActionDeferred { .. } => "bot_action_deferred",
            Notice::ActionDispatched { .. } => "action_dispatched",
            Notice::CompletionDiscarded { .. } => "completion_discarded",
        }
    }
}

/// A broadcast-based bus for runtime notices.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Cloning the bus
/// yields another handle onto the same channel.
#[derive(Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<Arc<Notice>>,
}

impl NoticeBus {
    /// Create a new bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notice to all subscribers.
    pub fn publish(&self, notice: Notice) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(notice));
    }

    /// Subscribe to receive notices.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notice>> {
        self.sender.subscribe()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(256)
    }
}
