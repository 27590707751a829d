//! Action bridge bookkeeping.
//!
//! The scheduler never runs actions itself. `execute` allocates a call id,
//! records which instance waits on it, and queues an [`ActionRequest`] for
//! whoever drives the session. Completions come back by call id and are
//! delivered exactly once; completions for cancelled calls are discarded.

use parley_core::{ActionRequest, CallId, InstanceId, Params};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct PendingCall {
    instance: InstanceId,
    action: String,
    cancelled: bool,
}

/// What to do with an incoming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Deliver to the waiting instance.
    Deliver { instance: InstanceId, action: String },
    /// The waiting instance is gone; drop the result.
    Discard { action: String },
    /// Unknown or already-completed call id.
    Unknown,
}

#[derive(Debug, Default)]
pub struct ActionBridge {
    pending: BTreeMap<CallId, PendingCall>,
    queue: Vec<ActionRequest>,
    next_id: u64,
}

impl ActionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and queue its request.
    pub fn start(&mut self, instance: InstanceId, action: &str, params: Params) -> CallId {
        self.next_id += 1;
        let call_id = CallId(self.next_id);
        self.pending.insert(
            call_id,
            PendingCall {
                instance,
                action: action.to_string(),
                cancelled: false,
            },
        );
        self.queue.push(ActionRequest {
            call_id,
            action: action.to_string(),
            params,
        });
        call_id
    }

    /// Requests queued since the last call.
    pub fn take_requests(&mut self) -> Vec<ActionRequest> {
        std::mem::take(&mut self.queue)
    }

    /// Resolve a completion. Each call id resolves at most once.
    pub fn complete(&mut self, call_id: CallId) -> Completion {
        match self.pending.remove(&call_id) {
            None => Completion::Unknown,
            Some(call) if call.cancelled => Completion::Discard {
                action: call.action,
            },
            Some(call) => Completion::Deliver {
                instance: call.instance,
                action: call.action,
            },
        }
    }

    /// Cancel one call. A request not yet handed out is dropped outright.
    pub fn cancel(&mut self, call_id: CallId) {
        if let Some(pos) = self.queue.iter().position(|r| r.call_id == call_id) {
            self.queue.remove(pos);
            self.pending.remove(&call_id);
        } else if let Some(call) = self.pending.get_mut(&call_id) {
            call.cancelled = true;
        }
    }

    /// Cancel every call owned by `instance`.
    pub fn cancel_instance(&mut self, instance: InstanceId) {
        let owned: Vec<CallId> = self
            .pending
            .iter()
            .filter(|(_, call)| call.instance == instance && !call.cancelled)
            .map(|(id, _)| *id)
            .collect();
        for call_id in owned {
            self.cancel(call_id);
        }
    }

    /// Calls still awaiting a completion that will be delivered.
    pub fn in_flight(&self) -> usize {
        self.pending.values().filter(|c| !c.cancelled).count()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
    }
}
