//! # parley core
//!
//! Domain types, traits, and error definitions for the parley
//! conversational-flow runtime. This crate holds no engine logic: it defines
//! the vocabulary every other crate speaks.
//!
//! ## Contents
//!
//! - [`Value`] / [`Params`]: the closed tagged-value type used for event
//!   payloads, flow variables, and action results
//! - [`Event`]: the immutable typed record exchanged between the runtime,
//!   the outside world, and flows
//! - [`Action`] / [`ActionRegistry`]: external capabilities reached through
//!   the action bridge
//! - [`Notice`] / [`NoticeBus`]: structured runtime notices for observers
//! - [`Error`] and the per-context error enums

pub mod action;
pub mod error;
pub mod event;
pub mod ids;
pub mod notice;
pub mod value;

// Re-export key types at crate root for ergonomics
pub use action::{Action, ActionRegistry, ActionRequest};
pub use error::{ActionError, Error, FlowError, Result, RuntimeError};
pub use event::{Event, names};
pub use ids::{CallId, InstanceId, SessionId, TimerId};
pub use notice::{Notice, NoticeBus};
pub use value::{Params, Value};
