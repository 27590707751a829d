//! The parley flow runtime.
//!
//! - [`Session`]: the deterministic scheduler for one conversation. It
//!   matches events against waiting flow instances, advances consumers,
//!   and cascades the events they produce to a fixed point.
//! - [`Runtime`]: hosts many sessions on tokio tasks and runs their action
//!   calls and timers.
//! - [`actions`]: built-in actions flows can execute.

pub mod actions;
pub mod bridge;
pub mod driver;
pub mod instance;
pub mod matcher;
pub mod scope;
pub mod session;
pub mod timer;

pub use actions::{FnAction, GenerateText, RenderUtterance, TextGenerator, builtin_actions};
pub use driver::{Runtime, RuntimeOptions, SessionStart};
pub use instance::{FlowInstance, InstanceStatus};
pub use matcher::{MatchOutcome, match_event};
pub use session::{InstanceFailure, Session, SessionLimits, Turn, TurnState};
