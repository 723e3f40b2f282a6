//! Task lifecycle: the transition table and the state machine that applies it.
//!
//! Every status change in the system goes through [`LifecycleStateMachine`],
//! which validates it against [`TRANSITIONS`], persists the destination and only
//! then publishes the resulting events.

mod machine;
mod table;

pub use machine::{LifecycleStateMachine, SystemNotice};
pub use table::{TRANSITIONS, Trigger, allowed_triggers, next_state};
