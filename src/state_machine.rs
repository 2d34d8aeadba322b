//! Owner conversation state machine
//!
//! Transitions are pure: `transition` maps a state record and an input to a
//! new state, a payload patch, and the effects the runtime must carry out
//! before the new state is committed.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, Keyboard};
pub use event::{
    ButtonAction, Command, Content, Event, MediaKind, MediaRef, OwnerInput, Sender,
    TargetSelector, UserId,
};
pub use state::{ConversationState, Label, Payload, PendingAction, StateRecord};
pub use transition::{can_transition, transition, TransitionError, TransitionResult};
