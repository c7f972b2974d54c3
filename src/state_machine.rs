//! Conversation engine
//!
//! Elm-style: [`transition`] is a pure function of (state, context, event)
//! over a [`Shop`](crate::runtime::Shop) handle, returning the next state and
//! the effects the runtime should carry out.

pub mod effect;
pub mod event;
pub mod outbound;
pub mod router;
pub mod state;
pub mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::{Event, InboundEnvelope, InboundMessage};
pub use outbound::OutboundMessage;
pub use state::{ConvContext, ConvState};
pub use transition::{transition, TransitionError, TransitionResult};
