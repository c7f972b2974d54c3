//! Runtime for processing conversations
//!
//! Glues the pure engine to storage, the chat transport and the payment
//! processor. One inbound message or one payment callback is one unit of
//! work; see [`ConversationRuntime`].

mod executor;
mod shop;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ConversationRuntime, RuntimeError};
#[allow(unused_imports)] // Used in tests
pub use shop::TxShop;
pub use traits::*;

use crate::payments::MpesaClient;
use crate::whatsapp::WhatsAppClient;

/// Type alias for production runtime with concrete implementations
pub type ProductionRuntime = ConversationRuntime<WhatsAppClient, MpesaClient>;
