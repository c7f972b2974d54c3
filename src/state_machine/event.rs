//! Events that can occur in a conversation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// Customer sent something over chat
    Inbound(InboundMessage),

    // Payment bridge outcomes, fed back by the runtime
    PaymentInitiated {
        order_id: i64,
        /// What the push asked the payer for
        amount: Decimal,
        checkout_reference: String,
    },
    PaymentInitiationFailed {
        order_id: i64,
        reason: String,
    },
}

/// One message as handed over by the chat transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Text {
        body: String,
    },
    ButtonReply {
        id: String,
        title: String,
    },
    ListReply {
        id: String,
        title: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        address: Option<String>,
    },
    /// Anything the engine has no handler for (images, stickers, ...)
    Unsupported {
        kind: String,
    },
}

impl InboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        InboundMessage::Text { body: body.into() }
    }

    pub fn button(id: impl Into<String>) -> Self {
        let id = id.into();
        InboundMessage::ButtonReply {
            title: id.clone(),
            id,
        }
    }

    pub fn list(id: impl Into<String>) -> Self {
        let id = id.into();
        InboundMessage::ListReply {
            title: id.clone(),
            id,
        }
    }

    /// Id of the tapped button or list row
    pub fn reply_id(&self) -> Option<&str> {
        match self {
            InboundMessage::ButtonReply { id, .. } | InboundMessage::ListReply { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }

    pub fn text_body(&self) -> Option<&str> {
        match self {
            InboundMessage::Text { body } => Some(body),
            _ => None,
        }
    }

    /// Human-readable rendering for the seller inbox
    pub fn summary(&self) -> String {
        match self {
            InboundMessage::Text { body } => body.clone(),
            InboundMessage::ButtonReply { title, .. } | InboundMessage::ListReply { title, .. } => {
                format!("[selected] {title}")
            }
            InboundMessage::Location {
                latitude,
                longitude,
                address,
            } => match address {
                Some(address) => format!("[location] {address} ({latitude}, {longitude})"),
                None => format!("[location] ({latitude}, {longitude})"),
            },
            InboundMessage::Unsupported { kind } => format!("[{kind}]"),
        }
    }
}

/// Inbound message plus the routing facts the transport resolved
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Transport identity of the business number the customer wrote to
    pub business_id: String,
    /// Customer identity (phone number)
    pub from: String,
    /// Profile name, when the transport shares one
    pub customer_name: Option<String>,
    pub message: InboundMessage,
}
