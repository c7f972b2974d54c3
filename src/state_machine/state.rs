//! Conversation state types

use serde::{Deserialize, Serialize};

// ============================================================================
// Conversation State
// ============================================================================

/// Where a (customer, seller) chat currently is.
///
/// Data that one step hands to the next lives on the variant itself, so a
/// handler can only read what the previous step could have set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// First contact, nothing shown yet
    #[default]
    Started,

    /// Home state: the main menu is on screen
    AwaitingCommand,

    /// A product list or a search prompt is on screen
    AwaitingProductSelection,

    /// A product detail view is on screen
    AwaitingProductAction { product_id: i64 },

    /// Sizes for `product_id` are on screen
    AwaitingSizeSelection { product_id: i64 },

    /// Asked "how many?" for `product_id` in `size`
    AwaitingQuantity {
        product_id: i64,
        #[serde(default)]
        size: Option<String>,
    },

    /// The cart summary is on screen
    ViewingCart,

    /// Delivery or pickup prompt is on screen
    AwaitingDeliveryChoice,

    /// Asked for a delivery address
    AwaitingDeliveryAddress,

    /// Payment push issued (or being retried); waits for the payment callback
    AwaitingPaymentConfirmation,
}

impl ConvState {
    /// Stable upper-case name, used in logs and the seller API
    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Started => "STARTED",
            ConvState::AwaitingCommand => "AWAITING_COMMAND",
            ConvState::AwaitingProductSelection => "AWAITING_PRODUCT_SELECTION",
            ConvState::AwaitingProductAction { .. } => "AWAITING_PRODUCT_ACTION",
            ConvState::AwaitingSizeSelection { .. } => "AWAITING_SIZE_SELECTION",
            ConvState::AwaitingQuantity { .. } => "AWAITING_QUANTITY",
            ConvState::ViewingCart => "VIEWING_CART",
            ConvState::AwaitingDeliveryChoice => "AWAITING_DELIVERY_CHOICE",
            ConvState::AwaitingDeliveryAddress => "AWAITING_DELIVERY_ADDRESS",
            ConvState::AwaitingPaymentConfirmation => "AWAITING_PAYMENT_CONFIRMATION",
        }
    }

    /// Decode a persisted state, falling back to the home state.
    ///
    /// An undecodable row means the stored JSON predates the current variants
    /// or was corrupted; the menu is always a safe place to resume.
    pub fn from_stored(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(stored = %raw, error = %e, "Unrecognized conversation state, resetting to menu");
            ConvState::AwaitingCommand
        })
    }

    pub fn to_stored(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"awaiting_command"}"#.to_string())
    }
}

/// Who the engine is talking to, fixed for the duration of one message
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: i64,
    pub customer_phone: String,
    pub seller_id: i64,
    pub seller_name: String,
}

impl ConvContext {
    pub fn new(
        conversation_id: i64,
        customer_phone: impl Into<String>,
        seller_id: i64,
        seller_name: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            customer_phone: customer_phone.into(),
            seller_id,
            seller_name: seller_name.into(),
        }
    }
}
