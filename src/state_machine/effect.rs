//! Effects produced by state transitions

use super::outbound::OutboundMessage;
use rust_decimal::Decimal;

/// Effects to be executed after the transition's storage work commits
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a message back to the customer
    Reply(OutboundMessage),

    /// Push a payment request to the customer's phone.
    ///
    /// Runs outside the storage transaction; its outcome comes back as
    /// `Event::PaymentInitiated` or `Event::PaymentInitiationFailed`.
    InitiatePayment {
        order_id: i64,
        amount: Decimal,
        phone: String,
    },
}

impl Effect {
    pub fn reply(message: impl Into<OutboundMessage>) -> Self {
        Effect::Reply(message.into())
    }
}
