//! Trait abstractions for runtime I/O
//!
//! These traits let the engine and the runtime run against mocks in tests.

use crate::db::{Cart, DbResult, DeliveryAddress, DeliveryOption, Order, Product};
use crate::payments::{MpesaClient, PaymentError, PaymentRequest};
use crate::state_machine::outbound::OutboundMessage;
use crate::whatsapp::{TransportError, WhatsAppClient};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Catalog and cart access for one (customer, seller) pair.
///
/// Synchronous on purpose: the production implementation borrows the open
/// storage transaction of the current message, so every read and write of
/// one turn commits or rolls back together.
pub trait Shop {
    fn find_active_product(&mut self, product_id: i64) -> DbResult<Option<Product>>;

    /// Active products whose name contains `name_contains`, case-insensitively
    fn search_active_products(&mut self, name_contains: &str) -> DbResult<Vec<Product>>;

    fn list_active_products(&mut self, limit: usize) -> DbResult<Vec<Product>>;

    /// The open cart, if any
    fn current_cart(&mut self) -> DbResult<Option<Cart>>;

    /// Add to (or open) the cart and return it with its recomputed total
    fn add_to_cart(&mut self, product: &Product, quantity: u32, size: Option<&str>)
        -> DbResult<Cart>;

    /// `None` when there is no open cart
    fn set_delivery_option(&mut self, option: DeliveryOption) -> DbResult<Option<Order>>;

    fn set_delivery_address(&mut self, address: &DeliveryAddress) -> DbResult<Option<Order>>;

    /// Mark a payment push as in flight; false while another one is
    fn claim_payment_request(&mut self, order_id: i64) -> DbResult<bool>;

    fn release_payment_request(&mut self, order_id: i64) -> DbResult<()>;

    /// Record the payment correlation id and close the cart, provided its
    /// total still equals the `amount` that was pushed
    fn mark_pending_payment(
        &mut self,
        order_id: i64,
        checkout_reference: &str,
        amount: Decimal,
    ) -> DbResult<Order>;

    /// Latest order still waiting for its payment callback
    fn awaiting_payment(&mut self) -> DbResult<Option<Order>>;
}

/// Outbound side of the chat platform
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Push-payment initiation
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the processor to prompt the payer; returns the processor's
    /// correlation id for the later callback
    async fn initiate(&self, request: &PaymentRequest) -> Result<String, PaymentError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        (**self).send(to, message).await
    }
}

#[async_trait]
impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    async fn initiate(&self, request: &PaymentRequest) -> Result<String, PaymentError> {
        (**self).initiate(request).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

#[async_trait]
impl ChatTransport for WhatsAppClient {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        self.send_message(to, message).await
    }
}

#[async_trait]
impl PaymentGateway for MpesaClient {
    async fn initiate(&self, request: &PaymentRequest) -> Result<String, PaymentError> {
        self.stk_push(request).await
    }
}
