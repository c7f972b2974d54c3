//! Mobile-money payments
//!
//! Initiation goes out through [`MpesaClient`]; the result comes back as an
//! asynchronous callback that [`reconcile`] applies to the order exactly once.

mod callback;
mod mpesa;

pub use callback::{CallbackMetadata, MetadataItem, StkCallback};
pub use mpesa::{MpesaClient, MpesaConfig, SANDBOX_BASE_URL};

use crate::db::{self, Database, DbResult, Order, OrderItem, OrderStatus, Seller};
use crate::state_machine::ConvState;
use rusqlite::Connection;
use rust_decimal::Decimal;
use thiserror::Error;

/// Payment initiation error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PaymentError {
    pub kind: PaymentErrorKind,
    pub message: String,
}

impl PaymentError {
    pub fn new(kind: PaymentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorKind::NotConfigured, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorKind::Network, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorKind::Rejected, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(PaymentErrorKind::InvalidResponse, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentErrorKind {
    /// Credentials or callback domain missing
    NotConfigured,
    /// Timeouts, refused connections
    Network,
    /// The processor answered but declined
    Rejected,
    /// The processor answered with something unreadable
    InvalidResponse,
}

/// What to charge, and whom
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub order_id: i64,
    pub amount: Decimal,
    pub phone: String,
}

/// Why a callback changed nothing
#[derive(Debug, Clone, PartialEq)]
pub enum IgnoreReason {
    MissingReference,
    UnknownReference(String),
    AlreadySettled { order_id: i64, status: OrderStatus },
}

/// Outcome of applying one callback
#[derive(Debug, Clone)]
pub enum Reconciliation {
    Ignored(IgnoreReason),
    Paid {
        order: Order,
        items: Vec<OrderItem>,
        seller: Seller,
        conversation_id: Option<i64>,
    },
    Failed {
        order: Order,
        reason: String,
        conversation_id: Option<i64>,
    },
}

/// Apply a payment result to the order it correlates with.
///
/// Only an order still in `PENDING_PAYMENT` is touched, so redelivered
/// callbacks fall through as [`IgnoreReason::AlreadySettled`]. The whole
/// read-check-write runs in one immediate transaction.
pub fn reconcile(db: &Database, callback: &StkCallback) -> DbResult<Reconciliation> {
    let Some(reference) = callback.checkout_reference() else {
        tracing::info!("Payment callback without checkout reference");
        return Ok(Reconciliation::Ignored(IgnoreReason::MissingReference));
    };

    db.transaction(|tx| {
        let Some(order) = db::find_order_by_checkout_reference(tx, reference)? else {
            tracing::warn!(reference, "Payment callback for unknown checkout reference");
            return Ok(Reconciliation::Ignored(IgnoreReason::UnknownReference(
                reference.to_string(),
            )));
        };
        if order.status != OrderStatus::PendingPayment {
            tracing::info!(
                order_id = order.id,
                status = %order.status,
                "Duplicate payment callback ignored"
            );
            return Ok(Reconciliation::Ignored(IgnoreReason::AlreadySettled {
                order_id: order.id,
                status: order.status,
            }));
        }

        let conversation_id = release_conversation(tx, &order)?;

        if callback.is_success() {
            let receipt = callback.receipt_number();
            let order = db::settle_order(
                tx,
                order.id,
                OrderStatus::PendingApproval,
                receipt.as_deref(),
            )?;
            let items = db::order_items(tx, order.id)?;
            for item in &items {
                let Some(product_id) = item.product_id else {
                    continue;
                };
                if db::decrement_inventory(tx, product_id, item.quantity)?.is_none() {
                    tracing::warn!(product_id, "Paid item's product no longer exists");
                }
            }
            let seller = db::get_seller(tx, order.seller_id)?;
            tracing::info!(order_id = order.id, receipt = ?receipt, "Payment confirmed");
            Ok(Reconciliation::Paid {
                order,
                items,
                seller,
                conversation_id,
            })
        } else {
            let order = db::settle_order(tx, order.id, OrderStatus::Failed, None)?;
            db::restore_items_into_cart(tx, &order)?;
            let reason = callback.description().to_string();
            tracing::info!(order_id = order.id, reason = %reason, "Payment failed");
            Ok(Reconciliation::Failed {
                order,
                reason,
                conversation_id,
            })
        }
    })
}

/// Put a conversation parked on this payment back at the menu
fn release_conversation(conn: &Connection, order: &Order) -> DbResult<Option<i64>> {
    let Some(conversation) =
        db::find_conversation(conn, &order.customer_phone, order.seller_id)?
    else {
        return Ok(None);
    };
    if conversation.state == ConvState::AwaitingPaymentConfirmation {
        db::save_conversation_state(conn, conversation.id, &ConvState::AwaitingCommand)?;
    }
    Ok(Some(conversation.id))
}
