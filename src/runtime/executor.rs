//! Per-message unit of work
//!
//! One inbound message is one turn: load the conversation, run the pure
//! transition against the open storage transaction, persist the new state
//! and the inbox entries, commit. Only then are replies sent and payment
//! initiation performed; the payment outcome is fed back as another event.

use super::shop::TxShop;
use super::traits::{ChatTransport, PaymentGateway};
use crate::db::{self, Database, DbError, InboxMessage, MessageSender, Order, OrderItem, Seller};
use crate::notify::{SellerEvent, SellerHub};
use crate::payments::{self, PaymentRequest, Reconciliation, StkCallback};
use crate::state_machine::event::InboundEnvelope;
use crate::state_machine::outbound::OutboundMessage;
use crate::state_machine::transition::{money, TransitionError};
use crate::state_machine::{transition, ConvContext, ConvState, Effect, Event};
use crate::whatsapp::TransportError;
use std::sync::Arc;
use thiserror::Error;

pub const SYSTEM_ERROR: &str = "Sorry, a system error occurred. Please try again later.";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TransitionError> for RuntimeError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Db(e) => RuntimeError::Db(e),
        }
    }
}

/// What one committed turn left for the async side to do
struct Turn {
    conversation_id: i64,
    from: ConvState,
    to: ConvState,
    effects: Vec<Effect>,
    inbox: Vec<InboxMessage>,
}

pub struct ConversationRuntime<T, P>
where
    T: ChatTransport,
    P: PaymentGateway,
{
    db: Database,
    transport: Arc<T>,
    payments: Arc<P>,
    hub: Arc<SellerHub>,
}

impl<T, P> ConversationRuntime<T, P>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    pub fn new(db: Database, transport: Arc<T>, payments: Arc<P>, hub: Arc<SellerHub>) -> Self {
        Self {
            db,
            transport,
            payments,
            hub,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn hub(&self) -> &Arc<SellerHub> {
        &self.hub
    }

    /// Process one customer message end to end.
    ///
    /// A storage failure rolls the turn back and the customer gets a generic
    /// apology; the error is still returned for logging.
    pub async fn handle_inbound(&self, envelope: InboundEnvelope) -> Result<(), RuntimeError> {
        let seller = self
            .db
            .read(|conn| db::find_seller_by_identity(conn, &envelope.business_id))?;
        let Some(seller) = seller else {
            tracing::warn!(
                business_id = %envelope.business_id,
                customer = %envelope.from,
                "Message for unknown business, dropping"
            );
            return Ok(());
        };

        // Process events in a loop: a payment outcome becomes the next event
        let mut events_to_process = vec![Event::Inbound(envelope.message.clone())];
        while let Some(event) = events_to_process.pop() {
            let turn = match self.run_turn(&seller, &envelope, &event) {
                Ok(turn) => turn,
                Err(e) => {
                    self.send(&envelope.from, &OutboundMessage::text(SYSTEM_ERROR))
                        .await;
                    return Err(e);
                }
            };

            tracing::info!(
                seller_id = seller.id,
                customer = %envelope.from,
                from = turn.from.name(),
                to = turn.to.name(),
                effects = turn.effects.len(),
                "Turn committed"
            );
            self.publish_messages(seller.id, turn.conversation_id, turn.inbox)
                .await;

            for effect in turn.effects {
                if let Some(next) = self.execute_effect(&envelope.from, effect).await {
                    events_to_process.push(next);
                }
            }
        }
        Ok(())
    }

    fn run_turn(
        &self,
        seller: &Seller,
        envelope: &InboundEnvelope,
        event: &Event,
    ) -> Result<Turn, RuntimeError> {
        self.db.transaction(|tx| {
            db::get_or_create_customer(tx, &envelope.from, envelope.customer_name.as_deref())?;
            let conversation = db::get_or_create_conversation(tx, &envelope.from, seller.id)?;

            let mut inbox = Vec::new();
            if let Event::Inbound(message) = event {
                inbox.push(db::record_message(
                    tx,
                    conversation.id,
                    MessageSender::Customer,
                    &message.summary(),
                )?);
            }

            let ctx = ConvContext::new(
                conversation.id,
                envelope.from.as_str(),
                seller.id,
                seller.display_name.as_str(),
            );
            let mut shop = TxShop::new(tx, &envelope.from, seller.id);
            let result = transition(&conversation.state, &ctx, &mut shop, event.clone())?;

            db::save_conversation_state(tx, conversation.id, &result.new_state)?;
            for reply in result.replies() {
                inbox.push(db::record_message(
                    tx,
                    conversation.id,
                    MessageSender::Bot,
                    reply.body(),
                )?);
            }

            Ok(Turn {
                conversation_id: conversation.id,
                from: conversation.state,
                to: result.new_state,
                effects: result.effects,
                inbox,
            })
        })
    }

    async fn execute_effect(&self, customer: &str, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Reply(message) => {
                self.send(customer, &message).await;
                None
            }
            Effect::InitiatePayment {
                order_id,
                amount,
                phone,
            } => {
                let request = PaymentRequest {
                    order_id,
                    amount,
                    phone,
                };
                match self.payments.initiate(&request).await {
                    Ok(checkout_reference) => {
                        tracing::info!(order_id, checkout_reference = %checkout_reference, "Payment prompt sent");
                        Some(Event::PaymentInitiated {
                            order_id,
                            amount: request.amount,
                            checkout_reference,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(order_id, kind = ?e.kind, error = %e, "Payment initiation failed");
                        Some(Event::PaymentInitiationFailed {
                            order_id,
                            reason: e.message,
                        })
                    }
                }
            }
        }
    }

    /// Best-effort send; failures are logged, never propagated
    async fn send(&self, to: &str, message: &OutboundMessage) {
        if let Err(e) = self.transport.send(to, message).await {
            tracing::error!(recipient = %to, error = %e, "Failed to send chat message");
        }
    }

    async fn publish_messages(&self, seller_id: i64, conversation_id: i64, inbox: Vec<InboxMessage>) {
        for message in inbox {
            self.hub
                .notify_seller(
                    seller_id,
                    SellerEvent::Message {
                        conversation_id,
                        message,
                    },
                )
                .await;
        }
    }

    /// Apply a payment callback, then notify everyone involved
    pub async fn handle_payment_callback(
        &self,
        callback: &StkCallback,
    ) -> Result<Reconciliation, RuntimeError> {
        let outcome = payments::reconcile(&self.db, callback)?;

        match &outcome {
            Reconciliation::Ignored(_) => {}
            Reconciliation::Paid {
                order,
                items,
                seller,
                conversation_id,
            } => {
                self.post_bot_message(order, *conversation_id, payment_confirmed_text(order))
                    .await;
                self.hub
                    .notify_seller(
                        seller.id,
                        SellerEvent::NewOrder {
                            order: order.clone(),
                            items: items.clone(),
                        },
                    )
                    .await;
                match &seller.alert_phone {
                    Some(phone) => {
                        self.send(phone, &OutboundMessage::text(seller_alert_text(order, items)))
                            .await;
                    }
                    None => {
                        tracing::info!(seller_id = seller.id, "No alert phone, skipping seller alert");
                    }
                }
            }
            Reconciliation::Failed {
                order,
                reason,
                conversation_id,
            } => {
                self.post_bot_message(order, *conversation_id, payment_failed_text(order, reason))
                    .await;
            }
        }
        Ok(outcome)
    }

    /// Send to the order's customer and keep a copy in the seller inbox
    async fn post_bot_message(&self, order: &Order, conversation_id: Option<i64>, text: String) {
        if let Some(conversation_id) = conversation_id {
            let recorded = self.db.transaction(|tx| {
                db::record_message(tx, conversation_id, MessageSender::Bot, &text)
            });
            match recorded {
                Ok(message) => {
                    self.publish_messages(order.seller_id, conversation_id, vec![message])
                        .await;
                }
                Err(e) => {
                    tracing::error!(order_id = order.id, error = %e, "Failed to record bot message");
                }
            }
        }
        self.send(&order.customer_phone, &OutboundMessage::text(text))
            .await;
    }

    /// A seller typing into a conversation from the dashboard
    pub async fn send_seller_message(
        &self,
        seller_id: i64,
        conversation_id: i64,
        content: &str,
    ) -> Result<InboxMessage, RuntimeError> {
        let (customer_phone, message) = self.db.transaction(|tx| {
            let conversation = db::get_conversation(tx, conversation_id)?;
            if conversation.seller_id != seller_id {
                return Err(DbError::ConversationNotFound(conversation_id));
            }
            let message = db::record_message(tx, conversation_id, MessageSender::Seller, content)?;
            Ok((conversation.customer_phone, message))
        })?;

        self.publish_messages(seller_id, conversation_id, vec![message.clone()])
            .await;
        self.transport
            .send(&customer_phone, &OutboundMessage::text(content))
            .await?;
        Ok(message)
    }
}

fn payment_confirmed_text(order: &Order) -> String {
    format!(
        "✅ Payment successful!\n\n\
         Thank you for your order. Your Order ID is *#{}*.\n\n\
         We have received your payment of {}. We will begin processing it shortly.",
        order.id,
        money(order.total_amount)
    )
}

fn seller_alert_text(order: &Order, items: &[OrderItem]) -> String {
    let lines = items
        .iter()
        .map(|item| format!("- {} x {}", item.quantity, item.product_name))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "🎉 New Paid Order!\n\n\
         You have a new order (#{}) for *{}*.\n\n\
         Items:\n{lines}\n\n\
         Please log in to your dashboard to approve and fulfill the order.",
        order.id,
        money(order.total_amount)
    )
}

fn payment_failed_text(order: &Order, reason: &str) -> String {
    format!(
        "❌ Payment Failed\n\n\
         The payment for your order #{} was not completed.\n\
         Reason: {reason}\n\n\
         Your items are back in your cart. Type 'view cart' to check out again.",
        order.id
    )
}
