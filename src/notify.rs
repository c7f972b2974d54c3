//! Seller notification fan-out
//!
//! One broadcast channel per seller; every live dashboard session of that
//! seller subscribes to it. Delivery is best effort: with nobody listening
//! an event is dropped, and a lagging subscriber skips what it missed.

use crate::db::{InboxMessage, Order, OrderItem, Seller};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 64;

/// Events pushed to a seller's live sessions
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SellerEvent {
    /// First event on every stream
    Init { seller: Seller, orders: Vec<Order> },
    NewOrder { order: Order, items: Vec<OrderItem> },
    Message {
        conversation_id: i64,
        message: InboxMessage,
    },
}

impl SellerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SellerEvent::Init { .. } => "init",
            SellerEvent::NewOrder { .. } => "new_order",
            SellerEvent::Message { .. } => "message",
        }
    }
}

#[derive(Default)]
pub struct SellerHub {
    groups: RwLock<HashMap<i64, broadcast::Sender<SellerEvent>>>,
}

impl SellerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the seller's group
    pub async fn subscribe(&self, seller_id: i64) -> broadcast::Receiver<SellerEvent> {
        let mut groups = self.groups.write().await;
        groups.retain(|_, tx| tx.receiver_count() > 0);
        groups
            .entry(seller_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to every connected session of the seller; never fails
    pub async fn notify_seller(&self, seller_id: i64, event: SellerEvent) {
        let groups = self.groups.read().await;
        let Some(tx) = groups.get(&seller_id) else {
            tracing::debug!(seller_id, kind = event.kind(), "No live sessions for seller");
            return;
        };
        if let Ok(delivered) = tx.send(event) {
            tracing::debug!(seller_id, delivered, "Seller event published");
        }
    }
}
