//! Database schema and record types

pub use crate::state_machine::state::ConvState;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sellers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    chat_identity TEXT NOT NULL UNIQUE,
    alert_phone TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
    phone_number TEXT PRIMARY KEY,
    name TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    price TEXT NOT NULL,
    sizes TEXT NOT NULL DEFAULT '[]',
    inventory_count INTEGER NOT NULL DEFAULT 0 CHECK (inventory_count >= 0),
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,

    FOREIGN KEY (seller_id) REFERENCES sellers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_products_seller ON products(seller_id, is_active);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_phone TEXT NOT NULL,
    seller_id INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT '{"type":"started"}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE (customer_phone, seller_id),
    FOREIGN KEY (customer_phone) REFERENCES customers(phone_number) ON DELETE CASCADE,
    FOREIGN KEY (seller_id) REFERENCES sellers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_conversations_seller ON conversations(seller_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_phone TEXT NOT NULL,
    seller_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'IN_PROGRESS',
    total_amount TEXT NOT NULL DEFAULT '0',
    delivery_option TEXT,
    delivery_address_text TEXT,
    delivery_latitude REAL,
    delivery_longitude REAL,
    payment_checkout_reference TEXT UNIQUE,
    payment_transaction_id TEXT,
    -- Set while a payment push for this cart is in flight
    payment_requested_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (customer_phone) REFERENCES customers(phone_number),
    FOREIGN KEY (seller_id) REFERENCES sellers(id) ON DELETE CASCADE
);

-- At most one open cart per (customer, seller)
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_single_cart
    ON orders(customer_phone, seller_id) WHERE status = 'IN_PROGRESS';
CREATE INDEX IF NOT EXISTS idx_orders_seller ON orders(seller_id, created_at DESC);

CREATE TABLE IF NOT EXISTS order_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL,
    product_id INTEGER,
    product_name TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0 AND quantity <= 4294967295),
    price_at_time_of_purchase TEXT NOT NULL,
    selected_size TEXT NOT NULL DEFAULT '',

    UNIQUE (order_id, product_id, selected_size),
    FOREIGN KEY (order_id) REFERENCES orders(id) ON DELETE CASCADE,
    FOREIGN KEY (product_id) REFERENCES products(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id INTEGER NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
"#;

/// A business selling over chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Seller {
    pub id: i64,
    pub display_name: String,
    /// Business phone-number id on the chat platform
    pub chat_identity: String,
    /// Personal number that receives new-order alerts
    pub alert_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub phone_number: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub seller_id: i64,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub sizes: Vec<String>,
    pub inventory_count: i64,
    pub is_active: bool,
}

impl Product {
    pub fn has_sizes(&self) -> bool {
        !self.sizes.is_empty()
    }
}

/// One (customer, seller) chat thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub customer_phone: String,
    pub seller_id: i64,
    pub state: ConvState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order lifecycle
///
/// Only `InProgress` orders are mutable carts; everything after it is
/// written by checkout, reconciliation, or the seller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    InProgress,
    PendingPayment,
    PendingApproval,
    Processing,
    ReadyForPickup,
    OutForDelivery,
    Delivered,
    PickedUp,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::PendingApproval => "PENDING_APPROVAL",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::ReadyForPickup => "READY_FOR_PICKUP",
            OrderStatus::OutForDelivery => "OUT_FOR_DELIVERY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::PickedUp => "PICKED_UP",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "IN_PROGRESS" => OrderStatus::InProgress,
            "PENDING_PAYMENT" => OrderStatus::PendingPayment,
            "PENDING_APPROVAL" => OrderStatus::PendingApproval,
            "PROCESSING" => OrderStatus::Processing,
            "READY_FOR_PICKUP" => OrderStatus::ReadyForPickup,
            "OUT_FOR_DELIVERY" => OrderStatus::OutForDelivery,
            "DELIVERED" => OrderStatus::Delivered,
            "PICKED_UP" => OrderStatus::PickedUp,
            "CANCELLED" => OrderStatus::Cancelled,
            "FAILED" => OrderStatus::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryOption {
    Pickup,
    Delivery,
}

impl DeliveryOption {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOption::Pickup => "PICKUP",
            DeliveryOption::Delivery => "DELIVERY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PICKUP" => Some(DeliveryOption::Pickup),
            "DELIVERY" => Some(DeliveryOption::Delivery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Where a delivery goes: free text, a shared pin, or both
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryAddress {
    pub text: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl DeliveryAddress {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            coordinates: None,
        }
    }

    pub fn pin(latitude: f64, longitude: f64, label: Option<String>) -> Self {
        Self {
            text: label,
            coordinates: Some(Coordinates {
                latitude,
                longitude,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: i64,
    pub customer_phone: String,
    pub seller_id: i64,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub delivery_option: Option<DeliveryOption>,
    pub delivery_address: DeliveryAddress,
    pub payment_checkout_reference: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of an order
///
/// `product_name` and the price are snapshots, so a line survives the
/// product being renamed, repriced, or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub quantity: u32,
    pub price_at_time_of_purchase: Decimal,
    pub selected_size: Option<String>,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.price_at_time_of_purchase * Decimal::from(self.quantity)
    }
}

/// An `InProgress` order together with its lines
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Cart {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of line totals; equals `order.total_amount` after any write
    #[allow(dead_code)] // Used in tests
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(OrderItem::line_total).sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Customer,
    Seller,
    Bot,
}

impl MessageSender {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSender::Customer => "customer",
            MessageSender::Seller => "seller",
            MessageSender::Bot => "bot",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "customer" => MessageSender::Customer,
            "seller" => MessageSender::Seller,
            _ => MessageSender::Bot,
        }
    }
}

/// Message as shown in the seller inbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxMessage {
    pub id: String,
    pub conversation_id: i64,
    pub sender: MessageSender,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
