//! Database module for the chat shop
//!
//! Persistence for sellers, customers, conversations, carts/orders and the
//! seller inbox. Every unit of work runs through [`Database::transaction`],
//! which takes SQLite's write lock up front (`BEGIN IMMEDIATE`) so that two
//! messages touching the same cart, or two deliveries of the same payment
//! callback, never interleave.

mod analytics;
mod cart;
mod catalog;
mod schema;

pub use analytics::*;
pub use cart::*;
pub use catalog::*;
pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database lock poisoned")]
    LockPoisoned,
    #[error("Seller not found: {0}")]
    SellerNotFound(i64),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(i64),
    #[error("Order not found: {0}")]
    OrderNotFound(i64),
    #[error("Order {order_id} is {status}, only IN_PROGRESS orders can be changed")]
    OrderNotMutable { order_id: i64, status: OrderStatus },
    #[error("Quantity must be at least 1, got {0}")]
    InvalidQuantity(u32),
    #[error("Line quantity on order {order_id} would exceed {max}", max = u32::MAX)]
    QuantityTooLarge { order_id: i64 },
    #[error("Order {order_id} totals {total} but {charged} was requested")]
    AmountMismatch {
        order_id: i64,
        charged: Decimal,
        total: Decimal,
    },
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        // Databases created before in-flight payment tracking; fails harmlessly once applied
        let _ = conn.execute("ALTER TABLE orders ADD COLUMN payment_requested_at TEXT", []);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DbError::from)?;
        Ok(value)
    }

    /// Run a read-only query against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }
}

// ==================== Sellers ====================

/// Fields for a new tenant
#[allow(dead_code)] // Used in tests
#[derive(Debug, Clone)]
pub struct NewSeller<'a> {
    pub display_name: &'a str,
    pub chat_identity: &'a str,
    pub alert_phone: Option<&'a str>,
}

/// Create a seller together with its profile in one statement
#[allow(dead_code)] // Used in tests
pub fn register_seller(conn: &Connection, seller: &NewSeller<'_>) -> DbResult<Seller> {
    conn.execute(
        "INSERT INTO sellers (display_name, chat_identity, alert_phone, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            seller.display_name,
            seller.chat_identity,
            seller.alert_phone,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(Seller {
        id: conn.last_insert_rowid(),
        display_name: seller.display_name.to_string(),
        chat_identity: seller.chat_identity.to_string(),
        alert_phone: seller.alert_phone.map(String::from),
    })
}

const SELLER_COLUMNS: &str = "id, display_name, chat_identity, alert_phone";

fn seller_from_row(row: &Row<'_>) -> rusqlite::Result<Seller> {
    Ok(Seller {
        id: row.get(0)?,
        display_name: row.get(1)?,
        chat_identity: row.get(2)?,
        alert_phone: row.get(3)?,
    })
}

/// Resolve the business identity a customer wrote to
pub fn find_seller_by_identity(conn: &Connection, chat_identity: &str) -> DbResult<Option<Seller>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SELLER_COLUMNS} FROM sellers WHERE chat_identity = ?1"),
            params![chat_identity],
            seller_from_row,
        )
        .optional()?)
}

pub fn get_seller(conn: &Connection, id: i64) -> DbResult<Seller> {
    conn.query_row(
        &format!("SELECT {SELLER_COLUMNS} FROM sellers WHERE id = ?1"),
        params![id],
        seller_from_row,
    )
    .optional()?
    .ok_or(DbError::SellerNotFound(id))
}

// ==================== Customers ====================

/// Fetch the customer, creating it on first contact.
///
/// A profile name fills in `name` only while it is still empty.
pub fn get_or_create_customer(
    conn: &Connection,
    phone_number: &str,
    name: Option<&str>,
) -> DbResult<Customer> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO customers (phone_number, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (phone_number) DO UPDATE
            SET name = COALESCE(NULLIF(customers.name, ''), excluded.name)",
        params![phone_number, name, now],
    )?;
    Ok(conn.query_row(
        "SELECT phone_number, name, created_at FROM customers WHERE phone_number = ?1",
        params![phone_number],
        |row| {
            Ok(Customer {
                phone_number: row.get(0)?,
                name: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
            })
        },
    )?)
}

// ==================== Conversations ====================

const CONVERSATION_COLUMNS: &str = "id, customer_phone, seller_id, state, created_at, updated_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let state_json: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        customer_phone: row.get(1)?,
        seller_id: row.get(2)?,
        state: ConvState::from_stored(&state_json),
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

/// Fetch the one conversation for this pair, creating it in `Started`
pub fn get_or_create_conversation(
    conn: &Connection,
    customer_phone: &str,
    seller_id: i64,
) -> DbResult<Conversation> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (customer_phone, seller_id, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (customer_phone, seller_id) DO NOTHING",
        params![customer_phone, seller_id, ConvState::Started.to_stored(), now],
    )?;
    Ok(conn.query_row(
        &format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE customer_phone = ?1 AND seller_id = ?2"
        ),
        params![customer_phone, seller_id],
        conversation_from_row,
    )?)
}

pub fn find_conversation(
    conn: &Connection,
    customer_phone: &str,
    seller_id: i64,
) -> DbResult<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE customer_phone = ?1 AND seller_id = ?2"
            ),
            params![customer_phone, seller_id],
            conversation_from_row,
        )
        .optional()?)
}

pub fn get_conversation(conn: &Connection, id: i64) -> DbResult<Conversation> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![id],
        conversation_from_row,
    )
    .optional()?
    .ok_or(DbError::ConversationNotFound(id))
}

/// Persist the state; also bumps `updated_at` when the state is unchanged
pub fn save_conversation_state(conn: &Connection, id: i64, state: &ConvState) -> DbResult<()> {
    let updated = conn.execute(
        "UPDATE conversations SET state = ?1, updated_at = ?2 WHERE id = ?3",
        params![state.to_stored(), Utc::now().to_rfc3339(), id],
    )?;
    if updated == 0 {
        return Err(DbError::ConversationNotFound(id));
    }
    Ok(())
}

/// A seller's conversations, most recently active first
pub fn list_conversations(conn: &Connection, seller_id: i64) -> DbResult<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE seller_id = ?1 ORDER BY updated_at DESC"
    ))?;
    let rows = stmt.query_map(params![seller_id], conversation_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ==================== Inbox messages ====================

pub fn record_message(
    conn: &Connection,
    conversation_id: i64,
    sender: MessageSender,
    content: &str,
) -> DbResult<InboxMessage> {
    let message = InboxMessage {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id,
        sender,
        content: content.to_string(),
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id,
            conversation_id,
            sender.as_str(),
            content,
            message.created_at.to_rfc3339()
        ],
    )?;
    Ok(message)
}

/// Messages of one conversation in the order they were exchanged
pub fn list_messages(conn: &Connection, conversation_id: i64) -> DbResult<Vec<InboxMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sender, content, created_at FROM messages
         WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok(InboxMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender: MessageSender::parse(&row.get::<_, String>(2)?),
            content: row.get(3)?,
            created_at: parse_datetime(&row.get::<_, String>(4)?),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ==================== Helpers ====================

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

/// Read a money column stored as canonical decimal text
fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
