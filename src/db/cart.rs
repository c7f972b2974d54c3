//! Cart and order persistence
//!
//! The cart is the single `IN_PROGRESS` order of a (customer, seller) pair.
//! Every item write is followed by [`recompute_total`], which is the only
//! place `total_amount` is written.

use super::{get_decimal, parse_datetime, DbError, DbResult};
use super::{Cart, Coordinates, DeliveryAddress, DeliveryOption, Order, OrderItem, OrderStatus, Product};
use chrono::{Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

/// How long a payment push may stay unanswered before the cart can be
/// charged again. Covers the token fetch plus the push, each with its own
/// HTTP timeout.
const PAYMENT_REQUEST_WINDOW_SECS: i64 = 90;

const ORDER_COLUMNS: &str = "id, customer_phone, seller_id, status, total_amount, delivery_option,
    delivery_address_text, delivery_latitude, delivery_longitude,
    payment_checkout_reference, payment_transaction_id, created_at, updated_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let status: String = row.get(3)?;
    let delivery_option: Option<String> = row.get(5)?;
    let latitude: Option<f64> = row.get(7)?;
    let longitude: Option<f64> = row.get(8)?;
    Ok(Order {
        id: row.get(0)?,
        customer_phone: row.get(1)?,
        seller_id: row.get(2)?,
        status: OrderStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown order status {status}").into(),
            )
        })?,
        total_amount: get_decimal(row, 4)?,
        delivery_option: delivery_option.as_deref().and_then(DeliveryOption::parse),
        delivery_address: DeliveryAddress {
            text: row.get(6)?,
            coordinates: latitude.zip(longitude).map(|(latitude, longitude)| Coordinates {
                latitude,
                longitude,
            }),
        },
        payment_checkout_reference: row.get(9)?,
        payment_transaction_id: row.get(10)?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<OrderItem> {
    let size: String = row.get(6)?;
    let quantity: i64 = row.get(4)?;
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        product_id: row.get(2)?,
        product_name: row.get(3)?,
        quantity: u32::try_from(quantity)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Integer, Box::new(e)))?,
        price_at_time_of_purchase: get_decimal(row, 5)?,
        selected_size: (!size.is_empty()).then_some(size),
    })
}

pub fn get_order(conn: &Connection, order_id: i64) -> DbResult<Order> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        order_from_row,
    )
    .optional()?
    .ok_or(DbError::OrderNotFound(order_id))
}

pub fn order_items(conn: &Connection, order_id: i64) -> DbResult<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, product_name, quantity, price_at_time_of_purchase,
                selected_size
         FROM order_items WHERE order_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![order_id], item_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// The pair's cart, if one is open
pub fn find_cart(conn: &Connection, customer_phone: &str, seller_id: i64) -> DbResult<Option<Cart>> {
    let order = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE customer_phone = ?1 AND seller_id = ?2 AND status = 'IN_PROGRESS'"
            ),
            params![customer_phone, seller_id],
            order_from_row,
        )
        .optional()?;
    match order {
        Some(order) => {
            let items = order_items(conn, order.id)?;
            Ok(Some(Cart { order, items }))
        }
        None => Ok(None),
    }
}

/// Return the pair's cart, opening an empty one when none exists.
///
/// The partial unique index on `IN_PROGRESS` orders turns a racing second
/// insert into a no-op, so repeated or concurrent calls converge on one row.
pub fn get_or_create_cart(conn: &Connection, customer_phone: &str, seller_id: i64) -> DbResult<Cart> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO orders (customer_phone, seller_id, status, total_amount, created_at, updated_at)
         VALUES (?1, ?2, 'IN_PROGRESS', '0', ?3, ?3)
         ON CONFLICT (customer_phone, seller_id) WHERE status = 'IN_PROGRESS' DO NOTHING",
        params![customer_phone, seller_id, now],
    )?;
    find_cart(conn, customer_phone, seller_id)?.ok_or(DbError::Sqlite(
        rusqlite::Error::QueryReturnedNoRows,
    ))
}

fn ensure_mutable(conn: &Connection, order_id: i64) -> DbResult<()> {
    let order = get_order(conn, order_id)?;
    if order.status != OrderStatus::InProgress {
        return Err(DbError::OrderNotMutable {
            order_id,
            status: order.status,
        });
    }
    Ok(())
}

/// Insert a line or add to the matching one. Returns false, leaving the
/// line untouched, when the sum would not fit a `u32`.
fn upsert_line(
    conn: &Connection,
    order_id: i64,
    product_id: Option<i64>,
    product_name: &str,
    quantity: u32,
    price: Decimal,
    size_key: &str,
) -> DbResult<bool> {
    let changed = conn.execute(
        "INSERT INTO order_items
            (order_id, product_id, product_name, quantity, price_at_time_of_purchase, selected_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (order_id, product_id, selected_size)
            DO UPDATE SET quantity = quantity + excluded.quantity
            WHERE quantity + excluded.quantity <= ?7",
        params![
            order_id,
            product_id,
            product_name,
            quantity,
            price.to_string(),
            size_key,
            u32::MAX
        ],
    )?;
    Ok(changed > 0)
}

/// Add `quantity` of `product` in `size`, or bump the existing line.
///
/// The line's price is captured on first add and kept on later increments.
pub fn add_or_increment_item(
    conn: &Connection,
    order_id: i64,
    product: &Product,
    quantity: u32,
    size: Option<&str>,
) -> DbResult<OrderItem> {
    if quantity == 0 {
        return Err(DbError::InvalidQuantity(quantity));
    }
    ensure_mutable(conn, order_id)?;

    let size_key = size.unwrap_or("");
    if !upsert_line(
        conn,
        order_id,
        Some(product.id),
        &product.name,
        quantity,
        product.price,
        size_key,
    )? {
        return Err(DbError::QuantityTooLarge { order_id });
    }
    let item = conn.query_row(
        "SELECT id, order_id, product_id, product_name, quantity, price_at_time_of_purchase,
                selected_size
         FROM order_items WHERE order_id = ?1 AND product_id = ?2 AND selected_size = ?3",
        params![order_id, product.id, size_key],
        item_from_row,
    )?;
    recompute_total(conn, order_id)?;
    Ok(item)
}

/// Sum every line of the order and persist the result as `total_amount`
pub fn recompute_total(conn: &Connection, order_id: i64) -> DbResult<Decimal> {
    let total: Decimal = order_items(conn, order_id)?
        .iter()
        .map(OrderItem::line_total)
        .sum();
    conn.execute(
        "UPDATE orders SET total_amount = ?1, updated_at = ?2 WHERE id = ?3",
        params![total.to_string(), Utc::now().to_rfc3339(), order_id],
    )?;
    Ok(total)
}

pub fn set_delivery_option(conn: &Connection, order_id: i64, option: DeliveryOption) -> DbResult<()> {
    ensure_mutable(conn, order_id)?;
    conn.execute(
        "UPDATE orders SET delivery_option = ?1, updated_at = ?2 WHERE id = ?3",
        params![option.as_str(), Utc::now().to_rfc3339(), order_id],
    )?;
    Ok(())
}

pub fn set_delivery_address(
    conn: &Connection,
    order_id: i64,
    address: &DeliveryAddress,
) -> DbResult<()> {
    ensure_mutable(conn, order_id)?;
    let (latitude, longitude) = address
        .coordinates
        .map_or((None, None), |c| (Some(c.latitude), Some(c.longitude)));
    conn.execute(
        "UPDATE orders
         SET delivery_address_text = ?1, delivery_latitude = ?2, delivery_longitude = ?3,
             updated_at = ?4
         WHERE id = ?5",
        params![
            address.text,
            latitude,
            longitude,
            Utc::now().to_rfc3339(),
            order_id
        ],
    )?;
    Ok(())
}

/// Mark a payment push for the cart as in flight.
///
/// Returns false while an earlier push is still unanswered, so one cart is
/// never charged twice at once. A push older than the request window is
/// treated as lost.
pub fn claim_payment_request(conn: &Connection, order_id: i64) -> DbResult<bool> {
    ensure_mutable(conn, order_id)?;
    let requested_at: Option<String> = conn.query_row(
        "SELECT payment_requested_at FROM orders WHERE id = ?1",
        params![order_id],
        |row| row.get(0),
    )?;
    let now = Utc::now();
    if let Some(requested_at) = requested_at.as_deref().map(parse_datetime) {
        if now - requested_at < Duration::seconds(PAYMENT_REQUEST_WINDOW_SECS) {
            return Ok(false);
        }
        tracing::warn!(
            order_id,
            requested_at = %requested_at,
            "Earlier payment request never reported back, allowing a new one"
        );
    }
    conn.execute(
        "UPDATE orders SET payment_requested_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), order_id],
    )?;
    Ok(true)
}

/// Forget an in-flight push that failed, so the cart can be charged again
pub fn release_payment_request(conn: &Connection, order_id: i64) -> DbResult<()> {
    conn.execute(
        "UPDATE orders SET payment_requested_at = NULL
         WHERE id = ?1 AND status = 'IN_PROGRESS'",
        params![order_id],
    )?;
    Ok(())
}

/// Close the cart: record the processor's correlation id and move it to
/// `PENDING_PAYMENT`.
///
/// `charged` is the amount the push asked for; a cart whose total moved
/// since then stays open.
pub fn mark_pending_payment(
    conn: &Connection,
    order_id: i64,
    checkout_reference: &str,
    charged: Decimal,
) -> DbResult<Order> {
    ensure_mutable(conn, order_id)?;
    let total = get_order(conn, order_id)?.total_amount;
    if total != charged {
        return Err(DbError::AmountMismatch {
            order_id,
            charged,
            total,
        });
    }
    conn.execute(
        "UPDATE orders
         SET status = 'PENDING_PAYMENT', payment_checkout_reference = ?1, updated_at = ?2
         WHERE id = ?3",
        params![checkout_reference, Utc::now().to_rfc3339(), order_id],
    )?;
    get_order(conn, order_id)
}

pub fn find_order_by_checkout_reference(
    conn: &Connection,
    checkout_reference: &str,
) -> DbResult<Option<Order>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE payment_checkout_reference = ?1"),
            params![checkout_reference],
            order_from_row,
        )
        .optional()?)
}

/// Most recent order of the pair in `status`
pub fn latest_order_with_status(
    conn: &Connection,
    customer_phone: &str,
    seller_id: i64,
    status: OrderStatus,
) -> DbResult<Option<Order>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE customer_phone = ?1 AND seller_id = ?2 AND status = ?3
                 ORDER BY id DESC LIMIT 1"
            ),
            params![customer_phone, seller_id, status.as_str()],
            order_from_row,
        )
        .optional()?)
}

/// Move a checked-out order to `status`, optionally recording the
/// processor's transaction id
pub fn settle_order(
    conn: &Connection,
    order_id: i64,
    status: OrderStatus,
    transaction_id: Option<&str>,
) -> DbResult<Order> {
    conn.execute(
        "UPDATE orders
         SET status = ?1, payment_transaction_id = COALESCE(?2, payment_transaction_id),
             updated_at = ?3
         WHERE id = ?4",
        params![
            status.as_str(),
            transaction_id,
            Utc::now().to_rfc3339(),
            order_id
        ],
    )?;
    get_order(conn, order_id)
}

/// Copy the lines of a failed order back into the pair's cart at their
/// captured prices
pub fn restore_items_into_cart(conn: &Connection, failed: &Order) -> DbResult<Cart> {
    let cart = get_or_create_cart(conn, &failed.customer_phone, failed.seller_id)?;
    for item in order_items(conn, failed.id)? {
        let restored = upsert_line(
            conn,
            cart.order.id,
            item.product_id,
            &item.product_name,
            item.quantity,
            item.price_at_time_of_purchase,
            item.selected_size.as_deref().unwrap_or(""),
        )?;
        if !restored {
            tracing::warn!(
                order_id = failed.id,
                cart_id = cart.order.id,
                product = %item.product_name,
                "Line too large to merge back into the cart, skipping"
            );
        }
    }
    recompute_total(conn, cart.order.id)?;
    find_cart(conn, &failed.customer_phone, failed.seller_id)?
        .ok_or(DbError::OrderNotFound(cart.order.id))
}

/// A seller's orders past the cart stage, newest first
pub fn list_orders(conn: &Connection, seller_id: i64) -> DbResult<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE seller_id = ?1 AND status != 'IN_PROGRESS'
         ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![seller_id], order_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
