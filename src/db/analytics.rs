//! Sales figures for the seller dashboard

use super::{list_orders, DbResult, Order, OrderStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Window covered by [`SalesOverview::monthly_sales`]
const MONTHLY_WINDOW_DAYS: i64 = 180;
const TOP_PRODUCTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySales {
    /// `YYYY-MM`
    pub month: String,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopProduct {
    pub name: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesOverview {
    pub total_sales: Decimal,
    /// Every order past the cart stage, including cancelled and failed ones
    pub total_orders: u64,
    pub average_order_value: Decimal,
    pub monthly_sales: Vec<MonthlySales>,
    pub status_distribution: BTreeMap<String, u64>,
    pub top_products: Vec<TopProduct>,
}

/// Orders that count towards revenue
fn is_revenue(order: &Order) -> bool {
    !matches!(order.status, OrderStatus::Cancelled | OrderStatus::Failed)
}

pub fn sales_overview(
    conn: &Connection,
    seller_id: i64,
    now: DateTime<Utc>,
) -> DbResult<SalesOverview> {
    let orders = list_orders(conn, seller_id)?;

    let total_sales: Decimal = orders
        .iter()
        .filter(|o| is_revenue(o))
        .map(|o| o.total_amount)
        .sum();
    let total_orders = orders.len() as u64;
    let average_order_value = if total_orders == 0 {
        Decimal::ZERO
    } else {
        (total_sales / Decimal::from(total_orders)).round_dp(2)
    };

    let since = now - Duration::days(MONTHLY_WINDOW_DAYS);
    let mut by_month: BTreeMap<String, Decimal> = BTreeMap::new();
    for order in orders
        .iter()
        .filter(|o| is_revenue(o) && o.created_at >= since)
    {
        *by_month
            .entry(order.created_at.format("%Y-%m").to_string())
            .or_default() += order.total_amount;
    }

    let mut status_distribution = BTreeMap::new();
    for order in &orders {
        *status_distribution
            .entry(order.status.as_str().to_string())
            .or_default() += 1;
    }

    Ok(SalesOverview {
        total_sales,
        total_orders,
        average_order_value,
        monthly_sales: by_month
            .into_iter()
            .map(|(month, total)| MonthlySales { month, total })
            .collect(),
        status_distribution,
        top_products: top_products(conn, seller_id)?,
    })
}

/// Best sellers by units across revenue orders
fn top_products(conn: &Connection, seller_id: i64) -> DbResult<Vec<TopProduct>> {
    let mut stmt = conn.prepare(
        "SELECT oi.product_name, SUM(oi.quantity) AS units
         FROM order_items oi
         JOIN orders o ON o.id = oi.order_id
         WHERE o.seller_id = ?1 AND o.status NOT IN ('IN_PROGRESS', 'CANCELLED', 'FAILED')
         GROUP BY oi.product_name
         ORDER BY units DESC, oi.product_name
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![seller_id, TOP_PRODUCTS as i64], |row| {
        let units: i64 = row.get(1)?;
        Ok(TopProduct {
            name: row.get(0)?,
            quantity: u64::try_from(units).unwrap_or_default(),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
