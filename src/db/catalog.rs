//! Read access to seller catalogs, plus the inventory decrement used by
//! payment reconciliation. Catalog editing happens elsewhere against the
//! same tables.

use super::{get_decimal, DbResult, Product};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

const PRODUCT_COLUMNS: &str =
    "id, seller_id, name, description, price, sizes, inventory_count, is_active";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let sizes: String = row.get(5)?;
    Ok(Product {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        price: get_decimal(row, 4)?,
        // Malformed size lists read as "no sizes"
        sizes: serde_json::from_str(&sizes).unwrap_or_default(),
        inventory_count: row.get(6)?,
        is_active: row.get(7)?,
    })
}

/// An active product of this seller
pub fn find_active_product(
    conn: &Connection,
    seller_id: i64,
    product_id: i64,
) -> DbResult<Option<Product>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE id = ?1 AND seller_id = ?2 AND is_active = 1"
            ),
            params![product_id, seller_id],
            product_from_row,
        )
        .optional()?)
}

/// Case-insensitive name search over the seller's active products
pub fn search_active_products(
    conn: &Connection,
    seller_id: i64,
    name_contains: &str,
    limit: usize,
) -> DbResult<Vec<Product>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products
         WHERE seller_id = ?1 AND is_active = 1 AND instr(lower(name), lower(?2)) > 0
         ORDER BY name LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![seller_id, name_contains, i64::try_from(limit).unwrap_or(i64::MAX)],
        product_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_active_products(
    conn: &Connection,
    seller_id: i64,
    limit: usize,
) -> DbResult<Vec<Product>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products
         WHERE seller_id = ?1 AND is_active = 1
         ORDER BY name LIMIT ?2"
    ))?;
    let rows = stmt.query_map(
        params![seller_id, i64::try_from(limit).unwrap_or(i64::MAX)],
        product_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Take `quantity` units out of stock, never going below zero.
///
/// Returns the new count, or `None` when the product no longer exists.
pub fn decrement_inventory(
    conn: &Connection,
    product_id: i64,
    quantity: u32,
) -> DbResult<Option<i64>> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT inventory_count FROM products WHERE id = ?1",
            params![product_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        return Ok(None);
    };

    let wanted = i64::from(quantity);
    if wanted > current {
        tracing::warn!(
            product_id,
            in_stock = current,
            requested = wanted,
            "Insufficient inventory, clamping to zero"
        );
    }
    let remaining = (current - wanted).max(0);
    conn.execute(
        "UPDATE products SET inventory_count = ?1 WHERE id = ?2",
        params![remaining, product_id],
    )?;
    Ok(Some(remaining))
}

/// Fields for a new catalog entry
#[allow(dead_code)] // Used in tests
#[derive(Debug, Clone)]
pub struct NewProduct<'a> {
    pub seller_id: i64,
    pub name: &'a str,
    pub description: &'a str,
    pub price: Decimal,
    pub sizes: &'a [&'a str],
    pub inventory_count: i64,
}

#[allow(dead_code)] // Used in tests
pub fn insert_product(conn: &Connection, product: &NewProduct<'_>) -> DbResult<Product> {
    let sizes = serde_json::to_string(product.sizes).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO products
            (seller_id, name, description, price, sizes, inventory_count, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        params![
            product.seller_id,
            product.name,
            product.description,
            product.price.to_string(),
            sizes,
            product.inventory_count,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(Product {
        id: conn.last_insert_rowid(),
        seller_id: product.seller_id,
        name: product.name.to_string(),
        description: product.description.to_string(),
        price: product.price,
        sizes: product.sizes.iter().map(|s| (*s).to_string()).collect(),
        inventory_count: product.inventory_count,
        is_active: true,
    })
}
