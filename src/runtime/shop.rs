//! `Shop` over the storage transaction of the current message

use super::traits::Shop;
use crate::db::{self, Cart, DbResult, DeliveryAddress, DeliveryOption, Order, OrderStatus, Product};
use crate::state_machine::outbound::MAX_LIST_ROWS;
use rusqlite::Connection;
use rust_decimal::Decimal;

pub struct TxShop<'a> {
    conn: &'a Connection,
    customer_phone: &'a str,
    seller_id: i64,
}

impl<'a> TxShop<'a> {
    pub fn new(conn: &'a Connection, customer_phone: &'a str, seller_id: i64) -> Self {
        Self {
            conn,
            customer_phone,
            seller_id,
        }
    }
}

impl Shop for TxShop<'_> {
    fn find_active_product(&mut self, product_id: i64) -> DbResult<Option<Product>> {
        db::find_active_product(self.conn, self.seller_id, product_id)
    }

    fn search_active_products(&mut self, name_contains: &str) -> DbResult<Vec<Product>> {
        db::search_active_products(self.conn, self.seller_id, name_contains, MAX_LIST_ROWS)
    }

    fn list_active_products(&mut self, limit: usize) -> DbResult<Vec<Product>> {
        db::list_active_products(self.conn, self.seller_id, limit)
    }

    fn current_cart(&mut self) -> DbResult<Option<Cart>> {
        db::find_cart(self.conn, self.customer_phone, self.seller_id)
    }

    fn add_to_cart(
        &mut self,
        product: &Product,
        quantity: u32,
        size: Option<&str>,
    ) -> DbResult<Cart> {
        let cart = db::get_or_create_cart(self.conn, self.customer_phone, self.seller_id)?;
        db::add_or_increment_item(self.conn, cart.order.id, product, quantity, size)?;
        db::get_or_create_cart(self.conn, self.customer_phone, self.seller_id)
    }

    fn set_delivery_option(&mut self, option: DeliveryOption) -> DbResult<Option<Order>> {
        let Some(cart) = self.current_cart()? else {
            return Ok(None);
        };
        db::set_delivery_option(self.conn, cart.order.id, option)?;
        db::get_order(self.conn, cart.order.id).map(Some)
    }

    fn set_delivery_address(&mut self, address: &DeliveryAddress) -> DbResult<Option<Order>> {
        let Some(cart) = self.current_cart()? else {
            return Ok(None);
        };
        db::set_delivery_address(self.conn, cart.order.id, address)?;
        db::get_order(self.conn, cart.order.id).map(Some)
    }

    fn claim_payment_request(&mut self, order_id: i64) -> DbResult<bool> {
        db::claim_payment_request(self.conn, order_id)
    }

    fn release_payment_request(&mut self, order_id: i64) -> DbResult<()> {
        db::release_payment_request(self.conn, order_id)
    }

    fn mark_pending_payment(
        &mut self,
        order_id: i64,
        checkout_reference: &str,
        amount: Decimal,
    ) -> DbResult<Order> {
        db::mark_pending_payment(self.conn, order_id, checkout_reference, amount)
    }

    fn awaiting_payment(&mut self) -> DbResult<Option<Order>> {
        db::latest_order_with_status(
            self.conn,
            self.customer_phone,
            self.seller_id,
            OrderStatus::PendingPayment,
        )
    }
}
