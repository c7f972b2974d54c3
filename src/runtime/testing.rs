//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::db::{
    Cart, DbError, DbResult, DeliveryAddress, DeliveryOption, Order, OrderItem, OrderStatus,
    Product,
};
use crate::payments::{PaymentError, PaymentRequest};
use crate::state_machine::outbound::OutboundMessage;
use crate::whatsapp::TransportError;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const CUSTOMER: &str = "254711000111";

// ============================================================================
// Mock Shop
// ============================================================================

/// In-memory catalog and cart for exercising the engine without storage
#[allow(dead_code)]
#[derive(Default)]
pub struct MockShop {
    products: BTreeMap<i64, Product>,
    cart: Option<Cart>,
    closed: Vec<Order>,
    next_id: i64,
    payment_requested: bool,
}

#[allow(dead_code)]
impl MockShop {
    pub fn add_product(&mut self, id: i64, name: &str, price: Decimal, sizes: &[&str]) {
        self.products.insert(
            id,
            Product {
                id,
                seller_id: 1,
                name: name.to_string(),
                description: String::new(),
                price,
                sizes: sizes.iter().map(ToString::to_string).collect(),
                inventory_count: 10,
                is_active: true,
            },
        );
    }

    /// Seed a cart line directly; unknown products get a placeholder
    pub fn put_in_cart(&mut self, product_id: i64, quantity: u32, size: Option<&str>) {
        let product = self.products.get(&product_id).cloned().unwrap_or(Product {
            id: product_id,
            seller_id: 1,
            name: format!("Item {product_id}"),
            description: String::new(),
            price: Decimal::from(100),
            sizes: vec![],
            inventory_count: 10,
            is_active: true,
        });
        self.add_line(&product, quantity, size)
            .expect("seeded line fits in a cart");
    }

    pub fn cart_items(&self) -> Vec<(i64, u32, Option<String>)> {
        self.cart
            .iter()
            .flat_map(|c| &c.items)
            .map(|i| (i.product_id.unwrap_or_default(), i.quantity, i.selected_size.clone()))
            .collect()
    }

    pub fn cart_order_id(&self) -> i64 {
        self.cart.as_ref().map(|c| c.order.id).unwrap_or_default()
    }

    pub fn delivery_option(&self) -> Option<DeliveryOption> {
        self.cart.as_ref().and_then(|c| c.order.delivery_option)
    }

    pub fn delivery_address(&self) -> Option<DeliveryAddress> {
        self.cart
            .as_ref()
            .map(|c| c.order.delivery_address.clone())
            .filter(|a| *a != DeliveryAddress::default())
    }

    /// Correlation id of the latest order closed for payment
    pub fn pending_reference(&self) -> Option<String> {
        self.closed
            .last()
            .and_then(|o| o.payment_checkout_reference.clone())
    }

    fn open_cart(&mut self) -> &mut Cart {
        let next_id = &mut self.next_id;
        self.cart.get_or_insert_with(|| {
            *next_id += 1;
            let now = Utc::now();
            Cart {
                order: Order {
                    id: *next_id,
                    customer_phone: CUSTOMER.to_string(),
                    seller_id: 1,
                    status: OrderStatus::InProgress,
                    total_amount: Decimal::ZERO,
                    delivery_option: None,
                    delivery_address: DeliveryAddress::default(),
                    payment_checkout_reference: None,
                    payment_transaction_id: None,
                    created_at: now,
                    updated_at: now,
                },
                items: vec![],
            }
        })
    }

    pub fn payment_requested(&self) -> bool {
        self.payment_requested
    }

    fn add_line(&mut self, product: &Product, quantity: u32, size: Option<&str>) -> DbResult<()> {
        self.next_id += 1;
        let line_id = self.next_id;
        let cart = self.open_cart();
        let order_id = cart.order.id;
        let size = size.map(ToString::to_string);
        match cart
            .items
            .iter_mut()
            .find(|i| i.product_id == Some(product.id) && i.selected_size == size)
        {
            Some(item) => {
                item.quantity = item
                    .quantity
                    .checked_add(quantity)
                    .ok_or(DbError::QuantityTooLarge { order_id })?;
            }
            None => cart.items.push(OrderItem {
                id: line_id,
                order_id: cart.order.id,
                product_id: Some(product.id),
                product_name: product.name.clone(),
                quantity,
                price_at_time_of_purchase: product.price,
                selected_size: size,
            }),
        }
        cart.order.total_amount = cart.items_total();
        Ok(())
    }
}

impl Shop for MockShop {
    fn find_active_product(&mut self, product_id: i64) -> DbResult<Option<Product>> {
        Ok(self.products.get(&product_id).cloned())
    }

    fn search_active_products(&mut self, name_contains: &str) -> DbResult<Vec<Product>> {
        let needle = name_contains.to_lowercase();
        Ok(self
            .products
            .values()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    fn list_active_products(&mut self, limit: usize) -> DbResult<Vec<Product>> {
        Ok(self.products.values().take(limit).cloned().collect())
    }

    fn current_cart(&mut self) -> DbResult<Option<Cart>> {
        Ok(self.cart.clone())
    }

    fn add_to_cart(
        &mut self,
        product: &Product,
        quantity: u32,
        size: Option<&str>,
    ) -> DbResult<Cart> {
        if quantity == 0 {
            return Err(DbError::InvalidQuantity(quantity));
        }
        self.add_line(product, quantity, size)?;
        self.current_cart()?.ok_or(DbError::OrderNotFound(0))
    }

    fn set_delivery_option(&mut self, option: DeliveryOption) -> DbResult<Option<Order>> {
        Ok(self.cart.as_mut().map(|c| {
            c.order.delivery_option = Some(option);
            c.order.clone()
        }))
    }

    fn set_delivery_address(&mut self, address: &DeliveryAddress) -> DbResult<Option<Order>> {
        Ok(self.cart.as_mut().map(|c| {
            c.order.delivery_address = address.clone();
            c.order.clone()
        }))
    }

    fn claim_payment_request(&mut self, order_id: i64) -> DbResult<bool> {
        match &self.cart {
            Some(cart) if cart.order.id == order_id => {
                let claimed = !self.payment_requested;
                self.payment_requested = true;
                Ok(claimed)
            }
            _ => Err(DbError::OrderNotFound(order_id)),
        }
    }

    fn release_payment_request(&mut self, _order_id: i64) -> DbResult<()> {
        self.payment_requested = false;
        Ok(())
    }

    fn mark_pending_payment(
        &mut self,
        order_id: i64,
        checkout_reference: &str,
        amount: Decimal,
    ) -> DbResult<Order> {
        match self.cart.take() {
            Some(cart) if cart.order.id == order_id && cart.order.total_amount != amount => {
                let total = cart.order.total_amount;
                self.cart = Some(cart);
                Err(DbError::AmountMismatch {
                    order_id,
                    charged: amount,
                    total,
                })
            }
            Some(cart) if cart.order.id == order_id => {
                self.payment_requested = false;
                let mut order = cart.order;
                order.status = OrderStatus::PendingPayment;
                order.payment_checkout_reference = Some(checkout_reference.to_string());
                self.closed.push(order.clone());
                Ok(order)
            }
            other => {
                self.cart = other;
                match self.closed.iter().find(|o| o.id == order_id) {
                    Some(order) => Err(DbError::OrderNotMutable {
                        order_id,
                        status: order.status,
                    }),
                    None => Err(DbError::OrderNotFound(order_id)),
                }
            }
        }
    }

    fn awaiting_payment(&mut self) -> DbResult<Option<Order>> {
        Ok(self
            .closed
            .iter()
            .rev()
            .find(|o| o.status == OrderStatus::PendingPayment)
            .cloned())
    }
}

// ============================================================================
// Mock Chat Transport
// ============================================================================

/// Records every send; can be switched to fail
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn last_to(&self, recipient: &str) -> Option<OutboundMessage> {
        self.sent_to(recipient).pop()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Network("mock transport down".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), message.clone()));
        Ok(())
    }
}

// ============================================================================
// Mock Payment Gateway
// ============================================================================

/// Returns queued initiation results in order, optionally after a delay
#[derive(Default)]
pub struct MockPaymentGateway {
    results: Mutex<VecDeque<Result<String, PaymentError>>>,
    requests: Mutex<Vec<PaymentRequest>>,
    delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_reference(&self, checkout_reference: &str) {
        self.results
            .lock()
            .unwrap()
            .push_back(Ok(checkout_reference.to_string()));
    }

    pub fn queue_error(&self, error: PaymentError) {
        self.results.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Hold every initiation open for `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<String, PaymentError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PaymentError::network("No mock result queued")))
    }
}

// ============================================================================
// Runtime Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::db_with_seller;
    use crate::db::{self, insert_product, Database, MessageSender, NewProduct, Seller};
    use crate::notify::{SellerEvent, SellerHub};
    use crate::payments::{IgnoreReason, Reconciliation, StkCallback};
    use crate::runtime::ConversationRuntime;
    use crate::state_machine::event::{InboundEnvelope, InboundMessage};
    use crate::state_machine::ConvState;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::Arc;

    type TestRuntime = ConversationRuntime<MockTransport, MockPaymentGateway>;

    struct Harness {
        runtime: TestRuntime,
        transport: Arc<MockTransport>,
        payments: Arc<MockPaymentGateway>,
        seller: Seller,
        product: Product,
    }

    impl Harness {
        fn new() -> Self {
            let (db, seller) = db_with_seller();
            let product = db
                .transaction(|tx| {
                    insert_product(
                        tx,
                        &NewProduct {
                            seller_id: seller.id,
                            name: "Kikoi",
                            description: "Handwoven cotton wrap",
                            price: dec!(450),
                            sizes: &[],
                            inventory_count: 5,
                        },
                    )
                })
                .unwrap();
            let transport = Arc::new(MockTransport::new());
            let payments = Arc::new(MockPaymentGateway::new());
            let runtime = ConversationRuntime::new(
                db,
                transport.clone(),
                payments.clone(),
                Arc::new(SellerHub::new()),
            );
            Self {
                runtime,
                transport,
                payments,
                seller,
                product,
            }
        }

        fn db(&self) -> &Database {
            self.runtime.db()
        }

        async fn say(&self, message: InboundMessage) {
            self.runtime
                .handle_inbound(InboundEnvelope {
                    business_id: self.seller.chat_identity.clone(),
                    from: CUSTOMER.to_string(),
                    customer_name: Some("Amina".to_string()),
                    message,
                })
                .await
                .unwrap();
        }

        fn state(&self) -> ConvState {
            self.db()
                .read(|conn| db::find_conversation(conn, CUSTOMER, self.seller.id))
                .unwrap()
                .map(|c| c.state)
                .unwrap_or_default()
        }

        fn last_reply(&self) -> OutboundMessage {
            self.transport.last_to(CUSTOMER).unwrap()
        }

        fn inventory(&self) -> i64 {
            self.db()
                .read(|conn| db::find_active_product(conn, self.seller.id, self.product.id))
                .unwrap()
                .unwrap()
                .inventory_count
        }

        /// Drive a fresh conversation to a cart of 2 x Kikoi awaiting payment
        async fn checkout_pending(&self, reference: &str) -> Order {
            self.say(InboundMessage::text("menu")).await;
            self.say(InboundMessage::button("view_all_products")).await;
            self.say(InboundMessage::list(format!("select_product_{}", self.product.id)))
                .await;
            self.say(InboundMessage::button(format!("add_to_cart_{}", self.product.id)))
                .await;
            self.say(InboundMessage::text("2")).await;
            self.say(InboundMessage::text("view cart")).await;
            self.say(InboundMessage::button("checkout")).await;
            self.payments.queue_reference(reference);
            self.say(InboundMessage::button("select_pickup")).await;
            self.db()
                .read(|conn| db::find_order_by_checkout_reference(conn, reference))
                .unwrap()
                .unwrap()
        }

        async fn callback(&self, reference: &str, code: i64) -> Reconciliation {
            let body = json!({"Body": {"stkCallback": {
                "MerchantRequestID": "m-1",
                "CheckoutRequestID": reference,
                "ResultCode": code,
                "ResultDesc": if code == 0 { "Success" } else { "Request cancelled by user" },
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 900},
                    {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"}
                ]}
            }}});
            let callback = StkCallback::parse(body.to_string().as_bytes()).unwrap();
            self.runtime.handle_payment_callback(&callback).await.unwrap()
        }

        fn texts_to(&self, recipient: &str, needle: &str) -> usize {
            self.transport
                .sent_to(recipient)
                .iter()
                .filter(|m| m.body().contains(needle))
                .count()
        }
    }

    #[tokio::test]
    async fn test_shopping_flow_end_to_end() {
        let h = Harness::new();
        let mut seller_rx = h.runtime.hub().subscribe(h.seller.id).await;

        h.say(InboundMessage::text("menu")).await;
        assert_eq!(h.state(), ConvState::AwaitingCommand);
        assert_eq!(
            h.last_reply().reply_ids(),
            vec!["search_by_keyword", "view_all_products", "view_cart"]
        );

        h.say(InboundMessage::button("view_all_products")).await;
        assert_eq!(h.state(), ConvState::AwaitingProductSelection);
        let list = h.last_reply();
        assert!(list.reply_ids().len() <= 10);
        let pick = format!("select_product_{}", h.product.id);
        assert!(list.reply_ids().contains(&pick.as_str()));

        h.say(InboundMessage::list(pick)).await;
        assert_eq!(
            h.state(),
            ConvState::AwaitingProductAction {
                product_id: h.product.id
            }
        );

        h.say(InboundMessage::button(format!("add_to_cart_{}", h.product.id)))
            .await;
        assert!(matches!(h.state(), ConvState::AwaitingQuantity { size: None, .. }));

        h.say(InboundMessage::text("2")).await;
        assert_eq!(h.state(), ConvState::AwaitingCommand);
        let cart = h
            .db()
            .read(|conn| db::find_cart(conn, CUSTOMER, h.seller.id))
            .unwrap()
            .unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 2);
        assert_eq!(cart.order.total_amount, dec!(900));

        h.say(InboundMessage::text("view cart")).await;
        assert_eq!(h.state(), ConvState::ViewingCart);
        assert_eq!(h.last_reply().reply_ids(), vec!["checkout", "keep_shopping"]);

        h.say(InboundMessage::button("checkout")).await;
        assert_eq!(h.state(), ConvState::AwaitingDeliveryChoice);

        h.payments.queue_reference("ws_CO_1");
        h.say(InboundMessage::button("select_pickup")).await;
        assert_eq!(h.state(), ConvState::AwaitingPaymentConfirmation);
        let requests = h.payments.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, dec!(900));
        assert_eq!(requests[0].phone, CUSTOMER);
        let order = h
            .db()
            .read(|conn| db::get_order(conn, cart.order.id))
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.delivery_option, Some(DeliveryOption::Pickup));
        assert_eq!(order.payment_checkout_reference.as_deref(), Some("ws_CO_1"));

        let outcome = h.callback("ws_CO_1", 0).await;
        assert!(matches!(outcome, Reconciliation::Paid { .. }));
        let order = h
            .db()
            .read(|conn| db::get_order(conn, cart.order.id))
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingApproval);
        assert_eq!(h.inventory(), 3);
        assert_eq!(h.state(), ConvState::AwaitingCommand);
        assert_eq!(h.texts_to(CUSTOMER, "Payment successful"), 1);
        let alert_phone = h.seller.alert_phone.clone().unwrap();
        assert_eq!(h.texts_to(&alert_phone, "New Paid Order"), 1);
        assert_eq!(h.texts_to(&alert_phone, "- 2 x Kikoi"), 1);

        let mut saw_new_order = false;
        while let Ok(event) = seller_rx.try_recv() {
            if let SellerEvent::NewOrder { order, items } = event {
                assert_eq!(order.id, cart.order.id);
                assert_eq!(items.len(), 1);
                saw_new_order = true;
            }
        }
        assert!(saw_new_order);
    }

    #[tokio::test]
    async fn test_duplicate_callback_is_a_no_op() {
        let h = Harness::new();
        h.checkout_pending("ws_CO_1").await;
        let alert_phone = h.seller.alert_phone.clone().unwrap();

        h.callback("ws_CO_1", 0).await;
        let second = h.callback("ws_CO_1", 0).await;

        assert!(matches!(
            second,
            Reconciliation::Ignored(IgnoreReason::AlreadySettled { .. })
        ));
        assert_eq!(h.inventory(), 3);
        assert_eq!(h.texts_to(CUSTOMER, "Payment successful"), 1);
        assert_eq!(h.texts_to(&alert_phone, "New Paid Order"), 1);
    }

    #[tokio::test]
    async fn test_unknown_reference_changes_nothing() {
        let h = Harness::new();
        let order = h.checkout_pending("ws_CO_1").await;
        let sent_before = h.transport.count();

        let outcome = h.callback("ws_CO_other", 0).await;

        assert!(matches!(
            outcome,
            Reconciliation::Ignored(IgnoreReason::UnknownReference(_))
        ));
        assert_eq!(h.transport.count(), sent_before);
        assert_eq!(h.inventory(), 5);
        let order = h.db().read(|conn| db::get_order(conn, order.id)).unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(h.state(), ConvState::AwaitingPaymentConfirmation);
    }

    #[tokio::test]
    async fn test_failed_payment_restores_cart() {
        let h = Harness::new();
        let order = h.checkout_pending("ws_CO_1").await;

        h.callback("ws_CO_1", 1032).await;

        assert_eq!(h.texts_to(CUSTOMER, "Payment Failed"), 1);
        assert_eq!(h.state(), ConvState::AwaitingCommand);
        let failed = h.db().read(|conn| db::get_order(conn, order.id)).unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);

        h.say(InboundMessage::text("view cart")).await;
        assert_eq!(h.state(), ConvState::ViewingCart);
        assert!(h.last_reply().body().contains("Kikoi"));
    }

    #[tokio::test]
    async fn test_initiation_failure_then_retry() {
        let h = Harness::new();
        h.say(InboundMessage::text("hi")).await;
        h.say(InboundMessage::button("view_all_products")).await;
        h.say(InboundMessage::list(format!("select_product_{}", h.product.id)))
            .await;
        h.say(InboundMessage::button(format!("add_to_cart_{}", h.product.id)))
            .await;
        h.say(InboundMessage::text("1")).await;
        h.say(InboundMessage::text("view cart")).await;
        h.say(InboundMessage::button("checkout")).await;

        h.payments
            .queue_error(PaymentError::network("Request timeout"));
        h.say(InboundMessage::button("select_pickup")).await;
        assert!(h.last_reply().body().contains("couldn't initiate"));
        assert_eq!(h.state(), ConvState::AwaitingPaymentConfirmation);
        let cart = h
            .db()
            .read(|conn| db::find_cart(conn, CUSTOMER, h.seller.id))
            .unwrap();
        assert!(cart.is_some(), "cart stays open after a failed push");

        h.payments.queue_reference("ws_CO_2");
        h.say(InboundMessage::text("checkout")).await;
        assert_eq!(h.payments.recorded_requests().len(), 2);
        let order = h
            .db()
            .read(|conn| db::find_order_by_checkout_reference(conn, "ws_CO_2"))
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.total_amount, dec!(450));
    }

    #[tokio::test]
    async fn test_message_during_payment_push_does_not_push_again() {
        let h = Harness::new();
        h.say(InboundMessage::text("hi")).await;
        h.say(InboundMessage::button("view_all_products")).await;
        h.say(InboundMessage::list(format!("select_product_{}", h.product.id)))
            .await;
        h.say(InboundMessage::button(format!("add_to_cart_{}", h.product.id)))
            .await;
        h.say(InboundMessage::text("1")).await;
        h.say(InboundMessage::text("view cart")).await;
        h.say(InboundMessage::button("checkout")).await;

        h.payments.set_delay(Duration::from_millis(300));
        h.payments.queue_reference("ws_CO_1");
        h.payments.queue_reference("ws_CO_2");
        tokio::join!(h.say(InboundMessage::button("select_pickup")), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.say(InboundMessage::text("ok")).await;
        });

        assert_eq!(h.payments.recorded_requests().len(), 1);
        let order = h
            .db()
            .read(|conn| db::find_order_by_checkout_reference(conn, "ws_CO_1"))
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.total_amount, dec!(450));
        assert_eq!(h.texts_to(CUSTOMER, "still waiting"), 1);
        assert_eq!(h.state(), ConvState::AwaitingPaymentConfirmation);
    }

    #[tokio::test]
    async fn test_unknown_business_is_dropped() {
        let h = Harness::new();
        h.runtime
            .handle_inbound(InboundEnvelope {
                business_id: "someone-else".to_string(),
                from: CUSTOMER.to_string(),
                customer_name: None,
                message: InboundMessage::text("hi"),
            })
            .await
            .unwrap();

        assert_eq!(h.transport.count(), 0);
        let conversation = h
            .db()
            .read(|conn| db::find_conversation(conn, CUSTOMER, h.seller.id))
            .unwrap();
        assert!(conversation.is_none());
    }

    #[tokio::test]
    async fn test_inbox_records_both_sides() {
        let h = Harness::new();
        let mut seller_rx = h.runtime.hub().subscribe(h.seller.id).await;

        h.say(InboundMessage::text("hello")).await;

        let conversation = h
            .db()
            .read(|conn| db::find_conversation(conn, CUSTOMER, h.seller.id))
            .unwrap()
            .unwrap();
        let messages = h
            .db()
            .read(|conn| db::list_messages(conn, conversation.id))
            .unwrap();
        assert_eq!(messages[0].sender, MessageSender::Customer);
        assert_eq!(messages[0].content, "hello");
        assert!(messages[1..].iter().all(|m| m.sender == MessageSender::Bot));
        assert!(!messages[1..].is_empty());

        let mut pushed = 0;
        while let Ok(SellerEvent::Message { .. }) = seller_rx.try_recv() {
            pushed += 1;
        }
        assert_eq!(pushed, messages.len());

        let customer = h
            .db()
            .read(|conn| db::get_or_create_customer(conn, CUSTOMER, None))
            .unwrap();
        assert_eq!(customer.name.as_deref(), Some("Amina"));
    }

    #[tokio::test]
    async fn test_transport_failure_does_not_lose_the_turn() {
        let h = Harness::new();
        h.transport.set_failing(true);

        h.say(InboundMessage::text("menu")).await;

        assert_eq!(h.state(), ConvState::AwaitingCommand);
        assert_eq!(h.transport.count(), 0);
    }

    #[tokio::test]
    async fn test_seller_reply_reaches_customer() {
        let h = Harness::new();
        h.say(InboundMessage::text("hi")).await;
        let conversation_id = h
            .db()
            .read(|conn| db::find_conversation(conn, CUSTOMER, h.seller.id))
            .unwrap()
            .unwrap()
            .id;

        let message = h
            .runtime
            .send_seller_message(h.seller.id, conversation_id, "Karibu! Your order ships today.")
            .await
            .unwrap();
        assert_eq!(message.sender, MessageSender::Seller);
        assert_eq!(
            h.last_reply(),
            OutboundMessage::text("Karibu! Your order ships today.")
        );

        let wrong_seller = h
            .runtime
            .send_seller_message(h.seller.id + 1, conversation_id, "hi")
            .await;
        assert!(wrong_seller.is_err());
    }
}
