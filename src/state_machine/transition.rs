//! State transition function
//!
//! One handler per state. A handler both interprets the input for its state
//! and renders the prompt of the state it moves to, so re-sending a command
//! always re-displays the right screen.
//!
//! Global commands ("menu", "view cart") are checked before the per-state
//! handler. Catalog and cart access goes through [`Shop`], which in
//! production is bound to the storage transaction of the current message.

use super::effect::Effect;
use super::event::{Event, InboundMessage};
use super::outbound::{ListRow, OutboundMessage, MAX_BUTTONS, MAX_LIST_ROWS};
use super::router::{global_command, id_with_prefix, normalize, reply_ids, GlobalCommand};
use super::{ConvContext, ConvState};
use crate::db::{Cart, DbError, DeliveryAddress, DeliveryOption, Product};
use crate::runtime::traits::Shop;
use rust_decimal::Decimal;
use std::num::IntErrorKind;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    fn reply(state: ConvState, message: impl Into<OutboundMessage>) -> Self {
        Self::new(state).with_effect(Effect::reply(message))
    }

    /// Messages this transition sends to the customer
    pub fn replies(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Reply(message) => Some(message),
            Effect::InitiatePayment { .. } => None,
        })
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Storage error: {0}")]
    Db(#[from] DbError),
}

// Customer-facing copy shared by several handlers
const PRODUCT_GONE: &str = "Sorry, that product is no longer available. Type 'menu' to see what else we have.";
const EMPTY_CART: &str = "Your shopping cart is currently empty. Type 'menu' to browse products.";
const CART_GONE: &str = "Sorry, I couldn't find your cart. Type 'menu' to start shopping again.";
const USE_BUTTONS: &str = "Please use one of the buttons above, or type 'menu' for options.";
const QUANTITY_TOO_LARGE: &str = "That quantity is too large. Please enter a smaller number.";
const ADDRESS_PROMPT: &str =
    "Great! Please provide your delivery address. You can type a full address or share your location pin.";
const ADDRESS_REPROMPT: &str = "Please provide your address by typing it or sharing your location pin.";
const SEARCH_PROMPT: &str = "What are you looking for? Type the name of a product.";
const PAYMENT_PROMPT_SENT: &str =
    "A payment prompt has been sent to your phone. Please enter your M-Pesa PIN to complete the transaction.";
const PAYMENT_INITIATION_FAILED: &str =
    "We couldn't initiate the payment request at this time. Please try again shortly by typing 'checkout'.";
const PAYMENT_PENDING: &str =
    "We're still waiting for your payment to be confirmed. You'll get a message as soon as it arrives.";
const CART_CHANGED: &str =
    "Your cart changed while we were requesting payment, so that request was cancelled. Please ignore any M-Pesa prompt for the old amount and type 'checkout' to pay the new total.";

pub fn transition(
    state: &ConvState,
    ctx: &ConvContext,
    shop: &mut dyn Shop,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::Inbound(message) => handle_inbound(state, ctx, shop, &message),

        Event::PaymentInitiated {
            order_id,
            amount,
            checkout_reference,
        } => match shop.mark_pending_payment(order_id, &checkout_reference, amount) {
            Ok(_) => Ok(TransitionResult::reply(
                ConvState::AwaitingPaymentConfirmation,
                PAYMENT_PROMPT_SENT,
            )),
            // Another turn already closed this cart
            Err(DbError::OrderNotMutable { status, .. }) => {
                tracing::warn!(
                    order_id,
                    %status,
                    checkout_reference = %checkout_reference,
                    "Payment initiated for an order that is no longer a cart"
                );
                Ok(TransitionResult::reply(state.clone(), PAYMENT_PENDING))
            }
            Err(DbError::AmountMismatch { charged, total, .. }) => {
                tracing::error!(
                    order_id,
                    %charged,
                    %total,
                    checkout_reference = %checkout_reference,
                    "Cart total moved while its payment was being requested"
                );
                shop.release_payment_request(order_id)?;
                Ok(TransitionResult::reply(state.clone(), CART_CHANGED))
            }
            Err(e) => Err(e.into()),
        },

        Event::PaymentInitiationFailed { order_id, reason } => {
            tracing::warn!(
                customer = %ctx.customer_phone,
                seller_id = ctx.seller_id,
                order_id,
                reason = %reason,
                "Payment initiation failed"
            );
            shop.release_payment_request(order_id)?;
            Ok(TransitionResult::reply(
                state.clone(),
                PAYMENT_INITIATION_FAILED,
            ))
        }
    }
}

fn handle_inbound(
    state: &ConvState,
    ctx: &ConvContext,
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    if let Some(command) = global_command(message) {
        return match command {
            GlobalCommand::Menu => Ok(main_menu(ctx)),
            GlobalCommand::ViewCart => {
                // The cart is closed while its payment is awaited
                if *state == ConvState::AwaitingPaymentConfirmation
                    && shop.awaiting_payment()?.is_some()
                {
                    Ok(TransitionResult::reply(state.clone(), PAYMENT_PENDING))
                } else {
                    show_cart(shop)
                }
            }
        };
    }

    match state {
        ConvState::Started => Ok(TransitionResult::new(ConvState::AwaitingCommand)
            .with_effect(Effect::reply(format!(
                "Welcome to {}! 👋 I can help you find products, fill your cart and pay with M-Pesa.",
                ctx.seller_name
            )))
            .with_effect(Effect::Reply(menu_message(ctx)))),
        ConvState::AwaitingCommand => awaiting_command(ctx, shop, message),
        ConvState::AwaitingProductSelection => awaiting_product_selection(shop, message),
        ConvState::AwaitingProductAction { product_id } => {
            awaiting_product_action(shop, *product_id, message)
        }
        ConvState::AwaitingSizeSelection { product_id } => {
            awaiting_size_selection(shop, *product_id, message)
        }
        ConvState::AwaitingQuantity { product_id, size } => {
            awaiting_quantity(shop, *product_id, size.as_deref(), message)
        }
        ConvState::ViewingCart => viewing_cart(shop, message),
        ConvState::AwaitingDeliveryChoice => awaiting_delivery_choice(ctx, shop, message),
        ConvState::AwaitingDeliveryAddress => awaiting_delivery_address(ctx, shop, message),
        ConvState::AwaitingPaymentConfirmation => begin_payment(ctx, shop),
    }
}

// ============================================================================
// Menu and browsing
// ============================================================================

fn menu_message(ctx: &ConvContext) -> OutboundMessage {
    OutboundMessage::buttons(
        format!("What would you like to do at {}?", ctx.seller_name),
        [
            (reply_ids::SEARCH, "Search for an item"),
            (reply_ids::VIEW_ALL_PRODUCTS, "Browse All Products"),
            (reply_ids::VIEW_CART, "View Cart 🛒"),
        ],
    )
}

fn main_menu(ctx: &ConvContext) -> TransitionResult {
    TransitionResult::new(ConvState::AwaitingCommand).with_effect(Effect::Reply(menu_message(ctx)))
}

fn awaiting_command(
    ctx: &ConvContext,
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    match message.reply_id() {
        Some(reply_ids::SEARCH) => Ok(TransitionResult::reply(
            ConvState::AwaitingProductSelection,
            SEARCH_PROMPT,
        )),
        Some(reply_ids::VIEW_ALL_PRODUCTS) => {
            let products = shop.list_active_products(MAX_LIST_ROWS)?;
            if products.is_empty() {
                return Ok(TransitionResult::reply(
                    ConvState::AwaitingCommand,
                    "Sorry, there are no products available right now. Please check back later.",
                ));
            }
            Ok(TransitionResult::new(ConvState::AwaitingProductSelection).with_effect(
                Effect::Reply(product_list(
                    "Our Full Catalog",
                    "Here's everything we have. Tap below to pick a product.",
                    &products,
                )),
            ))
        }
        _ => Ok(main_menu(ctx)),
    }
}

fn product_list(header: &str, body: &str, products: &[Product]) -> OutboundMessage {
    OutboundMessage::list(
        header,
        body,
        "View Products",
        products.iter().map(|p| {
            ListRow::new(
                format!("{}{}", reply_ids::SELECT_PRODUCT_PREFIX, p.id),
                &p.name,
                Some(&money(p.price)),
            )
        }),
    )
}

fn product_detail(product: &Product) -> TransitionResult {
    let mut body = format!("*{}*\n\n", product.name);
    if !product.description.is_empty() {
        body.push_str(&product.description);
        body.push_str("\n\n");
    }
    body.push_str(&format!("Price: {}", money(product.price)));
    if product.has_sizes() {
        body.push_str(&format!("\nSizes: {}", product.sizes.join(", ")));
    }
    let add_id = format!("{}{}", reply_ids::ADD_TO_CART_PREFIX, product.id);
    TransitionResult::new(ConvState::AwaitingProductAction {
        product_id: product.id,
    })
    .with_effect(Effect::Reply(OutboundMessage::buttons(
        body,
        [
            (add_id.as_str(), "Add to Cart 🛒"),
            (reply_ids::SHOW_MENU, "Main Menu"),
        ],
    )))
}

fn awaiting_product_selection(
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    if let Some(reply_id) = message.reply_id() {
        let product = match id_with_prefix(reply_id, reply_ids::SELECT_PRODUCT_PREFIX) {
            Some(product_id) => shop.find_active_product(product_id)?,
            None => None,
        };
        return Ok(match product {
            Some(product) => product_detail(&product),
            None => TransitionResult::reply(
                ConvState::AwaitingProductSelection,
                "Sorry, I couldn't find that product. Please pick another one or type a product name.",
            ),
        });
    }

    let query = message.text_body().map(str::trim).unwrap_or_default();
    if query.is_empty() {
        return Ok(TransitionResult::reply(
            ConvState::AwaitingProductSelection,
            SEARCH_PROMPT,
        ));
    }

    let mut matches = shop.search_active_products(query)?;
    Ok(match matches.len() {
        0 => TransitionResult::reply(
            ConvState::AwaitingProductSelection,
            format!("Sorry, I couldn't find any products matching '{query}'. Try another name, or type 'menu'."),
        ),
        1 => product_detail(&matches.remove(0)),
        n => TransitionResult::new(ConvState::AwaitingProductSelection).with_effect(
            Effect::Reply(product_list(
                "Multiple Matches Found",
                &format!("I found {n} products matching '{query}'. Which one would you like?"),
                &matches,
            )),
        ),
    })
}

// ============================================================================
// Adding to the cart
// ============================================================================

fn size_prompt(product: &Product) -> OutboundMessage {
    let body = format!("Which size of *{}* would you like?", product.name);
    let ids: Vec<String> = product
        .sizes
        .iter()
        .map(|s| format!("{}{s}", reply_ids::SELECT_SIZE_PREFIX))
        .collect();
    if product.sizes.len() <= MAX_BUTTONS {
        OutboundMessage::buttons(
            body,
            ids.iter()
                .map(String::as_str)
                .zip(product.sizes.iter().map(String::as_str)),
        )
    } else {
        OutboundMessage::list(
            "Available Sizes",
            body,
            "Choose Size",
            ids.iter()
                .zip(&product.sizes)
                .map(|(id, size)| ListRow::new(id.clone(), size, None)),
        )
    }
}

fn quantity_prompt(product: &Product, size: Option<&str>) -> String {
    match size {
        Some(size) => format!("How many of *{}* (size {size}) would you like to add?", product.name),
        None => format!("How many of *{}* would you like to add?", product.name),
    }
}

fn awaiting_product_action(
    shop: &mut dyn Shop,
    product_id: i64,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let wants_add = message
        .reply_id()
        .and_then(|id| id_with_prefix(id, reply_ids::ADD_TO_CART_PREFIX))
        .is_some_and(|id| id == product_id);
    if !wants_add {
        return Ok(TransitionResult::reply(
            ConvState::AwaitingProductAction { product_id },
            USE_BUTTONS,
        ));
    }

    let Some(product) = shop.find_active_product(product_id)? else {
        return Ok(TransitionResult::reply(ConvState::AwaitingCommand, PRODUCT_GONE));
    };
    if product.has_sizes() {
        Ok(TransitionResult::new(ConvState::AwaitingSizeSelection { product_id })
            .with_effect(Effect::Reply(size_prompt(&product))))
    } else {
        Ok(TransitionResult::reply(
            ConvState::AwaitingQuantity {
                product_id,
                size: None,
            },
            quantity_prompt(&product, None),
        ))
    }
}

fn awaiting_size_selection(
    shop: &mut dyn Shop,
    product_id: i64,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let Some(product) = shop.find_active_product(product_id)? else {
        return Ok(TransitionResult::reply(ConvState::AwaitingCommand, PRODUCT_GONE));
    };

    let picked = message
        .reply_id()
        .and_then(|id| id.strip_prefix(reply_ids::SELECT_SIZE_PREFIX))
        .and_then(|size| product.sizes.iter().find(|s| s.as_str() == size));

    match picked {
        Some(size) => Ok(TransitionResult::reply(
            ConvState::AwaitingQuantity {
                product_id,
                size: Some(size.clone()),
            },
            quantity_prompt(&product, Some(size)),
        )),
        None => Ok(TransitionResult::new(ConvState::AwaitingSizeSelection { product_id })
            .with_effect(Effect::reply("Please choose one of the available sizes."))
            .with_effect(Effect::Reply(size_prompt(&product)))),
    }
}

fn awaiting_quantity(
    shop: &mut dyn Shop,
    product_id: i64,
    size: Option<&str>,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let same = || ConvState::AwaitingQuantity {
        product_id,
        size: size.map(String::from),
    };

    let text = message.text_body().map(str::trim).unwrap_or_default();
    let quantity = match text.parse::<u32>() {
        Ok(0) => {
            return Ok(TransitionResult::reply(
                same(),
                "Please enter a valid quantity (1 or more).",
            ))
        }
        Ok(quantity) => quantity,
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => {
            return Ok(TransitionResult::reply(same(), QUANTITY_TOO_LARGE))
        }
        Err(_) => {
            return Ok(TransitionResult::reply(
                same(),
                "Please enter a valid number for the quantity.",
            ))
        }
    };

    let Some(product) = shop.find_active_product(product_id)? else {
        return Ok(TransitionResult::reply(ConvState::AwaitingCommand, PRODUCT_GONE));
    };
    let cart = match shop.add_to_cart(&product, quantity, size) {
        Ok(cart) => cart,
        Err(DbError::QuantityTooLarge { .. }) => {
            return Ok(TransitionResult::reply(same(), QUANTITY_TOO_LARGE))
        }
        Err(e) => return Err(e.into()),
    };

    let body = format!(
        "Great! Added {quantity} x *{}* (Size: {}) to your cart.\n\nYour cart total is now *{}*.\n\nWhat would you like to do next?",
        product.name,
        size.unwrap_or("N/A"),
        money(cart.order.total_amount)
    );
    Ok(TransitionResult::new(ConvState::AwaitingCommand).with_effect(Effect::Reply(
        OutboundMessage::buttons(
            body,
            [
                (reply_ids::VIEW_CART, "View Cart 🛒"),
                (reply_ids::KEEP_SHOPPING, "Keep Shopping"),
            ],
        ),
    )))
}

// ============================================================================
// Cart and checkout
// ============================================================================

fn cart_summary(cart: &Cart) -> String {
    let lines: Vec<String> = cart
        .items
        .iter()
        .map(|item| {
            let size = item
                .selected_size
                .as_deref()
                .map(|s| format!(" (Size: {s})"))
                .unwrap_or_default();
            format!(
                "- {} x {}{size}: {}",
                item.quantity,
                item.product_name,
                money(item.line_total())
            )
        })
        .collect();
    format!(
        "🛒 *Your Shopping Cart*\n\n{}\n\n--------------------\n*Total: {}*",
        lines.join("\n"),
        money(cart.order.total_amount)
    )
}

fn show_cart(shop: &mut dyn Shop) -> Result<TransitionResult, TransitionError> {
    match shop.current_cart()? {
        Some(cart) if !cart.is_empty() => Ok(TransitionResult::new(ConvState::ViewingCart)
            .with_effect(Effect::Reply(OutboundMessage::buttons(
                cart_summary(&cart),
                [
                    (reply_ids::CHECKOUT, "Proceed to Checkout"),
                    (reply_ids::KEEP_SHOPPING, "Add More Items"),
                ],
            )))),
        _ => Ok(TransitionResult::reply(ConvState::AwaitingCommand, EMPTY_CART)),
    }
}

fn delivery_prompt() -> OutboundMessage {
    OutboundMessage::buttons(
        "How would you like to receive your order?",
        [
            (reply_ids::SELECT_DELIVERY, "🚚 Delivery"),
            (reply_ids::SELECT_PICKUP, "🏢 Pickup"),
        ],
    )
}

fn viewing_cart(
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let checkout = message.reply_id() == Some(reply_ids::CHECKOUT)
        || message.text_body().map(normalize).as_deref() == Some(reply_ids::CHECKOUT);
    if !checkout {
        return show_cart(shop);
    }
    match shop.current_cart()? {
        Some(cart) if !cart.is_empty() => Ok(TransitionResult::new(
            ConvState::AwaitingDeliveryChoice,
        )
        .with_effect(Effect::Reply(delivery_prompt()))),
        _ => Ok(TransitionResult::reply(ConvState::AwaitingCommand, EMPTY_CART)),
    }
}

fn awaiting_delivery_choice(
    ctx: &ConvContext,
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let option = match message.reply_id() {
        Some(reply_ids::SELECT_DELIVERY) => DeliveryOption::Delivery,
        Some(reply_ids::SELECT_PICKUP) => DeliveryOption::Pickup,
        _ => {
            return Ok(TransitionResult::new(ConvState::AwaitingDeliveryChoice)
                .with_effect(Effect::Reply(delivery_prompt())))
        }
    };

    if shop.set_delivery_option(option)?.is_none() {
        return Ok(TransitionResult::reply(ConvState::AwaitingCommand, CART_GONE));
    }
    match option {
        DeliveryOption::Delivery => Ok(TransitionResult::reply(
            ConvState::AwaitingDeliveryAddress,
            ADDRESS_PROMPT,
        )),
        DeliveryOption::Pickup => begin_payment(ctx, shop),
    }
}

fn awaiting_delivery_address(
    ctx: &ConvContext,
    shop: &mut dyn Shop,
    message: &InboundMessage,
) -> Result<TransitionResult, TransitionError> {
    let address = match message {
        InboundMessage::Text { body } if !body.trim().is_empty() => {
            DeliveryAddress::text(body.trim())
        }
        InboundMessage::Location {
            latitude,
            longitude,
            address,
        } => DeliveryAddress::pin(*latitude, *longitude, address.clone()),
        _ => {
            return Ok(TransitionResult::reply(
                ConvState::AwaitingDeliveryAddress,
                ADDRESS_REPROMPT,
            ))
        }
    };

    if shop.set_delivery_address(&address)?.is_none() {
        return Ok(TransitionResult::reply(ConvState::AwaitingCommand, CART_GONE));
    }
    begin_payment(ctx, shop)
}

/// Enter payment confirmation and ask the runtime to push the payment.
///
/// The correlation id is recorded when `PaymentInitiated` comes back. Only
/// one push per cart may be in flight; the claim is dropped again when the
/// push fails.
fn begin_payment(
    ctx: &ConvContext,
    shop: &mut dyn Shop,
) -> Result<TransitionResult, TransitionError> {
    if let Some(cart) = shop.current_cart()?.filter(|c| !c.is_empty()) {
        if !shop.claim_payment_request(cart.order.id)? {
            return Ok(TransitionResult::reply(
                ConvState::AwaitingPaymentConfirmation,
                PAYMENT_PENDING,
            ));
        }
        return Ok(
            TransitionResult::new(ConvState::AwaitingPaymentConfirmation).with_effect(
                Effect::InitiatePayment {
                    order_id: cart.order.id,
                    amount: cart.order.total_amount,
                    phone: ctx.customer_phone.clone(),
                },
            ),
        );
    }
    if shop.awaiting_payment()?.is_some() {
        return Ok(TransitionResult::reply(
            ConvState::AwaitingPaymentConfirmation,
            PAYMENT_PENDING,
        ));
    }
    Ok(TransitionResult::reply(
        ConvState::AwaitingCommand,
        "Sorry, I couldn't find your cart to proceed with payment. Type 'menu' to start again.",
    ))
}

pub(crate) fn money(amount: Decimal) -> String {
    format!("KES {:.2}", amount)
}
