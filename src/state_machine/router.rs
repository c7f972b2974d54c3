//! Global commands that override the current state
//!
//! Checked before any state handler, so a stuck conversation can always be
//! rescued by typing "menu".

use super::event::InboundMessage;

/// Reply ids shared between the prompts the engine sends and the handlers
/// that read the customer's taps
pub mod reply_ids {
    pub const SHOW_MENU: &str = "show_menu";
    pub const KEEP_SHOPPING: &str = "keep_shopping";
    pub const VIEW_CART: &str = "view_cart";
    pub const SEARCH: &str = "search_by_keyword";
    pub const VIEW_ALL_PRODUCTS: &str = "view_all_products";
    pub const CHECKOUT: &str = "checkout";
    pub const SELECT_DELIVERY: &str = "select_delivery";
    pub const SELECT_PICKUP: &str = "select_pickup";

    pub const SELECT_PRODUCT_PREFIX: &str = "select_product_";
    pub const ADD_TO_CART_PREFIX: &str = "add_to_cart_";
    pub const SELECT_SIZE_PREFIX: &str = "select_size_";
}

const MENU_WORDS: &[&str] = &["hi", "hello", "hey", "menu"];
const MENU_REPLIES: &[&str] = &[reply_ids::SHOW_MENU, reply_ids::KEEP_SHOPPING];
const CART_WORDS: &[&str] = &["view cart"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCommand {
    /// Show the main menu
    Menu,
    /// Show the cart summary
    ViewCart,
}

/// Trim and lowercase free text
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// The global command this message triggers, if any
pub fn global_command(message: &InboundMessage) -> Option<GlobalCommand> {
    let text = message.text_body().map(normalize);
    let text = text.as_deref();
    let reply = message.reply_id();

    let matches = |words: &[&str], replies: &[&str]| {
        text.is_some_and(|t| words.contains(&t)) || reply.is_some_and(|r| replies.contains(&r))
    };

    if matches(MENU_WORDS, MENU_REPLIES) {
        Some(GlobalCommand::Menu)
    } else if matches(CART_WORDS, &[reply_ids::VIEW_CART]) {
        Some(GlobalCommand::ViewCart)
    } else {
        None
    }
}

/// Parse the numeric id after `prefix`, e.g. `select_product_7` -> 7
pub fn id_with_prefix(reply_id: &str, prefix: &str) -> Option<i64> {
    reply_id.strip_prefix(prefix)?.parse().ok()
}
