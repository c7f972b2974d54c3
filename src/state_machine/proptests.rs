//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::outbound::{BUTTON_TITLE_LIMIT, MAX_BUTTONS, MAX_LIST_ROWS, ROW_TITLE_LIMIT};
use super::*;
use crate::db::test_support::db_with_seller;
use crate::db::{self, insert_product, NewProduct};
use crate::runtime::testing::MockShop;
use crate::runtime::{Shop, TxShop};
use proptest::prelude::*;
use rust_decimal::Decimal;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> ConvContext {
    ConvContext::new(1, "254711000111", 1, "Duka")
}

/// Catalog with sized and unsized products, ids 1..=4
fn stocked_shop() -> MockShop {
    let mut shop = MockShop::default();
    shop.add_product(1, "Red Kikoi", Decimal::from(450), &[]);
    shop.add_product(2, "Blue Kikoi", Decimal::from(450), &[]);
    shop.add_product(3, "Sandals", Decimal::from(800), &["40", "41"]);
    shop.add_product(4, "Kanga Dress", Decimal::from(1200), &["XS", "S", "M", "L", "XL"]);
    shop
}

fn message_fits_platform(message: &OutboundMessage) -> bool {
    match message {
        OutboundMessage::Text { .. } => true,
        OutboundMessage::Buttons { buttons, .. } => {
            buttons.len() <= MAX_BUTTONS
                && buttons
                    .iter()
                    .all(|b| b.title.chars().count() <= BUTTON_TITLE_LIMIT)
        }
        OutboundMessage::List { rows, .. } => {
            rows.len() <= MAX_LIST_ROWS
                && rows
                    .iter()
                    .all(|r| r.title.chars().count() <= ROW_TITLE_LIMIT)
        }
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = ConvState> {
    let product_id = 1i64..6;
    prop_oneof![
        Just(ConvState::Started),
        Just(ConvState::AwaitingCommand),
        Just(ConvState::AwaitingProductSelection),
        product_id
            .clone()
            .prop_map(|product_id| ConvState::AwaitingProductAction { product_id }),
        product_id
            .clone()
            .prop_map(|product_id| ConvState::AwaitingSizeSelection { product_id }),
        (product_id, proptest::option::of("[A-Z0-9]{1,3}"))
            .prop_map(|(product_id, size)| ConvState::AwaitingQuantity { product_id, size }),
        Just(ConvState::ViewingCart),
        Just(ConvState::AwaitingDeliveryChoice),
        Just(ConvState::AwaitingDeliveryAddress),
        Just(ConvState::AwaitingPaymentConfirmation),
    ]
}

fn arb_reply_id() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("show_menu".to_string()),
        Just("keep_shopping".to_string()),
        Just("view_cart".to_string()),
        Just("search_by_keyword".to_string()),
        Just("view_all_products".to_string()),
        Just("checkout".to_string()),
        Just("select_delivery".to_string()),
        Just("select_pickup".to_string()),
        (0i64..6).prop_map(|id| format!("select_product_{id}")),
        (0i64..6).prop_map(|id| format!("add_to_cart_{id}")),
        prop_oneof![Just("40"), Just("41"), Just("M"), Just("??")]
            .prop_map(|size| format!("select_size_{size}")),
        "[a-z_]{0,20}",
    ]
}

fn arb_inbound() -> impl Strategy<Value = InboundMessage> {
    prop_oneof![
        prop_oneof![
            Just("menu".to_string()),
            Just("view cart".to_string()),
            Just("checkout".to_string()),
            Just("kikoi".to_string()),
            (-3i64..8).prop_map(|n| n.to_string()),
            "\\PC{0,40}",
        ]
        .prop_map(InboundMessage::text),
        arb_reply_id().prop_map(InboundMessage::button),
        arb_reply_id().prop_map(InboundMessage::list),
        (-90.0f64..90.0, -180.0f64..180.0).prop_map(|(latitude, longitude)| {
            InboundMessage::Location {
                latitude,
                longitude,
                address: None,
            }
        }),
        "[a-z]{3,8}".prop_map(|kind| InboundMessage::Unsupported { kind }),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Any inbound sequence from any state is handled without error, and every
    // reply stays within what the chat platform accepts
    #[test]
    fn prop_engine_is_total(
        start in arb_state(),
        messages in proptest::collection::vec(arb_inbound(), 1..25),
    ) {
        let mut shop = stocked_shop();
        let ctx = test_context();
        let mut state = start;

        for message in messages {
            let result = transition(&state, &ctx, &mut shop, Event::Inbound(message));
            prop_assert!(result.is_ok(), "transition failed: {:?}", result.err());
            let result = result.unwrap();
            prop_assert!(!result.effects.is_empty(), "every turn answers the customer");
            for reply in result.replies() {
                prop_assert!(message_fits_platform(reply), "oversized reply: {:?}", reply);
            }
            state = result.new_state;
        }
    }

    // "menu" from anywhere lands on the menu, and repeating it is idempotent
    #[test]
    fn prop_menu_reentry_is_idempotent(start in arb_state(), word in prop_oneof![
        Just("menu"), Just("hi"), Just("Hello"), Just("  HEY  ")
    ]) {
        let mut shop = stocked_shop();
        let ctx = test_context();

        let first = transition(&start, &ctx, &mut shop, Event::Inbound(InboundMessage::text(word))).unwrap();
        prop_assert_eq!(&first.new_state, &ConvState::AwaitingCommand);

        let second = transition(&first.new_state, &ctx, &mut shop, Event::Inbound(InboundMessage::text(word))).unwrap();
        prop_assert_eq!(&second.new_state, &ConvState::AwaitingCommand);
        prop_assert_eq!(&first.effects, &second.effects);
    }

    // "view cart" overrides every state
    #[test]
    fn prop_view_cart_from_anywhere(start in arb_state(), quantity in 1u32..5) {
        let mut shop = stocked_shop();
        shop.put_in_cart(1, quantity, None);

        let result = transition(
            &start,
            &test_context(),
            &mut shop,
            Event::Inbound(InboundMessage::text("view cart")),
        )
        .unwrap();
        prop_assert_eq!(result.new_state, ConvState::ViewingCart);
    }

    // Garbage in the quantity step never reaches the cart
    #[test]
    fn prop_bad_quantity_keeps_asking(text in "[a-zA-Z ]{1,12}|-[0-9]{1,3}|0") {
        prop_assume!(!["hi", "hey", "menu", "hello", "view cart"].contains(&text.trim().to_lowercase().as_str()));
        let mut shop = stocked_shop();
        let state = ConvState::AwaitingQuantity { product_id: 1, size: None };

        let result = transition(&state, &test_context(), &mut shop, Event::Inbound(InboundMessage::text(text))).unwrap();
        prop_assert_eq!(result.new_state, state);
        prop_assert!(shop.cart_items().is_empty());
    }

    // Stored states decode to themselves
    #[test]
    fn prop_state_storage_is_lossless(state in arb_state()) {
        prop_assert_eq!(ConvState::from_stored(&state.to_stored()), state);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // The persisted total always equals the sum of its lines
    #[test]
    fn prop_cart_total_matches_lines(
        adds in proptest::collection::vec((0usize..3, 1u32..6, proptest::option::of(0usize..2)), 1..15),
    ) {
        let (db, seller) = db_with_seller();
        db.transaction(|tx| {
            let catalog = [
                ("Kikoi", Decimal::new(45050, 2), &[][..]),
                ("Sandals", Decimal::from(800), &["40", "41"][..]),
                ("Beads", Decimal::new(1999, 2), &[][..]),
            ];
            let mut products = Vec::new();
            for (name, price, sizes) in catalog {
                products.push(insert_product(tx, &NewProduct {
                    seller_id: seller.id,
                    name,
                    description: "",
                    price,
                    sizes,
                    inventory_count: 100,
                })?);
            }

            db::get_or_create_customer(tx, "254711000111", None)?;
            let mut shop = TxShop::new(tx, "254711000111", seller.id);
            for (index, quantity, size) in &adds {
                let product = &products[*index];
                let size = size.and_then(|s| product.sizes.get(s)).map(String::as_str);
                let cart = shop.add_to_cart(product, *quantity, size)?;
                assert_eq!(cart.order.total_amount, cart.items_total());

                let stored = db::get_order(tx, cart.order.id)?;
                assert_eq!(stored.total_amount, cart.items_total());
            }

            let cart = shop.current_cart()?.unwrap();
            let expected: i64 = adds.iter().map(|(_, q, _)| i64::from(*q)).sum();
            let actual: i64 = cart.items.iter().map(|i| i64::from(i.quantity)).sum();
            assert_eq!(actual, expected);
            Ok::<_, db::DbError>(())
        })
        .unwrap();
    }
}
