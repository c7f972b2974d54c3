//! Chat shop - multi-tenant conversational commerce backend
//!
//! Customers browse, fill a cart and pay with mobile money over chat;
//! sellers watch orders and conversations arrive live.

mod api;
mod config;
mod db;
mod notify;
mod payments;
mod runtime;
mod state_machine;
mod whatsapp;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatshop=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let config = AppConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    if config.whatsapp.is_none() {
        tracing::warn!(
            "WhatsApp is not configured. Set WHATSAPP_ACCESS_TOKEN and WHATSAPP_PHONE_NUMBER_ID."
        );
    }
    if config.verify_token.is_none() {
        tracing::warn!("WHATSAPP_VERIFY_TOKEN is not set; webhook verification will fail.");
    }
    match &config.mpesa {
        None => tracing::warn!(
            "M-Pesa is not configured. Payments will fail until MPESA_* variables are set."
        ),
        Some(mpesa) if mpesa.callback_url.is_none() => {
            tracing::warn!("APP_DOMAIN is not set; payments cannot be initiated without a callback URL.");
        }
        Some(_) => {}
    }

    // Create application state
    let state = AppState::new(db, &config);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Chat shop server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
