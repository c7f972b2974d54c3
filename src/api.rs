//! HTTP API for the chat shop
//!
//! Webhooks for the chat platform and the payment processor, plus the
//! seller dashboard surface.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::config::AppConfig;
use crate::db::Database;
use crate::notify::SellerHub;
use crate::payments::MpesaClient;
use crate::runtime::{ChatTransport, ConversationRuntime, PaymentGateway, ProductionRuntime};
use crate::whatsapp::WhatsAppClient;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState<T: ChatTransport, P: PaymentGateway> {
    pub runtime: Arc<ConversationRuntime<T, P>>,
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
}

// Manual impl: derive would require `T: Clone` and `P: Clone`
impl<T: ChatTransport, P: PaymentGateway> Clone for AppState<T, P> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            verify_token: self.verify_token.clone(),
            app_secret: self.app_secret.clone(),
        }
    }
}

impl AppState<WhatsAppClient, MpesaClient> {
    pub fn new(db: Database, config: &AppConfig) -> Self {
        let runtime: ProductionRuntime = ConversationRuntime::new(
            db,
            Arc::new(WhatsAppClient::new(config.whatsapp.clone())),
            Arc::new(MpesaClient::new(config.mpesa.clone())),
            Arc::new(SellerHub::new()),
        );
        Self {
            runtime: Arc::new(runtime),
            verify_token: config.verify_token.clone(),
            app_secret: config.app_secret.clone(),
        }
    }
}
