//! Environment-driven configuration
//!
//! Missing integration credentials never stop the server; the affected
//! client is built unconfigured and fails at call time.

use crate::payments::{MpesaConfig, SANDBOX_BASE_URL};
use crate::whatsapp::{WhatsAppConfig, DEFAULT_API_BASE};
use std::path::PathBuf;

pub const CALLBACK_PATH: &str = "/api/payments/mpesa-callback";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub whatsapp: Option<WhatsAppConfig>,
    /// Echoed back during webhook subscription
    pub verify_token: Option<String>,
    /// Enables `X-Hub-Signature-256` checks when set
    pub app_secret: Option<String>,
    pub mpesa: Option<MpesaConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = var("CHATSHOP_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".chatshop").join("chatshop.db")
            },
            PathBuf::from,
        );
        let port = var("CHATSHOP_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let whatsapp = match (var("WHATSAPP_ACCESS_TOKEN"), var("WHATSAPP_PHONE_NUMBER_ID")) {
            (Some(access_token), Some(phone_number_id)) => Some(WhatsAppConfig {
                access_token,
                phone_number_id,
                api_base: var("WHATSAPP_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            }),
            _ => None,
        };

        let callback_url = var("APP_DOMAIN").map(|domain| callback_url(&domain));
        let mpesa = match (
            var("MPESA_CONSUMER_KEY"),
            var("MPESA_CONSUMER_SECRET"),
            var("MPESA_SHORTCODE"),
            var("MPESA_PASSKEY"),
        ) {
            (Some(consumer_key), Some(consumer_secret), Some(shortcode), Some(passkey)) => {
                Some(MpesaConfig {
                    consumer_key,
                    consumer_secret,
                    shortcode,
                    passkey,
                    base_url: var("MPESA_BASE_URL").unwrap_or_else(|| SANDBOX_BASE_URL.to_string()),
                    callback_url,
                })
            }
            _ => None,
        };

        Self {
            db_path,
            port,
            whatsapp,
            verify_token: var("WHATSAPP_VERIFY_TOKEN"),
            app_secret: var("WHATSAPP_APP_SECRET"),
            mpesa,
        }
    }
}

/// `https://<domain>/api/payments/mpesa-callback`, keeping an explicit scheme
pub fn callback_url(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    if domain.starts_with("https://") || domain.starts_with("http://") {
        format!("{domain}{CALLBACK_PATH}")
    } else {
        format!("https://{domain}{CALLBACK_PATH}")
    }
}
