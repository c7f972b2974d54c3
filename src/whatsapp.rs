//! WhatsApp Cloud API adapter
//!
//! Outbound sends, inbound webhook decoding and webhook signature checks.

use crate::state_machine::event::{InboundEnvelope, InboundMessage};
use crate::state_machine::outbound::OutboundMessage;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v19.0";
pub const FOOTER: &str = "Reply 'menu' for options or 'view cart' to view your cart.";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub api_base: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Chat transport is not configured")]
    NotConfigured,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Send rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub struct WhatsAppClient {
    client: Client,
    config: Option<WhatsAppConfig>,
}

impl WhatsAppClient {
    pub fn new(config: Option<WhatsAppConfig>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { client, config }
    }

    pub async fn send_message(
        &self,
        to: &str,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let config = self.config.as_ref().ok_or(TransportError::NotConfigured)?;
        let url = format!(
            "{}/{}/messages",
            config.api_base.trim_end_matches('/'),
            config.phone_number_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.access_token)
            .json(&cloud_api_payload(to, message))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Network(format!("Request timeout: {e}"))
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Cloud API request body for one outbound message
pub fn cloud_api_payload(to: &str, message: &OutboundMessage) -> Value {
    let body = match message {
        OutboundMessage::Text { body } => {
            return json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": { "body": body },
            });
        }
        OutboundMessage::Buttons { body, buttons } => json!({
            "type": "button",
            "body": { "text": body },
            "footer": { "text": FOOTER },
            "action": {
                "buttons": buttons.iter().map(|b| json!({
                    "type": "reply",
                    "reply": { "id": b.id, "title": b.title },
                })).collect::<Vec<_>>(),
            },
        }),
        OutboundMessage::List {
            header,
            body,
            button,
            rows,
        } => json!({
            "type": "list",
            "header": { "type": "text", "text": header },
            "body": { "text": body },
            "footer": { "text": FOOTER },
            "action": {
                "button": button,
                "sections": [{
                    "title": header,
                    "rows": rows.iter().map(|r| {
                        let mut row = json!({ "id": r.id, "title": r.title });
                        if let Some(description) = &r.description {
                            row["description"] = json!(description);
                        }
                        row
                    }).collect::<Vec<_>>(),
                }],
            },
        }),
    };
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "interactive",
        "interactive": body,
    })
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<ChangeMetadata>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    /// Delivery receipts; logged and dropped
    #[serde(default)]
    pub statuses: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeMetadata {
    pub phone_number_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Contact {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub from: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<WireText>,
    #[serde(default)]
    pub interactive: Option<WireInteractive>,
    #[serde(default)]
    pub location: Option<WireLocation>,
}

#[derive(Debug, Deserialize)]
pub struct WireText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WireInteractive {
    #[serde(default)]
    pub button_reply: Option<WireReply>,
    #[serde(default)]
    pub list_reply: Option<WireReply>,
}

#[derive(Debug, Deserialize)]
pub struct WireReply {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct WireLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl WireMessage {
    fn decode(self) -> InboundMessage {
        match self.kind.as_str() {
            "text" => match self.text {
                Some(text) => InboundMessage::Text { body: text.body },
                None => InboundMessage::Unsupported { kind: self.kind },
            },
            "interactive" => match self.interactive {
                Some(WireInteractive {
                    button_reply: Some(reply),
                    ..
                }) => InboundMessage::ButtonReply {
                    id: reply.id,
                    title: reply.title,
                },
                Some(WireInteractive {
                    list_reply: Some(reply),
                    ..
                }) => InboundMessage::ListReply {
                    id: reply.id,
                    title: reply.title,
                },
                _ => InboundMessage::Unsupported { kind: self.kind },
            },
            "location" => match self.location {
                Some(location) => InboundMessage::Location {
                    latitude: location.latitude,
                    longitude: location.longitude,
                    address: location.address.or(location.name),
                },
                None => InboundMessage::Unsupported { kind: self.kind },
            },
            _ => InboundMessage::Unsupported { kind: self.kind },
        }
    }
}

/// Flatten a webhook delivery into one envelope per customer message
pub fn parse_webhook(payload: WebhookPayload) -> Vec<InboundEnvelope> {
    let mut envelopes = Vec::new();
    for change in payload.entry.into_iter().flat_map(|e| e.changes) {
        let value = change.value;
        if !value.statuses.is_empty() {
            tracing::debug!(count = value.statuses.len(), "Ignoring delivery status updates");
        }
        let Some(metadata) = value.metadata else {
            continue;
        };
        for message in value.messages {
            let customer_name = value
                .contacts
                .iter()
                .find(|c| c.wa_id == message.from)
                .and_then(|c| c.profile.as_ref())
                .and_then(|p| p.name.clone());
            let from = message.from.clone();
            let message = message.decode();
            if let InboundMessage::Unsupported { kind } = &message {
                tracing::info!(customer = %from, kind = %kind, "Unsupported message kind");
            }
            envelopes.push(InboundEnvelope {
                business_id: metadata.phone_number_id.clone(),
                from,
                customer_name,
                message,
            });
        }
    }
    envelopes
}

/// Check `X-Hub-Signature-256: sha256=<hex>` against the raw body
pub fn verify_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
