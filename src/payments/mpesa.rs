//! M-Pesa Daraja STK push client

use super::{PaymentError, PaymentRequest};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Daraja timestamps are East Africa Time
const EAT_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub base_url: String,
    /// Where the processor posts the result; built from the public domain
    pub callback_url: Option<String>,
}

pub struct MpesaClient {
    client: Client,
    config: Option<MpesaConfig>,
}

impl MpesaClient {
    /// A client with `None` config fails every push with `NotConfigured`
    pub fn new(config: Option<MpesaConfig>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });
        Self { client, config }
    }

    async fn access_token(&self, config: &MpesaConfig) -> Result<String, PaymentError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .basic_auth(&config.consumer_key, Some(&config.consumer_secret))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::network(format!("Failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(PaymentError::rejected(format!(
                "Token request failed with HTTP {status}: {body}"
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            PaymentError::invalid_response(format!("Failed to parse token response: {e}"))
        })?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PaymentError::invalid_response("Token response had no access_token"))
    }

    /// Push a payment prompt to the payer's phone.
    ///
    /// Returns the `CheckoutRequestID` the callback will carry.
    pub async fn stk_push(&self, request: &PaymentRequest) -> Result<String, PaymentError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PaymentError::not_configured("M-Pesa credentials are not set"))?;
        let callback_url = config
            .callback_url
            .as_deref()
            .ok_or_else(|| PaymentError::not_configured("APP_DOMAIN is not set"))?;
        let amount = whole_amount(request.amount)?;

        let token = self.access_token(config).await?;
        let timestamp = timestamp(Utc::now());
        let phone = normalize_phone(&request.phone);
        let body = StkPushRequest {
            business_short_code: &config.shortcode,
            password: stk_password(&config.shortcode, &config.passkey, &timestamp),
            timestamp: &timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: &phone,
            party_b: &config.shortcode,
            phone_number: &phone,
            call_back_url: callback_url,
            account_reference: request.order_id.to_string(),
            transaction_desc: format!("Payment for Order #{}", request.order_id),
        };

        let url = format!(
            "{}/mpesa/stkpush/v1/processrequest",
            config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PaymentError::network(format!("Failed to read STK response: {e}")))?;
        if !status.is_success() {
            return Err(PaymentError::rejected(format!("HTTP {status}: {text}")));
        }

        let parsed: StkPushResponse = serde_json::from_str(&text).map_err(|e| {
            PaymentError::invalid_response(format!("Failed to parse STK response: {e} - body: {text}"))
        })?;
        accepted_reference(parsed)
    }
}

fn request_error(e: reqwest::Error) -> PaymentError {
    if e.is_timeout() {
        PaymentError::network(format!("Request timeout: {e}"))
    } else if e.is_connect() {
        PaymentError::network(format!("Connection failed: {e}"))
    } else {
        PaymentError::network(format!("Request failed: {e}"))
    }
}

fn accepted_reference(response: StkPushResponse) -> Result<String, PaymentError> {
    if response.response_code.as_deref() != Some("0") {
        let reason = response
            .error_message
            .or(response.response_description)
            .unwrap_or_else(|| "STK push was not accepted".to_string());
        return Err(PaymentError::rejected(reason));
    }
    response
        .checkout_request_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PaymentError::invalid_response("Accepted STK push had no CheckoutRequestID"))
}

/// `+2547…` and `07…` become `2547…`; anything else passes through
pub fn normalize_phone(phone: &str) -> String {
    let phone = phone.trim();
    if let Some(rest) = phone.strip_prefix('+') {
        rest.to_string()
    } else if let Some(rest) = phone.strip_prefix('0') {
        format!("254{rest}")
    } else {
        phone.to_string()
    }
}

/// `base64(shortcode + passkey + timestamp)`
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}

/// `YYYYMMDDHHMMSS` in East Africa Time
pub fn timestamp(now: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(EAT_OFFSET_SECS) {
        Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
        None => now.format("%Y%m%d%H%M%S").to_string(),
    }
}

/// The processor only takes whole shillings; cents are rounded up
pub fn whole_amount(amount: Decimal) -> Result<i64, PaymentError> {
    amount
        .ceil()
        .to_i64()
        .filter(|a| *a >= 1)
        .ok_or_else(|| PaymentError::rejected(format!("Cannot charge an amount of {amount}")))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: &'a str,
    transaction_type: &'a str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: &'a str,
    account_reference: String,
    transaction_desc: String,
}

#[derive(Debug, Default, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}
