//! M-Pesa STK callback payload

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    /// Number in practice; strings are tolerated
    #[serde(rename = "ResultCode", default)]
    pub result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    pub metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Value,
}

impl StkCallback {
    /// Decode the raw webhook body
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<CallbackEnvelope>(body).map(|e| e.body.stk_callback)
    }

    /// The correlation id, when present and non-empty
    pub fn checkout_reference(&self) -> Option<&str> {
        self.checkout_request_id
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    pub fn is_success(&self) -> bool {
        match &self.result_code {
            Value::Number(n) => n.as_i64() == Some(0),
            Value::String(s) => s.trim() == "0",
            _ => false,
        }
    }

    pub fn description(&self) -> &str {
        self.result_desc
            .as_deref()
            .unwrap_or("Payment was not completed.")
    }

    /// Processor transaction id of a successful payment
    pub fn receipt_number(&self) -> Option<String> {
        let item = self
            .metadata
            .as_ref()?
            .items
            .iter()
            .find(|i| i.name == "MpesaReceiptNumber")?;
        match &item.value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
