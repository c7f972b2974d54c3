//! Outbound chat payloads
//!
//! Interactive messages are clamped to what chat platforms accept: at most
//! three reply buttons and ten list rows, with short titles.

use serde::Serialize;

pub const MAX_BUTTONS: usize = 3;
pub const BUTTON_TITLE_LIMIT: usize = 20;
pub const MAX_LIST_ROWS: usize = 10;
pub const ROW_TITLE_LIMIT: usize = 24;
pub const ROW_DESCRIPTION_LIMIT: usize = 72;
pub const LIST_BUTTON_LIMIT: usize = 20;
pub const HEADER_LIMIT: usize = 60;

/// A message for the customer, independent of any transport's wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Buttons {
        body: String,
        buttons: Vec<ReplyButton>,
    },
    List {
        header: String,
        body: String,
        button: String,
        rows: Vec<ListRow>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ListRow {
    pub fn new(id: impl Into<String>, title: &str, description: Option<&str>) -> Self {
        Self {
            id: id.into(),
            title: truncate_chars(title, ROW_TITLE_LIMIT),
            description: description.map(|d| truncate_chars(d, ROW_DESCRIPTION_LIMIT)),
        }
    }
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutboundMessage::Text { body: body.into() }
    }

    /// Reply-button message from `(id, title)` pairs; extra buttons are dropped
    pub fn buttons<'a>(
        body: impl Into<String>,
        buttons: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        OutboundMessage::Buttons {
            body: body.into(),
            buttons: buttons
                .into_iter()
                .take(MAX_BUTTONS)
                .map(|(id, title)| ReplyButton {
                    id: id.to_string(),
                    title: truncate_chars(title, BUTTON_TITLE_LIMIT),
                })
                .collect(),
        }
    }

    /// Single-section list message; rows past the platform limit are dropped
    pub fn list(
        header: &str,
        body: impl Into<String>,
        button: &str,
        rows: impl IntoIterator<Item = ListRow>,
    ) -> Self {
        OutboundMessage::List {
            header: truncate_chars(header, HEADER_LIMIT),
            body: body.into(),
            button: truncate_chars(button, LIST_BUTTON_LIMIT),
            rows: rows.into_iter().take(MAX_LIST_ROWS).collect(),
        }
    }

    /// The main text of the message
    pub fn body(&self) -> &str {
        match self {
            OutboundMessage::Text { body }
            | OutboundMessage::Buttons { body, .. }
            | OutboundMessage::List { body, .. } => body,
        }
    }

    /// Ids the customer can tap in reply
    #[allow(dead_code)] // Used in tests
    pub fn reply_ids(&self) -> Vec<&str> {
        match self {
            OutboundMessage::Text { .. } => vec![],
            OutboundMessage::Buttons { buttons, .. } => {
                buttons.iter().map(|b| b.id.as_str()).collect()
            }
            OutboundMessage::List { rows, .. } => rows.iter().map(|r| r.id.as_str()).collect(),
        }
    }
}

impl From<&str> for OutboundMessage {
    fn from(body: &str) -> Self {
        OutboundMessage::text(body)
    }
}

impl From<String> for OutboundMessage {
    fn from(body: String) -> Self {
        OutboundMessage::text(body)
    }
}

/// Cut to at most `max` characters, never splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
