//! Outbound messaging capability.
//!
//! Flows, the alert engine and the dispatcher build [`OutboundMessage`]
//! values and hand them to a [`Messenger`]. Two implementations exist: the
//! provider's Cloud API client and a recording messenger used for dry runs
//! and tests.

pub mod cloud_api;
pub mod recording;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::GeoPoint;

pub use cloud_api::CloudApiMessenger;
pub use recording::RecordingMessenger;

/// Provider cap on reply buttons per message.
pub const MAX_BUTTONS: usize = 3;
/// Provider cap on rows across all sections of a list message.
pub const MAX_LIST_ROWS: usize = 10;
/// Provider cap on a button title.
pub const BUTTON_TITLE_MAX: usize = 20;
/// Provider cap on a list row title.
pub const ROW_TITLE_MAX: usize = 24;
/// Provider cap on a list row description.
pub const ROW_DESCRIPTION_MAX: usize = 72;

/// A quick-reply button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Selection id echoed back when tapped.
    pub id: String,
    /// Visible label.
    pub title: String,
}

impl Button {
    /// Creates a button, clipping the title to the provider limit.
    #[must_use]
    pub fn new(id: impl Into<String>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: clip(title, BUTTON_TITLE_MAX),
        }
    }
}

/// One row of a list message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    /// Selection id echoed back when picked.
    pub id: String,
    /// Row title.
    pub title: String,
    /// Optional second line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ListRow {
    /// Creates a row, clipping text to the provider limits.
    #[must_use]
    pub fn new(id: impl Into<String>, title: &str, description: Option<&str>) -> Self {
        Self {
            id: id.into(),
            title: clip(title, ROW_TITLE_MAX),
            description: description.map(|d| clip(d, ROW_DESCRIPTION_MAX)),
        }
    }
}

/// A titled group of list rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    /// Section heading.
    pub title: String,
    /// Rows in display order.
    pub rows: Vec<ListRow>,
}

/// Kind of media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Photo.
    Image,
    /// File attachment.
    Document,
}

impl MediaKind {
    /// Provider message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
        }
    }
}

/// Content of an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundBody {
    /// Plain text.
    Text {
        /// Message text.
        body: String,
    },
    /// Text with up to [`MAX_BUTTONS`] reply buttons.
    Buttons {
        /// Optional bold header.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        /// Message text.
        body: String,
        /// Reply buttons.
        buttons: Vec<Button>,
    },
    /// Text with a menu of up to [`MAX_LIST_ROWS`] rows.
    List {
        /// Message text.
        body: String,
        /// Label of the button that opens the menu.
        button_label: String,
        /// Menu sections.
        sections: Vec<ListSection>,
    },
    /// A location pin.
    Location {
        /// Coordinates.
        at: GeoPoint,
        /// Place name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Provider-hosted media re-sent by id.
    Media {
        /// Attachment kind.
        kind: MediaKind,
        /// Provider media id.
        media_id: String,
        /// Caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    /// Asks the recipient to share their location.
    LocationRequest {
        /// Prompt text.
        body: String,
    },
}

/// A message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient phone.
    pub to: String,
    /// Content.
    pub body: OutboundBody,
}

impl OutboundMessage {
    /// Plain text message.
    #[must_use]
    pub fn text(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: OutboundBody::Text { body: body.into() },
        }
    }

    /// Text with reply buttons. Buttons past [`MAX_BUTTONS`] are dropped.
    #[must_use]
    pub fn buttons(to: impl Into<String>, body: impl Into<String>, mut buttons: Vec<Button>) -> Self {
        buttons.truncate(MAX_BUTTONS);
        Self {
            to: to.into(),
            body: OutboundBody::Buttons {
                header: None,
                body: body.into(),
                buttons,
            },
        }
    }

    /// Sets the header of a button message; no-op for other bodies.
    #[must_use]
    pub fn with_header(mut self, title: impl Into<String>) -> Self {
        if let OutboundBody::Buttons { header, .. } = &mut self.body {
            *header = Some(title.into());
        }
        self
    }

    /// Single-section list message. Rows past [`MAX_LIST_ROWS`] are
    /// dropped.
    #[must_use]
    pub fn list(
        to: impl Into<String>,
        body: impl Into<String>,
        button_label: &str,
        section_title: &str,
        mut rows: Vec<ListRow>,
    ) -> Self {
        rows.truncate(MAX_LIST_ROWS);
        Self {
            to: to.into(),
            body: OutboundBody::List {
                body: body.into(),
                button_label: clip(button_label, BUTTON_TITLE_MAX),
                sections: vec![ListSection {
                    title: clip(section_title, ROW_TITLE_MAX),
                    rows,
                }],
            },
        }
    }

    /// Location pin.
    #[must_use]
    pub fn location(to: impl Into<String>, at: GeoPoint, name: Option<String>) -> Self {
        Self {
            to: to.into(),
            body: OutboundBody::Location { at, name },
        }
    }

    /// Image re-sent from a provider media id.
    #[must_use]
    pub fn image(to: impl Into<String>, media_id: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            to: to.into(),
            body: OutboundBody::Media {
                kind: MediaKind::Image,
                media_id: media_id.into(),
                caption,
            },
        }
    }

    /// Location-share request.
    #[must_use]
    pub fn location_request(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: OutboundBody::LocationRequest { body: body.into() },
        }
    }

    /// Checks provider limits that constructors cannot enforce alone.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::Invalid`] for an empty recipient, an
    /// empty text body, no buttons, or a list over the row cap.
    pub fn validate(&self) -> Result<(), MessengerError> {
        if self.to.trim().is_empty() {
            return Err(MessengerError::Invalid("recipient is empty".to_string()));
        }
        match &self.body {
            OutboundBody::Text { body } | OutboundBody::LocationRequest { body }
                if body.trim().is_empty() =>
            {
                Err(MessengerError::Invalid("message body is empty".to_string()))
            }
            OutboundBody::Buttons { buttons, .. }
                if buttons.is_empty() || buttons.len() > MAX_BUTTONS =>
            {
                Err(MessengerError::Invalid(format!(
                    "button messages need 1..={MAX_BUTTONS} buttons, got {}",
                    buttons.len()
                )))
            }
            OutboundBody::List { sections, .. } => {
                let rows: usize = sections.iter().map(|s| s.rows.len()).sum();
                if rows == 0 || rows > MAX_LIST_ROWS {
                    return Err(MessengerError::Invalid(format!(
                        "list messages need 1..={MAX_LIST_ROWS} rows, got {rows}"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Provider acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    /// Provider message id used to attribute delivery receipts.
    pub provider_message_id: Option<String>,
}

/// Failures raised by a [`Messenger`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessengerError {
    /// The message breaks a provider limit and was not sent.
    #[error("invalid outbound message: {0}")]
    Invalid(String),

    /// The provider answered with a non-success status.
    #[error("provider rejected message: status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request never reached the provider.
    #[error("transport error: {0}")]
    Transport(String),
}

impl MessengerError {
    /// `true` for errors worth retrying later (throttling, provider outages,
    /// transport failures).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Invalid(_) => false,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) => true,
        }
    }
}

/// Sends messages through the chat provider.
#[async_trait]
pub trait Messenger: Send + Sync + std::fmt::Debug {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError`] when the message is invalid, rejected or
    /// cannot be transmitted.
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, MessengerError>;
}

/// Clips `text` to at most `max` characters on a char boundary.
#[must_use]
pub fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text.get(..cut).unwrap_or(text).to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("Karimeen (Pearl Spot) fresh", 8), "Karimeen");
        assert_eq!(clip("₹₹₹₹", 2), "₹₹");
        assert_eq!(clip("short", 20), "short");
    }

    #[test]
    fn constructors_enforce_provider_caps() {
        let buttons = (0..5).map(|i| Button::new(format!("b{i}"), "Tap")).collect();
        let msg = OutboundMessage::buttons("91", "pick", buttons);
        let OutboundBody::Buttons { buttons, .. } = &msg.body else {
            panic!("constructor builds a button body");
        };
        assert_eq!(buttons.len(), MAX_BUTTONS);

        let rows = (0..15).map(|i| ListRow::new(format!("r{i}"), "Row", None)).collect();
        let list = OutboundMessage::list("91", "pick", "Open", "Rows", rows);
        assert!(list.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_text_and_recipient() {
        assert!(OutboundMessage::text("91", "  ").validate().is_err());
        assert!(OutboundMessage::text("", "hi").validate().is_err());
        assert!(OutboundMessage::text("91", "hi").validate().is_ok());
    }

    #[test]
    fn transient_errors_are_throttles_and_outages() {
        let throttled = MessengerError::Rejected { status: 429, body: String::new() };
        let bad = MessengerError::Rejected { status: 400, body: String::new() };
        assert!(throttled.is_transient());
        assert!(!bad.is_transient());
        assert!(MessengerError::Transport("reset".into()).is_transient());
    }
}
