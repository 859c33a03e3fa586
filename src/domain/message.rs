//! Canonical inbound message produced by the normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::GeoPoint;

/// Shape of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Free text.
    Text,
    /// Quick-reply button tap.
    Button,
    /// Row picked from a list message.
    List,
    /// Shared location pin.
    Location,
    /// Image, document, audio, video or sticker.
    Media,
    /// Anything the normalizer does not understand.
    Unknown,
}

impl MessageKind {
    /// `true` for button and list replies.
    #[must_use]
    pub const fn is_interactive(self) -> bool {
        matches!(self, Self::Button | Self::List)
    }
}

/// Reference to provider-hosted media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Provider media id.
    pub id: String,
    /// Media category (`image`, `document`, ...).
    pub media_type: String,
    /// MIME type when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Caption typed alongside the media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// One inbound chat message in provider-independent form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Provider message id; the deduplication key.
    pub message_id: String,
    /// Sender phone number.
    pub from: String,
    /// Sender profile name when the provider includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// Message shape.
    pub kind: MessageKind,
    /// Text body, button title, or caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Selected option id for interactive replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_id: Option<String>,
    /// Title of the tapped button or row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_title: Option<String>,
    /// Attached media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    /// Shared coordinates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    /// Provider timestamp.
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Creates a plain text message (handy for tests and replays).
    #[must_use]
    pub fn text(message_id: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            from: from.into(),
            contact_name: None,
            kind: MessageKind::Text,
            text: Some(body.into()),
            selection_id: None,
            selection_title: None,
            media: None,
            location: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a button reply.
    #[must_use]
    pub fn button(message_id: impl Into<String>, from: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Button,
            text: None,
            selection_id: Some(id.into()),
            ..Self::text(message_id, from, "")
        }
    }

    /// Creates a list reply.
    #[must_use]
    pub fn list(message_id: impl Into<String>, from: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::List,
            ..Self::button(message_id, from, id)
        }
    }

    /// Creates a location share.
    #[must_use]
    pub fn location(message_id: impl Into<String>, from: impl Into<String>, at: GeoPoint) -> Self {
        Self {
            kind: MessageKind::Location,
            text: None,
            location: Some(at),
            ..Self::text(message_id, from, "")
        }
    }

    /// Creates a media message.
    #[must_use]
    pub fn media(message_id: impl Into<String>, from: impl Into<String>, media: MediaRef) -> Self {
        Self {
            kind: MessageKind::Media,
            text: media.caption.clone(),
            media: Some(media),
            ..Self::text(message_id, from, "")
        }
    }

    /// Trimmed, non-empty text body.
    #[must_use]
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// The selection id for interactive replies, or the trimmed text
    /// otherwise. Lets steps accept either a tap or a typed answer.
    #[must_use]
    pub fn choice(&self) -> Option<&str> {
        self.selection_id.as_deref().or_else(|| self.trimmed_text())
    }
}

/// Provider-reported state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Accepted by the provider.
    Sent,
    /// Reached the recipient's device.
    Delivered,
    /// Opened by the recipient.
    Read,
    /// Could not be delivered.
    Failed,
}

impl ReceiptStatus {
    /// Parses the provider's status string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A delivery/read/failure receipt for a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider id of the outbound message.
    pub provider_message_id: String,
    /// Recipient phone.
    pub recipient: String,
    /// Reported state.
    pub status: ReceiptStatus,
    /// Provider timestamp.
    pub timestamp: DateTime<Utc>,
    /// Provider error title for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
