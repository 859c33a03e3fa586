//! Provider webhook JSON to [`IncomingMessage`] / [`DeliveryReceipt`].
//!
//! Parsing is deliberately lenient: the envelope is walked as loose JSON so
//! one malformed message never hides its siblings, and each message or
//! status is decoded on its own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::{DeliveryReceipt, GeoPoint, IncomingMessage, MediaRef, MessageKind, ReceiptStatus};

/// Media payload keys the provider uses.
const MEDIA_TYPES: &[&str] = &["image", "document", "audio", "video", "sticker"];

/// Why one message or status could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// JSON did not have the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A required field was empty.
    #[error("missing field {0}")]
    Missing(&'static str),

    /// Status string is not one we track.
    #[error("unknown status {0}")]
    UnknownStatus(String),
}

/// One `entry[].changes[].value` with `field == "messages"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Raw message objects.
    pub messages: Vec<Value>,
    /// Raw status objects.
    pub statuses: Vec<Value>,
    /// `wa_id` to profile name.
    pub contacts: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct WireContact {
    #[serde(default)]
    wa_id: String,
    #[serde(default)]
    profile: Option<WireProfile>,
}

#[derive(Debug, Deserialize)]
struct WireProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<WireText>,
    #[serde(default)]
    interactive: Option<WireInteractive>,
    #[serde(default)]
    button: Option<WireButton>,
    #[serde(default)]
    location: Option<WireLocation>,
    #[serde(flatten)]
    rest: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct WireInteractive {
    #[serde(default)]
    button_reply: Option<WireReply>,
    #[serde(default)]
    list_reply: Option<WireReply>,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

/// Template quick-reply buttons.
#[derive(Debug, Deserialize)]
struct WireButton {
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct WireMedia {
    #[serde(default)]
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    recipient_id: String,
    #[serde(default)]
    errors: Vec<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn array(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Extracts every `messages` change from a webhook envelope. Anything that
/// is not an object of the expected shape is skipped.
#[must_use]
pub fn extract_changes(payload: &Value) -> Vec<ChangeBatch> {
    let mut batches = Vec::new();
    for entry in payload.get("entry").and_then(Value::as_array).into_iter().flatten() {
        for change in entry.get("changes").and_then(Value::as_array).into_iter().flatten() {
            let field = change.get("field").and_then(Value::as_str);
            if field.is_some_and(|f| f != "messages") {
                tracing::debug!(field, "ignoring webhook change");
                continue;
            }
            let Some(value) = change.get("value") else {
                continue;
            };
            let contacts = array(value, "contacts")
                .into_iter()
                .filter_map(|c| serde_json::from_value::<WireContact>(c).ok())
                .filter_map(|c| Some((c.wa_id, c.profile?.name?)))
                .collect();
            batches.push(ChangeBatch {
                messages: array(value, "messages"),
                statuses: array(value, "statuses"),
                contacts,
            });
        }
    }
    batches
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Provider message id of a raw message, if it has one.
#[must_use]
pub fn message_id(raw: &Value) -> Option<&str> {
    raw.get("id").and_then(Value::as_str)
}

/// Decodes one raw message.
///
/// Unsupported message types become [`MessageKind::Unknown`] so the
/// active flow can re-prompt; only structural damage is an error.
///
/// # Errors
///
/// Returns [`NormalizeError`] if the object is not a message or lacks its
/// id or sender.
pub fn normalize_message(
    raw: &Value,
    contacts: &HashMap<String, String>,
) -> Result<IncomingMessage, NormalizeError> {
    let wire: WireMessage =
        serde_json::from_value(raw.clone()).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
    if wire.id.is_empty() {
        return Err(NormalizeError::Missing("id"));
    }
    if wire.from.is_empty() {
        return Err(NormalizeError::Missing("from"));
    }

    let mut msg = IncomingMessage::text(wire.id, wire.from, "");
    msg.text = None;
    msg.kind = MessageKind::Unknown;
    msg.timestamp = parse_timestamp(wire.timestamp.as_deref());
    msg.contact_name = contacts.get(&msg.from).cloned();

    match wire.kind.as_str() {
        "text" => {
            msg.kind = MessageKind::Text;
            msg.text = wire.text.map(|t| t.body);
        }
        "interactive" => {
            let interactive = wire.interactive.ok_or(NormalizeError::Missing("interactive"))?;
            let (kind, reply) = match (interactive.button_reply, interactive.list_reply) {
                (Some(reply), _) => (MessageKind::Button, reply),
                (None, Some(reply)) => (MessageKind::List, reply),
                (None, None) => return Ok(msg),
            };
            msg.kind = kind;
            msg.selection_id = Some(reply.id);
            msg.selection_title = reply.title;
        }
        "button" => {
            if let Some(button) = wire.button {
                msg.kind = MessageKind::Button;
                msg.selection_id = button.payload.or_else(|| button.text.clone());
                msg.selection_title = button.text;
            }
        }
        "location" => {
            let location = wire.location.ok_or(NormalizeError::Missing("location"))?;
            match GeoPoint::new(location.latitude, location.longitude) {
                Ok(at) => {
                    msg.kind = MessageKind::Location;
                    msg.location = Some(at);
                }
                Err(e) => {
                    tracing::warn!(message_id = %msg.message_id, error = %e, "discarding invalid shared location");
                }
            }
        }
        media if MEDIA_TYPES.contains(&media) => {
            let payload = wire.rest.get(media).cloned().unwrap_or(Value::Null);
            let wire_media: WireMedia =
                serde_json::from_value(payload).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
            msg.kind = MessageKind::Media;
            msg.text = wire_media.caption.clone();
            msg.media = Some(MediaRef {
                id: wire_media.id,
                media_type: media.to_string(),
                mime_type: wire_media.mime_type,
                caption: wire_media.caption,
            });
        }
        other => {
            tracing::debug!(message_id = %msg.message_id, kind = other, "unsupported message type");
        }
    }
    Ok(msg)
}

/// Decodes one raw status into a receipt.
///
/// # Errors
///
/// Returns [`NormalizeError`] for malformed objects and statuses other
/// than sent, delivered, read or failed.
pub fn normalize_status(raw: &Value) -> Result<DeliveryReceipt, NormalizeError> {
    let wire: WireStatus =
        serde_json::from_value(raw.clone()).map_err(|e| NormalizeError::Malformed(e.to_string()))?;
    if wire.id.is_empty() {
        return Err(NormalizeError::Missing("id"));
    }
    let status = ReceiptStatus::parse(&wire.status).ok_or(NormalizeError::UnknownStatus(wire.status))?;
    let error = wire
        .errors
        .into_iter()
        .next()
        .and_then(|e| e.title.or(e.message));
    Ok(DeliveryReceipt {
        provider_message_id: wire.id,
        recipient: wire.recipient_id,
        status,
        timestamp: parse_timestamp(wire.timestamp.as_deref()),
        error,
    })
}
