//! Graph API client for the provider's Cloud messaging endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Messenger, MessengerError, OutboundBody, OutboundMessage, SentMessage};

/// Sends messages through `POST {api_base}/{phone_number_id}/messages`.
#[derive(Debug, Clone)]
pub struct CloudApiMessenger {
    http: reqwest::Client,
    access_token: String,
    messages_url: String,
}

impl CloudApiMessenger {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::Invalid`] if the token or phone number id
    /// is blank, or [`MessengerError::Transport`] if the HTTP client cannot
    /// be built.
    pub fn new(
        api_base: &str,
        access_token: &str,
        phone_number_id: &str,
    ) -> Result<Self, MessengerError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(MessengerError::Invalid("access token is required".to_string()));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(MessengerError::Invalid("phone number id is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MessengerError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            messages_url: format!(
                "{}/{phone_number_id}/messages",
                api_base.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl Messenger for CloudApiMessenger {
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, MessengerError> {
        message.validate()?;
        let payload = payload(message);

        let response = self
            .http
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MessengerError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MessengerError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(MessengerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let provider_message_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/messages/0/id").and_then(Value::as_str).map(str::to_string));
        tracing::debug!(to = %message.to, ?provider_message_id, "message accepted by provider");
        Ok(SentMessage { provider_message_id })
    }
}

fn set(target: &mut Value, key: &str, value: Value) {
    if let Some(object) = target.as_object_mut() {
        object.insert(key.to_string(), value);
    }
}

/// Builds the provider request body for `message`.
#[must_use]
pub fn payload(message: &OutboundMessage) -> Value {
    let mut body = match &message.body {
        OutboundBody::Text { body } => json!({
            "type": "text",
            "text": { "preview_url": false, "body": body },
        }),
        OutboundBody::Buttons { header, body, buttons } => {
            let mut interactive = json!({
                "type": "button",
                "body": { "text": body },
                "action": {
                    "buttons": buttons.iter().map(|b| json!({
                        "type": "reply",
                        "reply": { "id": b.id, "title": b.title },
                    })).collect::<Vec<_>>(),
                },
            });
            if let Some(header) = header {
                set(&mut interactive, "header", json!({ "type": "text", "text": header }));
            }
            json!({ "type": "interactive", "interactive": interactive })
        }
        OutboundBody::List { body, button_label, sections } => json!({
            "type": "interactive",
            "interactive": {
                "type": "list",
                "body": { "text": body },
                "action": {
                    "button": button_label,
                    "sections": sections.iter().map(|s| json!({
                        "title": s.title,
                        "rows": s.rows.iter().map(|r| {
                            let mut row = json!({ "id": r.id, "title": r.title });
                            if let Some(d) = &r.description {
                                set(&mut row, "description", json!(d));
                            }
                            row
                        }).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                },
            },
        }),
        OutboundBody::Location { at, name } => {
            let mut location = json!({ "latitude": at.lat, "longitude": at.lon });
            if let Some(name) = name {
                set(&mut location, "name", json!(name));
            }
            json!({ "type": "location", "location": location })
        }
        OutboundBody::Media { kind, media_id, caption } => {
            let mut media = json!({ "id": media_id });
            if let Some(caption) = caption {
                set(&mut media, "caption", json!(caption));
            }
            let mut out = json!({ "type": kind.as_str() });
            set(&mut out, kind.as_str(), media);
            out
        }
        OutboundBody::LocationRequest { body } => json!({
            "type": "interactive",
            "interactive": {
                "type": "location_request_message",
                "body": { "text": body },
                "action": { "name": "send_location" },
            },
        }),
    };
    set(&mut body, "messaging_product", json!("whatsapp"));
    set(&mut body, "recipient_type", json!("individual"));
    set(&mut body, "to", json!(message.to));
    body
}
