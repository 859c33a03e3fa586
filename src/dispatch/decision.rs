//! Inline versus background processing of an inbound message.

use crate::domain::{IncomingMessage, MessageKind, Session};

/// Where a message is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Processed on the webhook task, bounded by the sync budget.
    Inline,
    /// Enqueued as a [`super::Job::ProcessMessage`] for the worker pool.
    Deferred(&'static str),
}

/// Media uploads and steps of complex flows go to the worker pool;
/// everything else is cheap enough to run inline.
#[must_use]
pub fn decide(message: &IncomingMessage, session: &Session) -> Dispatch {
    if message.kind == MessageKind::Media {
        return Dispatch::Deferred("media");
    }
    if session.flow.is_complex() {
        return Dispatch::Deferred("complex_flow");
    }
    Dispatch::Inline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FlowKind, MediaRef};

    #[test]
    fn simple_text_in_menu_runs_inline() {
        let session = Session::new("91");
        let msg = IncomingMessage::text("m1", "91", "hi");
        assert_eq!(decide(&msg, &session), Dispatch::Inline);
    }

    #[test]
    fn media_goes_to_background() {
        let session = Session::new("91");
        let msg = IncomingMessage::media(
            "m1",
            "91",
            MediaRef {
                id: "media-1".into(),
                media_type: "image".into(),
                mime_type: Some("image/jpeg".into()),
                caption: None,
            },
        );
        assert_eq!(decide(&msg, &session), Dispatch::Deferred("media"));
    }

    #[test]
    fn complex_flows_go_to_background() {
        let mut session = Session::new("91");
        session.enter(FlowKind::Agreement, "ask_amount", serde_json::Value::Null);
        let msg = IncomingMessage::text("m1", "91", "500");
        assert_eq!(decide(&msg, &session), Dispatch::Deferred("complex_flow"));
    }
}
