//! Test harness wiring the router to in-memory stores and a recording
//! messenger.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{FlowDeps, FlowRouter, FlowSettings, RouteOutcome};
use crate::dispatch::{JobQueue, MemoryJobQueue, Outbound, OutboundLimits};
use crate::domain::{GeoPoint, IncomingMessage, MediaRef, Session};
use crate::messaging::{Messenger, OutboundBody, OutboundMessage, RecordingMessenger};
use crate::persistence::Stores;
use crate::persistence::memory::MemoryStore;

pub(crate) struct Harness {
    pub router: FlowRouter,
    pub deps: FlowDeps,
    pub messenger: Arc<RecordingMessenger>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    counter: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(FlowSettings::default())
    }

    pub fn with_settings(settings: FlowSettings) -> Self {
        let messenger = Arc::new(RecordingMessenger::new());
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let stores = Stores::memory(&store);
        let outbound = Arc::new(Outbound::new(
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Arc::new(OutboundLimits::new(1_000, 1_000, 1_000)),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&stores.alerts),
        ));
        let deps = FlowDeps {
            stores,
            outbound,
            queue: Arc::clone(&queue) as Arc<dyn JobQueue>,
            settings,
        };
        Self {
            router: FlowRouter::new(&deps),
            deps,
            messenger,
            store,
            queue,
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        format!("wamid.test.{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn send(&self, session: &mut Session, message: IncomingMessage) -> RouteOutcome {
        self.router.route(&message, session).await
    }

    pub async fn say(&self, session: &mut Session, text: &str) -> RouteOutcome {
        let msg = IncomingMessage::text(self.next_id(), session.phone.clone(), text);
        self.send(session, msg).await
    }

    pub async fn tap(&self, session: &mut Session, id: &str) -> RouteOutcome {
        let msg = IncomingMessage::button(self.next_id(), session.phone.clone(), id);
        self.send(session, msg).await
    }

    pub async fn share_location(&self, session: &mut Session, at: GeoPoint) -> RouteOutcome {
        let msg = IncomingMessage::location(self.next_id(), session.phone.clone(), at);
        self.send(session, msg).await
    }

    pub async fn send_photo(&self, session: &mut Session) -> RouteOutcome {
        let media = MediaRef {
            id: "media-photo-1".to_string(),
            media_type: "image".to_string(),
            mime_type: Some("image/jpeg".to_string()),
            caption: None,
        };
        let msg = IncomingMessage::media(self.next_id(), session.phone.clone(), media);
        self.send(session, msg).await
    }

    pub fn last_to(&self, phone: &str) -> Option<OutboundMessage> {
        self.messenger.sent_to(phone).pop()
    }

    /// Text of the last message to `phone`, whatever its shape.
    pub fn last_text(&self, phone: &str) -> String {
        self.last_to(phone).map(|m| body_text(&m.body)).unwrap_or_default()
    }
}

pub(crate) fn body_text(body: &OutboundBody) -> String {
    match body {
        OutboundBody::Text { body }
        | OutboundBody::Buttons { body, .. }
        | OutboundBody::List { body, .. }
        | OutboundBody::LocationRequest { body } => body.clone(),
        OutboundBody::Location { name, .. } => name.clone().unwrap_or_default(),
        OutboundBody::Media { caption, .. } => caption.clone().unwrap_or_default(),
    }
}

pub(crate) fn point(lat: f64, lon: f64) -> GeoPoint {
    GeoPoint::new(lat, lon).unwrap_or(GeoPoint { lat: 0.0, lon: 0.0 })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::FlowKind;

    enum Stray {
        Garbage,
        Location,
        Photo,
        UnknownButton,
        UnknownRow,
    }

    const STRAYS: [Stray; 5] = [
        Stray::Garbage,
        Stray::Location,
        Stray::Photo,
        Stray::UnknownButton,
        Stray::UnknownRow,
    ];

    async fn feed(h: &Harness, session: &mut Session, stray: &Stray) {
        match stray {
            Stray::Garbage => {
                let _ = h.say(session, "zzqx ??? 🐟🐟").await;
            }
            Stray::Location => {
                let _ = h.share_location(session, point(9.93, 76.26)).await;
            }
            Stray::Photo => {
                let _ = h.send_photo(session).await;
            }
            Stray::UnknownButton => {
                let _ = h.tap(session, "nope:xyz").await;
            }
            Stray::UnknownRow => {
                let msg = IncomingMessage::list(h.next_id(), session.phone.clone(), "nope:row");
                let _ = h.send(session, msg).await;
            }
        }
    }

    #[tokio::test]
    async fn every_step_survives_unexpected_input() {
        let h = Harness::new();
        let mut cases = 0usize;
        for flow in FlowKind::ALL {
            let Ok(handler) = h.router.handler(flow) else {
                panic!("no handler for {flow}");
            };
            for &step in handler.steps() {
                for (n, stray) in STRAYS.iter().enumerate() {
                    let mut session = Session::new(format!("91970{cases:05}"));
                    session.enter(flow, step, serde_json::Value::Null);
                    feed(&h, &mut session, stray).await;

                    if let Some(now) = session.step() {
                        let Ok(current) = h.router.handler(session.flow) else {
                            panic!("{flow}/{step} input {n} left unknown flow {}", session.flow);
                        };
                        assert!(
                            current.declares(now),
                            "{flow}/{step} input {n} left undeclared step {}/{now}",
                            session.flow
                        );
                    }
                    cases = cases.saturating_add(1);
                }
            }
        }
        assert!(cases >= FlowKind::ALL.len() * STRAYS.len());
    }
}
