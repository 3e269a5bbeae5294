//! Structured interaction log.
//!
//! Every routing decision, handoff and session transition is emitted as a
//! `tracing` event under the [`TARGET`] target with flat, queryable fields.
//! Filter with `RUST_LOG=coach::interaction=info` to get just this stream.

use std::fmt;

use uuid::Uuid;

use crate::handler::HandlerName;

pub const TARGET: &str = "coach::interaction";

/// Characters kept from message bodies in log previews.
const PREVIEW_CHARS: usize = 100;

fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// One completed turn.
#[derive(Debug, Clone)]
pub struct Interaction<'a> {
    pub user_id: &'a str,
    pub input_type: &'a str,
    pub content: &'a str,
    pub has_image: bool,
    pub handler: HandlerName,
    pub intent: &'a str,
    pub confidence: f64,
    pub source: &'a str,
    pub response: &'a str,
    pub latency_ms: u64,
    pub session_id: Option<Uuid>,
    pub success: bool,
}

impl Interaction<'_> {
    /// Anything other than a model classification counts as a fallback.
    fn fallback_used(&self) -> bool {
        !matches!(self.source, "model" | "rule" | "vision")
    }
}

pub fn interaction(record: &Interaction<'_>) {
    let session_id = record.session_id.map(|id| id.to_string());
    tracing::info!(
        target: TARGET,
        event = "interaction",
        user_id = record.user_id,
        input_type = record.input_type,
        content_preview = preview(record.content),
        has_image = record.has_image,
        handler = record.handler.as_str(),
        intent = record.intent,
        confidence = record.confidence,
        source = record.source,
        fallback_used = record.fallback_used(),
        response_preview = preview(record.response),
        latency_ms = record.latency_ms,
        session_id = session_id.as_deref(),
        success = record.success,
        "Interaction"
    );
}

/// A handler asked for another handler to take the next turn.
pub fn handoff(user_id: &str, from: HandlerName, to: HandlerName, reason: &str) {
    tracing::info!(
        target: TARGET,
        event = "handoff",
        user_id,
        from = from.as_str(),
        to = to.as_str(),
        reason,
        "Handler handoff"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new medium-term session row was opened.
    Started,
    /// The user is now locked into consultation.
    AffinitySet,
    /// A consultation lock lapsed on inactivity.
    AffinityExpired,
    /// The user left consultation with an exit phrase.
    ConsultationClosed,
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "session_started",
            Self::AffinitySet => "affinity_set",
            Self::AffinityExpired => "affinity_expired",
            Self::ConsultationClosed => "consultation_closed",
        }
    }
}

pub fn session_event(user_id: &str, kind: SessionEvent, details: &str) {
    tracing::info!(
        target: TARGET,
        event = "session",
        user_id,
        kind = kind.as_str(),
        details,
        "Session event"
    );
}

/// A failed operation that the caller has already degraded around.
pub fn error(operation: &str, user_id: &str, error: &dyn fmt::Display) {
    tracing::error!(
        target: TARGET,
        event = "error",
        operation,
        user_id,
        error = %error,
        "Operation failed"
    );
}

#[cfg(test)]
pub(crate) mod capture {
    //! Records events on [`TARGET`] for assertions.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use serde_json::{Value, json};
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::Context;
    use tracing_subscriber::prelude::*;

    use super::TARGET;

    pub type Captured = Arc<Mutex<Vec<HashMap<String, Value>>>>;

    struct CaptureLayer(Captured);

    impl<S: Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() != TARGET {
                return;
            }
            let mut fields = HashMap::new();
            event.record(&mut FieldVisitor(&mut fields));
            self.0.lock().unwrap().push(fields);
        }
    }

    struct FieldVisitor<'a>(&'a mut HashMap<String, Value>);

    impl Visit for FieldVisitor<'_> {
        fn record_f64(&mut self, field: &Field, value: f64) {
            self.0.insert(field.name().to_string(), json!(value));
        }

        fn record_u64(&mut self, field: &Field, value: u64) {
            self.0.insert(field.name().to_string(), json!(value));
        }

        fn record_i64(&mut self, field: &Field, value: i64) {
            self.0.insert(field.name().to_string(), json!(value));
        }

        fn record_bool(&mut self, field: &Field, value: bool) {
            self.0.insert(field.name().to_string(), json!(value));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), json!(value));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), json!(format!("{value:?}")));
        }
    }

    /// Install a thread-local capturing subscriber until the guard drops.
    pub fn install() -> (Captured, tracing::subscriber::DefaultGuard) {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(CaptureLayer(captured.clone()));
        let guard = tracing::subscriber::set_default(subscriber);
        (captured, guard)
    }

    /// Events whose `event` field equals `name`.
    pub fn events(captured: &Captured, name: &str) -> Vec<HashMap<String, Value>> {
        captured
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.get("event").and_then(Value::as_str) == Some(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(source: &'a str, response: &'a str) -> Interaction<'a> {
        Interaction {
            user_id: "u1",
            input_type: "text",
            content: "quero treinar",
            has_image: false,
            handler: HandlerName::Consultation,
            intent: "consultation",
            confidence: 0.92,
            source,
            response,
            latency_ms: 12,
            session_id: None,
            success: true,
        }
    }

    #[test]
    fn interaction_fields_are_flat() {
        let (captured, _guard) = capture::install();
        interaction(&record("model", "Vamos montar seu treino."));

        let events = capture::events(&captured, "interaction");
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["user_id"], "u1");
        assert_eq!(e["handler"], "consultation");
        assert_eq!(e["intent"], "consultation");
        assert_eq!(e["confidence"], 0.92);
        assert_eq!(e["latency_ms"], 12);
        assert_eq!(e["fallback_used"], false);
        assert_eq!(e["success"], true);
    }

    #[test]
    fn keyword_source_is_a_fallback() {
        let (captured, _guard) = capture::install();
        interaction(&record("keyword", "ok"));
        assert_eq!(capture::events(&captured, "interaction")[0]["fallback_used"], true);
    }

    #[test]
    fn previews_cut_on_char_boundaries() {
        let long = "ã".repeat(150);
        let (captured, _guard) = capture::install();
        interaction(&record("model", &long));
        let response = capture::events(&captured, "interaction")[0]["response_preview"].clone();
        assert_eq!(response.as_str().unwrap().chars().count(), PREVIEW_CHARS);
    }

    #[test]
    fn handoff_and_session_events() {
        let (captured, _guard) = capture::install();
        handoff("u1", HandlerName::Onboarding, HandlerName::Consultation, "Objetivo de ganho de massa");
        session_event("u1", SessionEvent::AffinityExpired, "inactive for 3600s");
        error("dispatch", "u1", &"db down");

        let h = &capture::events(&captured, "handoff")[0];
        assert_eq!(h["from"], "onboarding");
        assert_eq!(h["to"], "consultation");

        let s = &capture::events(&captured, "session")[0];
        assert_eq!(s["kind"], "affinity_expired");

        let err = &capture::events(&captured, "error")[0];
        assert_eq!(err["operation"], "dispatch");
        assert_eq!(err["error"], "db down");
    }
}
