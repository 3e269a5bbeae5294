//! Dispatch router: one inbound message in, one envelope out.
//!
//! Every turn goes through the same pipeline:
//! 1. serialize on the user's turn gate and record the inbound message
//! 2. images go straight to the [`ImageRouter`]
//! 3. the contact-share sentinel runs the verify-and-welcome branch
//! 4. a live consultation affinity skips classification entirely
//! 5. otherwise classify, apply the confidence and registration gates, and
//!    map the intent to exactly one handler
//! 6. write the session summary and the outbound message

pub mod turns;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::affinity::SessionAffinity;
use crate::config::CoreConfig;
use crate::consultation::ConsultationHandler;
use crate::error::CoreError;
use crate::handler::{HandlerInput, HandlerName, HandlerOutput, Handoff, UpdateIntent};
use crate::image::{ImageRouter, UNSUPPORTED_IMAGE};
use crate::intent::{
    Classification, ClassificationSource, ClassifierContext, Intent, IntentClassifier, detect_field,
    keyword_intent,
};
use crate::llm::{ImageInput, LlmProvider};
use crate::memory::{HandlerType, LayeredMemory, MemoryConfig, MemoryContext, is_session_expired};
use crate::observe::{self, Interaction, SessionEvent};
use crate::onboarding::{FieldExtractor, OnboardingHandler};
use crate::replies;
use crate::store::{Database, Direction};

pub use turns::TurnGate;

/// Text the transports send when a user shares their phone contact.
pub const CONTACT_SENTINEL: &str = "Contato compartilhado - verificar acesso";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
}

/// A normalized inbound message from any transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub user_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub image: Option<ImageInput>,
}

impl Inbound {
    pub fn text(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            content_type: ContentType::Text,
            image: None,
        }
    }

    pub fn image(user_id: impl Into<String>, image: ImageInput, caption: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            content: caption.unwrap_or_default(),
            content_type: ContentType::Image,
            image: Some(image),
        }
    }

    /// Text recorded in the transcript for this message.
    fn transcript_text(&self) -> String {
        match self.content_type {
            ContentType::Text => self.content.clone(),
            ContentType::Image if self.content.trim().is_empty() => "[imagem]".to_string(),
            ContentType::Image => format!("[imagem] {}", self.content),
        }
    }
}

/// The unified reply returned to transports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub response_text: String,
    pub handler: HandlerName,
    pub handoff: Option<Handoff>,
    pub metadata: serde_json::Value,
}

impl Envelope {
    /// The fixed reply for any internal failure.
    pub fn apology() -> Self {
        Self {
            success: false,
            response_text: replies::APOLOGY.to_string(),
            handler: HandlerName::Error,
            handoff: None,
            metadata: json!({}),
        }
    }
}

/// Where a text turn goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A canned reply; no handler call.
    Reply(HandlerName, String),
    Onboarding {
        force_welcome: bool,
        update: Option<UpdateIntent>,
    },
    Consultation,
}

/// Map a classification to a route. Pure; the gates live here.
pub fn route_for(classification: &Classification, ctx: &MemoryContext, content: &str, threshold: f64) -> Route {
    if classification.confidence <= threshold {
        return Route::Reply(HandlerName::Clarification, replies::clarification());
    }

    let intent = match classification.intent {
        Intent::Unknown => keyword_intent(content).unwrap_or(Intent::Unknown),
        intent => intent,
    };

    let long_term = &ctx.long_term;
    if !long_term.user_exists && intent != Intent::Support {
        return Route::Reply(HandlerName::Registration, replies::REGISTRATION.to_string());
    }

    match intent {
        Intent::Registration => Route::Reply(HandlerName::Registration, replies::REGISTRATION.to_string()),
        Intent::Onboarding => Route::Onboarding {
            force_welcome: false,
            update: None,
        },
        Intent::ProfileUpdate => Route::Onboarding {
            force_welcome: false,
            update: Some(detect_field(content).map_or(UpdateIntent::ShowProfile, UpdateIntent::Field)),
        },
        Intent::Consultation if long_term.onboarding_completed => Route::Consultation,
        Intent::Greeting if long_term.onboarding_completed => Route::Reply(
            HandlerName::Greeting,
            replies::greeting(long_term.profile.name.as_deref()),
        ),
        Intent::Consultation | Intent::Greeting => Route::Onboarding {
            force_welcome: true,
            update: None,
        },
        Intent::Support => Route::Reply(HandlerName::Support, replies::support()),
        Intent::Unknown => Route::Reply(HandlerName::Clarification, replies::clarification()),
    }
}

/// Verify-and-welcome branch for a shared contact.
async fn contact_route(memory: &LayeredMemory, user_id: &str, ctx: &MemoryContext) -> Route {
    if !ctx.long_term.user_exists {
        return Route::Reply(HandlerName::Registration, replies::REGISTRATION.to_string());
    }
    memory.activate_user(user_id).await;
    if ctx.long_term.onboarding_completed {
        Route::Reply(HandlerName::Greeting, replies::CONTACT_WELCOME_BACK.to_string())
    } else {
        Route::Onboarding {
            force_welcome: true,
            update: None,
        }
    }
}

/// The top-level router. Cheap to share behind an `Arc`.
pub struct Dispatcher {
    memory: LayeredMemory,
    affinity: Arc<SessionAffinity>,
    classifier: IntentClassifier,
    onboarding: OnboardingHandler,
    consultation: Arc<ConsultationHandler>,
    images: ImageRouter,
    gate: TurnGate,
    confidence_threshold: f64,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        affinity: Arc<SessionAffinity>,
        config: &CoreConfig,
    ) -> Self {
        let memory = LayeredMemory::new(
            db,
            MemoryConfig {
                short_term_window: config.short_term_window,
                session_timeout: config.session_timeout,
            },
        );
        let consultation = Arc::new(ConsultationHandler::new(
            llm.clone(),
            affinity.clone(),
            config.generation_timeout,
        ));
        Self {
            classifier: IntentClassifier::new(llm.clone(), config.classifier_timeout),
            onboarding: OnboardingHandler::new(
                memory.clone(),
                FieldExtractor::new(llm.clone(), config.classifier_timeout),
            ),
            images: ImageRouter::new(
                llm,
                memory.clone(),
                consultation.clone(),
                config.image_confidence_threshold,
                config.generation_timeout,
            ),
            consultation,
            memory,
            affinity,
            gate: TurnGate::new(),
            confidence_threshold: config.confidence_threshold,
        }
    }

    pub fn memory(&self) -> &LayeredMemory {
        &self.memory
    }

    pub fn affinity(&self) -> &Arc<SessionAffinity> {
        &self.affinity
    }

    /// Boundary wrapper: never fails, never leaks error detail.
    pub async fn handle(&self, inbound: Inbound) -> Envelope {
        let user_id = inbound.user_id.clone();
        match self.dispatch(inbound).await {
            Ok(envelope) => envelope,
            Err(e) => {
                observe::error("dispatch", &user_id, &e);
                Envelope::apology()
            }
        }
    }

    pub async fn dispatch(&self, inbound: Inbound) -> Result<Envelope, CoreError> {
        if inbound.user_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("empty user id".into()));
        }
        let user_id = inbound.user_id.clone();
        self.gate.run(&user_id, self.turn(inbound)).await
    }

    // ── Turn pipeline ───────────────────────────────────────────────

    async fn turn(&self, inbound: Inbound) -> Result<Envelope, CoreError> {
        let started = Instant::now();
        let user_id = inbound.user_id.as_str();
        self.memory
            .append_message(user_id, &inbound.transcript_text(), Direction::Inbound)
            .await;

        if inbound.content_type == ContentType::Image {
            return self.image_turn(inbound, started).await;
        }

        let ctx = self.memory.get_context(user_id, HandlerType::Router).await;
        let content = inbound.content.trim();

        let (route, classification) = if content == CONTACT_SENTINEL {
            tracing::info!(user_id, "Contact shared");
            let route = contact_route(&self.memory, user_id, &ctx).await;
            (route, fixed_classification(Intent::Onboarding, "contact shared"))
        } else if self.sticky_consultation(user_id, &ctx).await {
            tracing::info!(user_id, "Sticky consultation, skipping classification");
            (
                Route::Consultation,
                fixed_classification(Intent::Consultation, "active consultation session"),
            )
        } else {
            let active = self.affinity.get_active(user_id).await.map(|e| e.handler);
            let classification = self
                .classifier
                .classify(content, &ClassifierContext::from_memory(&ctx, active))
                .await;
            let route = route_for(&classification, &ctx, content, self.confidence_threshold);
            (route, classification)
        };

        tracing::debug!(
            user_id,
            intent = %classification.intent,
            confidence = classification.confidence,
            route = route_name(&route),
            "Routing turn"
        );

        let session_id = ctx.medium_term.session_id;
        let (handler, output, view) = self.run_route(route, &inbound, ctx).await?;
        let turn = Turn {
            inbound: &inbound,
            classification: &classification,
            session_id,
            started,
        };
        self.finish(turn, handler, output, view).await
    }

    /// Live consultation affinity. A lapsed one is cleared here.
    async fn sticky_consultation(&self, user_id: &str, ctx: &MemoryContext) -> bool {
        let Some(entry) = self.affinity.get_active(user_id).await else {
            return false;
        };
        if entry.handler != HandlerName::Consultation {
            return false;
        }
        let last = ctx.medium_term.last_interaction.unwrap_or(entry.since);
        let timeout = self.memory.config().session_timeout;
        if is_session_expired(last, Utc::now(), timeout) {
            self.affinity.clear(user_id).await;
            observe::session_event(
                user_id,
                SessionEvent::AffinityExpired,
                &format!("idle since {last}, timeout {}s", timeout.as_secs()),
            );
            return false;
        }
        true
    }

    async fn run_route(
        &self,
        route: Route,
        inbound: &Inbound,
        ctx: MemoryContext,
    ) -> Result<(HandlerName, HandlerOutput, HandlerType), CoreError> {
        let user_id = inbound.user_id.as_str();
        match route {
            Route::Reply(handler, text) => Ok((handler, HandlerOutput::text(text), HandlerType::Router)),
            Route::Onboarding { force_welcome, update } => {
                let view = ctx.narrow(HandlerType::Onboarding);
                let mut input = HandlerInput::new(user_id, inbound.content.trim(), view);
                input.force_welcome = force_welcome;
                input.update_intent = update;
                let handler = if update.is_some() {
                    HandlerName::ProfileUpdate
                } else {
                    HandlerName::Onboarding
                };
                let output = self.onboarding.handle(input).await?;
                Ok((handler, output, HandlerType::Onboarding))
            }
            Route::Consultation => {
                let view = ctx.narrow(HandlerType::Consultation);
                let input = HandlerInput::new(user_id, inbound.content.trim(), view);
                let output = self.consultation.handle(input).await?;
                Ok((HandlerName::Consultation, output, HandlerType::Consultation))
            }
        }
    }

    async fn finish(
        &self,
        turn: Turn<'_>,
        handler: HandlerName,
        output: HandlerOutput,
        view: HandlerType,
    ) -> Result<Envelope, CoreError> {
        let user_id = turn.inbound.user_id.as_str();
        let classification = turn.classification;
        let label = classification.intent.as_str();
        self.memory
            .update_session_summary(
                user_id,
                &replies::session_summary(label, &output.response_text),
                Some(label),
            )
            .await;
        self.memory
            .append_message(user_id, &output.response_text, Direction::Outbound)
            .await;

        let elapsed_ms = turn.started.elapsed().as_millis() as u64;
        observe::interaction(&Interaction {
            user_id,
            input_type: "text",
            content: &turn.inbound.content,
            has_image: false,
            handler,
            intent: label,
            confidence: classification.confidence,
            source: classification.source.as_str(),
            response: &output.response_text,
            latency_ms: elapsed_ms,
            session_id: turn.session_id,
            success: true,
        });
        if let Some(handoff) = &output.handoff {
            observe::handoff(user_id, handler, handoff.handler, &handoff.reason);
        }

        let context_used = view.context_keys();
        Ok(Envelope {
            success: true,
            response_text: output.response_text,
            handler,
            handoff: output.handoff,
            metadata: json!({
                "intent": label,
                "confidence": classification.confidence,
                "reasoning": classification.reasoning,
                "source": classification.source,
                "context_used": context_used,
                "next_step": output.next_step,
                "elapsed_ms": elapsed_ms,
            }),
        })
    }

    async fn image_turn(&self, inbound: Inbound, started: Instant) -> Result<Envelope, CoreError> {
        let user_id = inbound.user_id.as_str();
        let mut envelope = match inbound.image {
            Some(image) if !image.is_empty() => self.images.route(user_id, image).await?,
            _ => Envelope {
                success: true,
                response_text: UNSUPPORTED_IMAGE.to_string(),
                handler: HandlerName::ImageRouter,
                handoff: None,
                metadata: json!({"intent": "invalid_image", "reason": "no image data"}),
            },
        };
        self.memory
            .append_message(user_id, &envelope.response_text, Direction::Outbound)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let intent = envelope.metadata["intent"].as_str().unwrap_or("image").to_string();
        let confidence = envelope.metadata["confidence"].as_f64().unwrap_or(0.0);
        observe::interaction(&Interaction {
            user_id,
            input_type: "image",
            content: &inbound.content,
            has_image: true,
            handler: envelope.handler,
            intent: &intent,
            confidence,
            source: "vision",
            response: &envelope.response_text,
            latency_ms: elapsed_ms,
            session_id: None,
            success: envelope.success,
        });
        if let Some(handoff) = &envelope.handoff {
            observe::handoff(user_id, envelope.handler, handoff.handler, &handoff.reason);
        }
        if let Some(meta) = envelope.metadata.as_object_mut() {
            meta.insert("elapsed_ms".into(), json!(elapsed_ms));
        }
        Ok(envelope)
    }
}

/// What `finish` needs from the turn besides the handler output.
struct Turn<'a> {
    inbound: &'a Inbound,
    classification: &'a Classification,
    session_id: Option<uuid::Uuid>,
    started: Instant,
}

fn fixed_classification(intent: Intent, reasoning: &str) -> Classification {
    Classification {
        intent,
        confidence: 1.0,
        reasoning: reasoning.to_string(),
        source: ClassificationSource::Rule,
    }
}

fn route_name(route: &Route) -> &'static str {
    match route {
        Route::Reply(handler, _) => handler.as_str(),
        Route::Onboarding { update: Some(_), .. } => "profile_update",
        Route::Onboarding { .. } => "onboarding",
        Route::Consultation => "consultation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Profile, ProfileField};

    fn classified(intent: Intent, confidence: f64) -> Classification {
        Classification {
            intent,
            confidence,
            reasoning: String::new(),
            source: ClassificationSource::Model,
        }
    }

    fn registered(onboarded: bool) -> MemoryContext {
        let mut ctx = MemoryContext::empty();
        ctx.long_term.user_exists = true;
        ctx.long_term.onboarding_completed = onboarded;
        ctx
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let ctx = registered(true);
        let at = route_for(&classified(Intent::Consultation, 0.3), &ctx, "treino", 0.3);
        assert!(matches!(at, Route::Reply(HandlerName::Clarification, _)));

        let above = route_for(&classified(Intent::Consultation, 0.31), &ctx, "treino", 0.3);
        assert_eq!(above, Route::Consultation);
    }

    #[test]
    fn threshold_edges() {
        let ctx = registered(true);
        let route = |confidence: f64| route_for(&classified(Intent::Consultation, confidence), &ctx, "treino", 0.3);

        assert!(matches!(route(0.3), Route::Reply(HandlerName::Clarification, _)));
        assert!(matches!(route(0.3 - 1e-9), Route::Reply(HandlerName::Clarification, _)));
        assert_eq!(route(0.3 + 1e-9), Route::Consultation);
        assert_eq!(route(0.3 + f64::EPSILON), Route::Consultation);
    }

    #[test]
    fn consultation_requires_onboarding() {
        let route = route_for(&classified(Intent::Consultation, 0.9), &registered(false), "dieta", 0.3);
        assert_eq!(
            route,
            Route::Onboarding {
                force_welcome: true,
                update: None
            }
        );
    }

    #[test]
    fn unregistered_gets_registration_except_support() {
        let ctx = MemoryContext::empty();
        for intent in [Intent::Onboarding, Intent::Consultation, Intent::Greeting, Intent::ProfileUpdate] {
            let route = route_for(&classified(intent, 0.9), &ctx, "oi", 0.3);
            assert!(matches!(route, Route::Reply(HandlerName::Registration, _)), "{intent}");
        }
        let support = route_for(&classified(Intent::Support, 0.9), &ctx, "ajuda", 0.3);
        assert!(matches!(support, Route::Reply(HandlerName::Support, _)));
    }

    #[test]
    fn profile_update_selects_field_or_view() {
        let ctx = registered(true);
        let field = route_for(&classified(Intent::ProfileUpdate, 0.9), &ctx, "atualizar peso", 0.3);
        assert_eq!(
            field,
            Route::Onboarding {
                force_welcome: false,
                update: Some(UpdateIntent::Field(ProfileField::Weight))
            }
        );
        let view = route_for(&classified(Intent::ProfileUpdate, 0.9), &ctx, "ver meus dados", 0.3);
        assert_eq!(
            view,
            Route::Onboarding {
                force_welcome: false,
                update: Some(UpdateIntent::ShowProfile)
            }
        );
    }

    #[test]
    fn greeting_depends_on_onboarding() {
        let mut ctx = registered(true);
        ctx.long_term.profile = Profile {
            name: Some("Ana".into()),
            ..Default::default()
        };
        match route_for(&classified(Intent::Greeting, 0.9), &ctx, "oi", 0.3) {
            Route::Reply(HandlerName::Greeting, text) => assert!(text.contains("Olá, Ana!")),
            other => panic!("unexpected route {other:?}"),
        }
        let pending = route_for(&classified(Intent::Greeting, 0.9), &registered(false), "oi", 0.3);
        assert_eq!(
            pending,
            Route::Onboarding {
                force_welcome: true,
                update: None
            }
        );
    }

    #[test]
    fn unknown_above_threshold_tries_keywords() {
        let ctx = registered(true);
        let route = route_for(&classified(Intent::Unknown, 0.5), &ctx, "quero um plano de treino", 0.3);
        assert_eq!(route, Route::Consultation);
        let route = route_for(&classified(Intent::Unknown, 0.5), &ctx, "hmm", 0.3);
        assert!(matches!(route, Route::Reply(HandlerName::Clarification, _)));
    }

    #[test]
    fn image_transcript_text() {
        let inbound = Inbound::image("u1", ImageInput::from_bytes(vec![1]), None);
        assert_eq!(inbound.transcript_text(), "[imagem]");
        let captioned = Inbound::image("u1", ImageInput::from_bytes(vec![1]), Some("meu almoço".into()));
        assert_eq!(captioned.transcript_text(), "[imagem] meu almoço");
    }

    #[test]
    fn apology_envelope() {
        let e = Envelope::apology();
        assert!(!e.success);
        assert_eq!(e.response_text, "Desculpe, ocorreu um erro ao processar sua mensagem.");
        assert_eq!(e.handler, HandlerName::Error);
    }

    mod events {
        use std::time::Duration;

        use async_trait::async_trait;
        use rust_decimal::Decimal;

        use super::super::*;
        use crate::error::LlmError;
        use crate::llm::{CompletionRequest, CompletionResponse};
        use crate::observe::capture;
        use crate::store::LibSqlBackend;

        struct Offline;

        #[async_trait]
        impl LlmProvider for Offline {
            fn model_name(&self) -> &str {
                "offline"
            }
            fn cost_per_token(&self) -> (Decimal, Decimal) {
                (Decimal::ZERO, Decimal::ZERO)
            }
            async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
                Err(LlmError::RequestFailed {
                    provider: "offline".into(),
                    reason: "no network in tests".into(),
                })
            }
        }

        async fn dispatcher(session_timeout: Duration) -> Dispatcher {
            let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            db.create_user("u1", "+5511999990000").await.unwrap();
            let config = CoreConfig {
                session_timeout,
                ..CoreConfig::default()
            };
            Dispatcher::new(db, Arc::new(Offline), Arc::new(SessionAffinity::new()), &config)
        }

        #[tokio::test]
        async fn every_turn_logs_an_interaction() {
            let d = dispatcher(Duration::from_secs(3600)).await;
            let (captured, _guard) = capture::install();

            let envelope = d.handle(Inbound::text("u1", "hmm")).await;
            assert_eq!(envelope.handler, HandlerName::Clarification);

            let logged = capture::events(&captured, "interaction");
            assert_eq!(logged.len(), 1);
            assert_eq!(logged[0]["user_id"], "u1");
            assert_eq!(logged[0]["handler"], "clarification");
            assert_eq!(logged[0]["source"], "fallback");
            assert_eq!(logged[0]["fallback_used"], true);
            assert!(logged[0].contains_key("latency_ms"));
        }

        #[tokio::test]
        async fn expired_affinity_logs_a_session_event() {
            let d = dispatcher(Duration::ZERO).await;
            d.memory().update_session_summary("u1", "consulta", Some("consultation")).await;
            d.affinity().set_active("u1", HandlerName::Consultation).await;
            tokio::time::sleep(Duration::from_millis(5)).await;

            let (captured, _guard) = capture::install();
            let envelope = d.handle(Inbound::text("u1", "hmm")).await;

            assert_eq!(envelope.handler, HandlerName::Clarification);
            assert!(d.affinity().get_active("u1").await.is_none());
            let sessions = capture::events(&captured, "session");
            assert!(sessions.iter().any(|e| e["kind"] == "affinity_expired"));
        }
    }
}
