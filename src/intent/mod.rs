//! Intent classification: a model call with a deterministic safety net.
//!
//! [`IntentClassifier::classify`] never fails. A provider error or an
//! unparsable reply falls through to the keyword matcher, then to
//! `unknown` with a confidence low enough to force clarification.

pub mod keywords;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::HandlerName;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::memory::{MemoryContext, ShortTermEntry};
use crate::store::Direction;

pub use keywords::{detect_field, is_exit_phrase, keyword_intent};

/// Confidence assigned to a keyword-recovered intent.
pub const KEYWORD_CONFIDENCE: f64 = 0.6;
/// Confidence of the last-resort `unknown`.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

/// Closed set of user intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Registration,
    Onboarding,
    ProfileUpdate,
    Consultation,
    Greeting,
    Support,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Onboarding => "onboarding",
            Self::ProfileUpdate => "profile_update",
            Self::Consultation => "consultation",
            Self::Greeting => "greeting",
            Self::Support => "support",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for Intent {
    type Err = String;

    /// Accepts canonical labels and the Portuguese legacy ones.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "registration" => Ok(Self::Registration),
            "onboarding" => Ok(Self::Onboarding),
            "profile_update" => Ok(Self::ProfileUpdate),
            "consultation" | "super_personal_trainer" => Ok(Self::Consultation),
            "greeting" | "saudacao" | "saudação" => Ok(Self::Greeting),
            "support" | "suporte" => Ok(Self::Support),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Model,
    Keyword,
    Fallback,
    /// Decided by a routing rule; no classification ran.
    Rule,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Keyword => "keyword",
            Self::Fallback => "fallback",
            Self::Rule => "rule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    pub reasoning: String,
    pub source: ClassificationSource,
}

/// Raw model output, parsed or not.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierOutcome {
    Parsed {
        intent: Intent,
        confidence: f64,
        reasoning: String,
    },
    Unparsable(String),
}

#[derive(Deserialize)]
struct RawClassification {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl ClassifierOutcome {
    /// Parse a model reply: strip fences, find the object, normalize labels.
    pub fn parse(raw: &str) -> Self {
        let json = extract_json_object(raw);
        let parsed: RawClassification = match serde_json::from_str(&json) {
            Ok(p) => p,
            Err(_) => return Self::Unparsable(raw.to_string()),
        };
        let Ok(intent) = parsed.intent.parse::<Intent>() else {
            return Self::Unparsable(raw.to_string());
        };
        let confidence = parsed.confidence.unwrap_or(0.5);
        if !confidence.is_finite() {
            return Self::Unparsable(raw.to_string());
        }
        Self::Parsed {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: parsed.reasoning.unwrap_or_default(),
        }
    }
}

/// What the classifier is told about the user.
#[derive(Debug, Clone, Default)]
pub struct ClassifierContext {
    pub user_exists: bool,
    pub onboarding_completed: bool,
    pub profile_summary: String,
    /// Oldest first.
    pub recent_turns: Vec<String>,
    pub last_topic: Option<String>,
    pub active_handler: Option<HandlerName>,
}

impl ClassifierContext {
    pub fn from_memory(ctx: &MemoryContext, active_handler: Option<HandlerName>) -> Self {
        Self {
            user_exists: ctx.long_term.user_exists,
            onboarding_completed: ctx.long_term.onboarding_completed,
            profile_summary: ctx.long_term.profile.summary_lines(),
            recent_turns: ctx.short_term.iter().take(3).rev().map(format_turn).collect(),
            last_topic: ctx.medium_term.topic.clone(),
            active_handler,
        }
    }
}

fn format_turn(entry: &ShortTermEntry) -> String {
    let who = match entry.direction {
        Direction::Inbound => "usuário",
        Direction::Outbound => "assistente",
    };
    format!("{who}: {}", entry.content)
}

const CLASSIFIER_SYSTEM_PROMPT: &str = "Você classifica mensagens de usuários de um coach de fitness e nutrição. \
Responda somente com um objeto JSON.";

/// Build the user prompt for one classification.
pub fn build_prompt(content: &str, ctx: &ClassifierContext) -> String {
    let turns = if ctx.recent_turns.is_empty() {
        "Nenhuma".to_string()
    } else {
        ctx.recent_turns.join(" | ")
    };
    format!(
        "CONTEXTO DO USUÁRIO:\n\
         - Usuário cadastrado: {user_exists}\n\
         - Onboarding completo: {onboarded}\n\
         - Perfil:\n{profile}\n\
         - Últimas mensagens: {turns}\n\
         - Último tópico: {topic}\n\
         - Agente ativo: {active}\n\n\
         MENSAGEM: \"{content}\"\n\n\
         INTENÇÕES POSSÍVEIS:\n\
         - \"registration\": usuário não cadastrado\n\
         - \"onboarding\": usuário precisa completar o perfil\n\
         - \"profile_update\": quer atualizar dados do perfil\n\
         - \"consultation\": quer orientação de treino, dieta, receitas ou análise\n\
         - \"greeting\": cumprimento\n\
         - \"support\": dúvidas ou problemas\n\
         - \"unknown\": não foi possível entender\n\n\
         Responda em JSON: {{\"intent\": \"...\", \"confidence\": 0.0, \"reasoning\": \"...\"}}",
        user_exists = ctx.user_exists,
        onboarded = ctx.onboarding_completed,
        profile = ctx.profile_summary,
        topic = ctx.last_topic.as_deref().unwrap_or("Nenhum"),
        active = ctx.active_handler.map(|h| h.as_str()).unwrap_or("Nenhum"),
    )
}

/// Model-backed classifier with keyword fallback.
pub struct IntentClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn classify(&self, content: &str, ctx: &ClassifierContext) -> Classification {
        let prompt = build_prompt(content, ctx);
        tracing::debug!(prompt_len = prompt.len(), "Classifying intent");

        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(300)
        .with_temperature(0.1)
        .with_timeout(self.timeout);

        let outcome = match self.llm.complete(request).await {
            Ok(response) => ClassifierOutcome::parse(&response.content),
            Err(e) => {
                tracing::warn!(error = %e, "Intent classification call failed");
                ClassifierOutcome::Unparsable(String::new())
            }
        };

        resolve(content, outcome)
    }
}

/// Turn a model outcome into a final classification, applying the fallback chain.
pub fn resolve(content: &str, outcome: ClassifierOutcome) -> Classification {
    match outcome {
        ClassifierOutcome::Parsed {
            intent,
            confidence,
            reasoning,
        } => Classification {
            intent,
            confidence,
            reasoning,
            source: ClassificationSource::Model,
        },
        ClassifierOutcome::Unparsable(raw) => {
            if !raw.is_empty() {
                tracing::debug!(raw = %raw, "Unparsable classifier output");
            }
            match keyword_intent(content) {
                Some(intent) => Classification {
                    intent,
                    confidence: KEYWORD_CONFIDENCE,
                    reasoning: "keyword fallback".to_string(),
                    source: ClassificationSource::Keyword,
                },
                None => Classification {
                    intent: Intent::Unknown,
                    confidence: FALLBACK_CONFIDENCE,
                    reasoning: "classification unavailable".to_string(),
                    source: ClassificationSource::Fallback,
                },
            }
        }
    }
}
