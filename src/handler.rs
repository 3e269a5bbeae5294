//! Types shared by every conversational handler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::llm::ImageInput;
use crate::memory::MemoryContext;
use crate::onboarding::OnboardingStep;
use crate::profile::{ProfileDelta, ProfileField};

/// Name of the handler that produced (or owns) a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerName {
    Registration,
    Onboarding,
    ProfileUpdate,
    Consultation,
    Greeting,
    Support,
    Clarification,
    ImageRouter,
    Error,
}

impl HandlerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Onboarding => "onboarding",
            Self::ProfileUpdate => "profile_update",
            Self::Consultation => "consultation",
            Self::Greeting => "greeting",
            Self::Support => "support",
            Self::Clarification => "clarification",
            Self::ImageRouter => "image_router",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration" => Ok(Self::Registration),
            "onboarding" | "onboarding_agent" => Ok(Self::Onboarding),
            "profile_update" => Ok(Self::ProfileUpdate),
            "consultation" | "super_personal_trainer" | "super_personal_trainer_agent" => {
                Ok(Self::Consultation)
            }
            "greeting" => Ok(Self::Greeting),
            "support" => Ok(Self::Support),
            "clarification" => Ok(Self::Clarification),
            "image_router" => Ok(Self::ImageRouter),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown handler: {other}")),
        }
    }
}

/// Suggestion that another handler should take the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub handler: HandlerName,
    pub reason: String,
}

impl Handoff {
    pub fn new(handler: HandlerName, reason: impl Into<String>) -> Self {
        Self {
            handler,
            reason: reason.into(),
        }
    }
}

/// What the user asked to change outside the linear onboarding walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateIntent {
    Field(ProfileField),
    ShowProfile,
}

/// Structured output of a secondary image extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisContext {
    /// Category key, e.g. `food`.
    pub category: String,
    pub analysis_type: String,
    pub response_style: String,
    pub focus_areas: Vec<String>,
    pub extraction: serde_json::Value,
}

/// Everything a handler gets for one turn.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub user_id: String,
    pub content: String,
    pub context: MemoryContext,
    pub force_welcome: bool,
    pub update_intent: Option<UpdateIntent>,
    pub image: Option<ImageInput>,
    pub analysis: Option<AnalysisContext>,
}

impl HandlerInput {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>, context: MemoryContext) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            context,
            force_welcome: false,
            update_intent: None,
            image: None,
            analysis: None,
        }
    }

    pub fn with_force_welcome(mut self) -> Self {
        self.force_welcome = true;
        self
    }

    pub fn with_update_intent(mut self, intent: UpdateIntent) -> Self {
        self.update_intent = Some(intent);
        self
    }

    pub fn with_image(mut self, image: ImageInput, analysis: AnalysisContext) -> Self {
        self.image = Some(image);
        self.analysis = Some(analysis);
        self
    }
}

/// A handler's reply plus the side effects it reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub response_text: String,
    /// Onboarding step the user is now on, when onboarding handled the turn.
    pub next_step: Option<OnboardingStep>,
    /// Profile fields written this turn.
    pub profile_delta: Option<ProfileDelta>,
    pub completed: bool,
    pub handoff: Option<Handoff>,
}

impl HandlerOutput {
    pub fn text(response_text: impl Into<String>) -> Self {
        Self {
            response_text: response_text.into(),
            ..Default::default()
        }
    }

    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoff = Some(handoff);
        self
    }
}
