//! Onboarding: a deterministic, resumable profile-collection conversation.
//!
//! The handler walks the user through six fields, one question per turn.
//! The current step is derived from the stored profile on every turn, so
//! there is no onboarding state to persist or lose. The same handler also
//! serves out-of-flow profile updates ("atualizar peso para 82 kg").

pub mod extract;
pub mod prompts;
pub mod state;

use crate::error::CoreError;
use crate::handler::{HandlerInput, HandlerName, HandlerOutput, Handoff, UpdateIntent};
use crate::intent::keywords::has_update_verb;
use crate::memory::{HandlerType, HandlerView, LayeredMemory};
use crate::profile::{FieldValue, Goal, Profile, ProfileField};

pub use extract::FieldExtractor;
pub use state::{Action, Event, OnboardingStep, Transition, next_step, transition};

/// Runs one onboarding turn against the user's stored profile.
pub struct OnboardingHandler {
    memory: LayeredMemory,
    extractor: FieldExtractor,
}

impl OnboardingHandler {
    pub fn new(memory: LayeredMemory, extractor: FieldExtractor) -> Self {
        Self { memory, extractor }
    }

    pub async fn handle(&self, input: HandlerInput) -> Result<HandlerOutput, CoreError> {
        let HandlerView::Onboarding {
            profile,
            onboarding_status,
        } = input.context.for_handler(HandlerType::Onboarding)
        else {
            return Err(CoreError::Handler {
                handler: HandlerName::Onboarding.to_string(),
                reason: "unexpected memory view".into(),
            });
        };

        if let Some(intent) = input.update_intent {
            return Ok(self.update(&input.user_id, &input.content, intent, profile).await);
        }

        let step = next_step(profile);
        let (event, value) = self.read_answer(step, &input).await;
        let t = transition(step, event);
        tracing::debug!(
            user_id = %input.user_id,
            step = %step,
            ?event,
            action = ?t.action,
            missing = onboarding_status.missing.len(),
            "Onboarding transition"
        );

        let output = match (t.action, value) {
            (Action::Complete, _) => {
                self.complete(&input.user_id, profile, onboarding_status.completed)
                    .await
            }
            (Action::Welcome, _) => HandlerOutput {
                next_step: Some(OnboardingStep::Age),
                ..HandlerOutput::text(prompts::FIRST_WELCOME)
            },
            (Action::WelcomeBack, _) => {
                let next = state::resolve_next(step, t.next, profile);
                HandlerOutput {
                    next_step: Some(next),
                    ..HandlerOutput::text(prompts::welcome_back(profile, next))
                }
            }
            (Action::Accept, Some(value)) => {
                self.accept(&input.user_id, step, t, profile.clone(), value)
                    .await
            }
            (Action::Accept | Action::Reprompt, _) => {
                let field = step.field().unwrap_or(ProfileField::Age);
                HandlerOutput {
                    next_step: Some(step),
                    ..HandlerOutput::text(prompts::reprompt(field))
                }
            }
        };
        Ok(output)
    }

    /// Classify the user's answer for this step.
    async fn read_answer(&self, step: OnboardingStep, input: &HandlerInput) -> (Event, Option<FieldValue>) {
        match step {
            OnboardingStep::Completion => (Event::Captured, None),
            OnboardingStep::Welcome if input.force_welcome => (Event::Greet, None),
            OnboardingStep::Welcome => match extract::parse_age(&input.content) {
                Some(age) => (Event::Captured, Some(FieldValue::Age(age))),
                None => (Event::Greet, None),
            },
            _ if input.force_welcome => (Event::Resume, None),
            _ => {
                let Some(field) = step.field() else {
                    return (Event::Rejected, None);
                };
                match self.extractor.extract(field, &input.content).await {
                    Some(value) => (Event::Captured, Some(value)),
                    None => (Event::Rejected, None),
                }
            }
        }
    }

    async fn accept(
        &self,
        user_id: &str,
        step: OnboardingStep,
        t: Transition,
        mut profile: Profile,
        value: FieldValue,
    ) -> HandlerOutput {
        let confirmation = prompts::confirmation(&value);
        let delta = value.into_delta();
        self.memory.update_profile(user_id, &delta).await;
        profile.apply(&delta);

        let next = state::resolve_next(step, t.next, &profile);
        tracing::info!(user_id, field = ?delta.fields(), next = %next, "Onboarding field captured");

        let mut output = if next.is_terminal() {
            self.complete(user_id, &profile, false).await
        } else {
            HandlerOutput {
                next_step: Some(next),
                ..HandlerOutput::text(format!("{confirmation}\n\n{}", prompts::step_question(next)))
            }
        };
        output.profile_delta = Some(delta);
        output
    }

    async fn complete(&self, user_id: &str, profile: &Profile, already_completed: bool) -> HandlerOutput {
        let changed = !already_completed && self.memory.mark_onboarding_completed(user_id).await;
        let text = if changed {
            tracing::info!(user_id, "Onboarding completed");
            prompts::completion(profile)
        } else {
            prompts::ALREADY_COMPLETE.to_string()
        };
        HandlerOutput {
            next_step: Some(OnboardingStep::Completion),
            completed: true,
            ..HandlerOutput::text(text)
        }
        .with_handoff(Handoff::new(HandlerName::Consultation, handoff_reason(profile.goal)))
    }

    /// Out-of-flow update of a single field, or the profile view.
    async fn update(&self, user_id: &str, content: &str, intent: UpdateIntent, profile: &Profile) -> HandlerOutput {
        let field = match intent {
            UpdateIntent::ShowProfile => return HandlerOutput::text(prompts::profile_view(profile)),
            UpdateIntent::Field(field) => field,
        };

        // "atualizar restrições" is a request, not the new restriction text.
        if field == ProfileField::Restrictions && has_update_verb(content) {
            return HandlerOutput::text(prompts::update_ask(field));
        }

        match self.extractor.extract(field, content).await {
            Some(value) => {
                let reply = prompts::updated(&value);
                let delta = value.into_delta();
                self.memory.update_profile(user_id, &delta).await;
                tracing::info!(user_id, %field, "Profile field updated");
                HandlerOutput {
                    profile_delta: Some(delta),
                    ..HandlerOutput::text(reply)
                }
            }
            None => HandlerOutput::text(prompts::update_ask(field)),
        }
    }
}

fn handoff_reason(goal: Option<Goal>) -> &'static str {
    match goal {
        Some(Goal::LoseWeight) => "Objetivo de perda de peso",
        Some(Goal::GainMuscle) => "Objetivo de ganho de massa",
        _ => "Iniciar com orientação geral",
    }
}
