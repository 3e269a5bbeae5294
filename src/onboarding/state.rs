//! Onboarding state machine: which step the user is on and what a turn does.
//!
//! The step is never stored. It is derived from the profile on every turn,
//! so resuming after days away lands on the first missing field.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::profile::{Profile, ProfileField};

/// The steps of the onboarding conversation.
///
/// Progresses linearly: Welcome → Age → Weight → Height → Goal →
/// TrainingLevel → Restrictions → Completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    Welcome,
    Age,
    Weight,
    Height,
    Goal,
    TrainingLevel,
    Restrictions,
    Completion,
}

impl OnboardingStep {
    /// Step that collects `field`.
    pub fn for_field(field: ProfileField) -> Self {
        match field {
            ProfileField::Age => Self::Age,
            ProfileField::Weight => Self::Weight,
            ProfileField::Height => Self::Height,
            ProfileField::Goal => Self::Goal,
            ProfileField::TrainingLevel => Self::TrainingLevel,
            ProfileField::Restrictions => Self::Restrictions,
        }
    }

    /// Field collected in this step, if it is a collection step.
    pub fn field(&self) -> Option<ProfileField> {
        match self {
            Self::Age => Some(ProfileField::Age),
            Self::Weight => Some(ProfileField::Weight),
            Self::Height => Some(ProfileField::Height),
            Self::Goal => Some(ProfileField::Goal),
            Self::TrainingLevel => Some(ProfileField::TrainingLevel),
            Self::Restrictions => Some(ProfileField::Restrictions),
            Self::Welcome | Self::Completion => None,
        }
    }

    /// Next step in the linear progression, if any.
    pub fn next(&self) -> Option<OnboardingStep> {
        use OnboardingStep::*;
        match self {
            Welcome => Some(Age),
            Age => Some(Weight),
            Weight => Some(Height),
            Height => Some(Goal),
            Goal => Some(TrainingLevel),
            TrainingLevel => Some(Restrictions),
            Restrictions => Some(Completion),
            Completion => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Age => "age",
            Self::Weight => "weight",
            Self::Height => "height",
            Self::Goal => "goal",
            Self::TrainingLevel => "training_level",
            Self::Restrictions => "restrictions",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step for the first missing field, or `Completion` when none is missing.
pub fn first_missing_step(profile: &Profile) -> OnboardingStep {
    profile
        .first_missing()
        .map(OnboardingStep::for_field)
        .unwrap_or(OnboardingStep::Completion)
}

/// Where a user is: `Welcome` for an empty profile, otherwise the first
/// missing field, `Completion` once every field is present.
pub fn next_step(profile: &Profile) -> OnboardingStep {
    if profile.is_empty() {
        OnboardingStep::Welcome
    } else {
        first_missing_step(profile)
    }
}

/// What happened to the user's input this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Conversation (re)opened, e.g. a greeting or contact share.
    Greet,
    /// The step's field parsed and validated.
    Captured,
    /// Input did not yield a valid value.
    Rejected,
    /// Re-entry with some fields already collected.
    Resume,
}

/// Reply the handler produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// First-time welcome asking for the first field.
    Welcome,
    /// Recap of collected fields plus the next question.
    WelcomeBack,
    /// Write the field, confirm it and ask the next one.
    Accept,
    /// Ask again for the same field.
    Reprompt,
    /// Flip the onboarding flag and hand off to consultation.
    Complete,
}

/// Where the user lands after the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Same,
    FirstMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub next: Next,
}

impl Transition {
    const fn new(action: Action, next: Next) -> Self {
        Self { action, next }
    }
}

/// The transition table. Pure; every (step, event) pair has an entry.
pub fn transition(step: OnboardingStep, event: Event) -> Transition {
    match (step, event) {
        (OnboardingStep::Completion, _) => Transition::new(Action::Complete, Next::Same),

        (OnboardingStep::Welcome, Event::Captured) => {
            Transition::new(Action::Accept, Next::FirstMissing)
        }
        (OnboardingStep::Welcome, Event::Resume) => {
            Transition::new(Action::WelcomeBack, Next::FirstMissing)
        }
        (OnboardingStep::Welcome, Event::Greet | Event::Rejected) => {
            Transition::new(Action::Welcome, Next::FirstMissing)
        }

        (_, Event::Captured) => Transition::new(Action::Accept, Next::FirstMissing),
        (_, Event::Rejected) => Transition::new(Action::Reprompt, Next::Same),
        (_, Event::Greet | Event::Resume) => Transition::new(Action::WelcomeBack, Next::FirstMissing),
    }
}

/// Resolve a transition's `next` against the profile after any write.
pub fn resolve_next(current: OnboardingStep, next: Next, profile: &Profile) -> OnboardingStep {
    match next {
        Next::Same => current,
        Next::FirstMissing => first_missing_step(profile),
    }
}
