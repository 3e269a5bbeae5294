//! Layered memory: short-term transcript, medium-term session summary and
//! long-term profile, read once before routing and written after the reply.
//!
//! Reads degrade to an empty context and writes are logged and dropped, so a
//! store outage never fails a turn.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::observe::{self, SessionEvent};
use crate::profile::{Profile, ProfileDelta, ProfileField};
use crate::store::{Database, Direction, StoredMessage};

/// Longest message body kept in the transcript, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Which consumer a context is read for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Router,
    Onboarding,
    Consultation,
}

impl HandlerType {
    /// Keys of the view this handler receives.
    pub fn context_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Router => &["short_term", "medium_term", "long_term"],
            Self::Onboarding => &["profile", "onboarding_status"],
            Self::Consultation => &["profile", "onboarding_completed", "recent_messages", "session_summary"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Messages kept in the short-term tier.
    pub short_term_window: usize,
    /// Inactivity after which a session (and any affinity) lapses.
    pub session_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: 5,
            session_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortTermEntry {
    pub direction: Direction,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<StoredMessage> for ShortTermEntry {
    fn from(msg: StoredMessage) -> Self {
        Self {
            direction: msg.direction,
            content: msg.body,
            timestamp: msg.created_at,
        }
    }
}

/// The active session's rolling state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediumTerm {
    pub session_id: Option<Uuid>,
    pub summary: Option<String>,
    pub topic: Option<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LongTerm {
    pub user_exists: bool,
    pub profile: Profile,
    pub onboarding_completed: bool,
}

/// Snapshot of everything known about a user at the start of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryContext {
    /// Most recent first.
    pub short_term: Vec<ShortTermEntry>,
    pub medium_term: MediumTerm,
    pub long_term: LongTerm,
}

/// Onboarding progress as seen by the onboarding handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnboardingStatus {
    pub completed: bool,
    pub missing: Vec<ProfileField>,
}

/// A context narrowed to what one handler may see.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum HandlerView<'a> {
    Router(&'a MemoryContext),
    Onboarding {
        profile: &'a Profile,
        onboarding_status: OnboardingStatus,
    },
    Consultation {
        profile: &'a Profile,
        onboarding_completed: bool,
        recent_messages: &'a [ShortTermEntry],
        session_summary: Option<&'a str>,
    },
}

impl HandlerView<'_> {
    pub fn handler_type(&self) -> HandlerType {
        match self {
            Self::Router(_) => HandlerType::Router,
            Self::Onboarding { .. } => HandlerType::Onboarding,
            Self::Consultation { .. } => HandlerType::Consultation,
        }
    }

    /// Keys exposed by this view.
    pub fn keys(&self) -> &'static [&'static str] {
        self.handler_type().context_keys()
    }
}

impl MemoryContext {
    /// The degraded "no memory" context.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn profile(&self) -> &Profile {
        &self.long_term.profile
    }

    /// Drop the tiers `handler` may not see. The dispatcher hands each
    /// handler a narrowed copy; [`for_handler`](Self::for_handler) then
    /// shapes what is left.
    pub fn narrow(mut self, handler: HandlerType) -> Self {
        match handler {
            HandlerType::Router => {}
            HandlerType::Onboarding => {
                self.short_term.clear();
                self.medium_term = MediumTerm::default();
            }
            HandlerType::Consultation => {
                self.medium_term = MediumTerm {
                    summary: self.medium_term.summary.take(),
                    ..MediumTerm::default()
                };
            }
        }
        self
    }

    pub fn for_handler(&self, handler: HandlerType) -> HandlerView<'_> {
        match handler {
            HandlerType::Router => HandlerView::Router(self),
            HandlerType::Onboarding => HandlerView::Onboarding {
                profile: &self.long_term.profile,
                onboarding_status: OnboardingStatus {
                    completed: self.long_term.onboarding_completed,
                    missing: ProfileField::ORDER
                        .into_iter()
                        .filter(|f| !self.long_term.profile.has(*f))
                        .collect(),
                },
            },
            HandlerType::Consultation => HandlerView::Consultation {
                profile: &self.long_term.profile,
                onboarding_completed: self.long_term.onboarding_completed,
                recent_messages: &self.short_term,
                session_summary: self.medium_term.summary.as_deref(),
            },
        }
    }
}

/// `true` once `last_interaction` is more than `timeout` in the past.
pub fn is_session_expired(last_interaction: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now.signed_duration_since(last_interaction) > timeout,
        Err(_) => false,
    }
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Facade over the store that every handler reads and writes through.
#[derive(Clone)]
pub struct LayeredMemory {
    db: Arc<dyn Database>,
    config: MemoryConfig,
}

impl LayeredMemory {
    pub fn new(db: Arc<dyn Database>, config: MemoryConfig) -> Self {
        Self { db, config }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Read all tiers. Never fails: a store error yields the empty context.
    pub async fn get_context(&self, user_id: &str, handler: HandlerType) -> MemoryContext {
        match self.load_context(user_id, handler).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Memory read failed, continuing without context");
                MemoryContext::empty()
            }
        }
    }

    async fn load_context(&self, user_id: &str, handler: HandlerType) -> Result<MemoryContext, DatabaseError> {
        let user = self.db.get_user(user_id).await?;
        let profile = self.db.get_profile(user_id).await?.unwrap_or_default();

        // Onboarding never looks at the transcript.
        let short_term = if handler == HandlerType::Onboarding {
            Vec::new()
        } else {
            self.db
                .recent_messages(user_id, self.config.short_term_window)
                .await?
                .into_iter()
                .map(ShortTermEntry::from)
                .collect()
        };

        let medium_term = match self.db.get_active_session(user_id).await? {
            Some(session) => MediumTerm {
                session_id: Some(session.id),
                summary: Some(session.summary).filter(|s| !s.is_empty()),
                topic: session.topic,
                last_interaction: Some(session.last_interaction_at),
            },
            None => MediumTerm::default(),
        };

        let ctx = MemoryContext {
            short_term,
            medium_term,
            long_term: LongTerm {
                user_exists: user.is_some(),
                onboarding_completed: user.as_ref().is_some_and(|u| u.onboarding_completed),
                profile,
            },
        };
        Ok(ctx.narrow(handler))
    }

    /// Append to the transcript, truncating oversized bodies.
    pub async fn append_message(&self, user_id: &str, text: &str, direction: Direction) {
        let body = truncate_chars(text, MAX_MESSAGE_CHARS);
        if body.len() < text.len() {
            tracing::debug!(user_id, "Message truncated to {MAX_MESSAGE_CHARS} chars");
        }
        if let Err(e) = self.db.insert_message(user_id, direction, body).await {
            tracing::warn!(user_id, %direction, error = %e, "Failed to append message");
        }
    }

    /// Overwrite the rolling session summary, opening a new session when
    /// there is none or the current one has lapsed.
    pub async fn update_session_summary(&self, user_id: &str, summary: &str, topic: Option<&str>) {
        if let Err(e) = self.write_session_summary(user_id, summary, topic).await {
            tracing::warn!(user_id, error = %e, "Failed to update session summary");
        }
    }

    async fn write_session_summary(
        &self,
        user_id: &str,
        summary: &str,
        topic: Option<&str>,
    ) -> Result<(), DatabaseError> {
        match self.db.get_active_session(user_id).await? {
            Some(session)
                if !is_session_expired(
                    session.last_interaction_at,
                    Utc::now(),
                    self.config.session_timeout,
                ) =>
            {
                self.db.update_session(session.id, summary, topic).await
            }
            Some(_) => {
                tracing::debug!(user_id, "Session timed out, starting a new one");
                self.open_session(user_id, summary, topic).await
            }
            None => self.open_session(user_id, summary, topic).await,
        }
    }

    async fn open_session(&self, user_id: &str, summary: &str, topic: Option<&str>) -> Result<(), DatabaseError> {
        let session = self.db.start_session(user_id, summary, topic).await?;
        observe::session_event(user_id, SessionEvent::Started, &session.id.to_string());
        Ok(())
    }

    /// Field-level profile upsert.
    pub async fn update_profile(&self, user_id: &str, delta: &ProfileDelta) {
        if let Err(e) = self.db.upsert_profile(user_id, delta).await {
            tracing::warn!(user_id, fields = ?delta.fields(), error = %e, "Failed to update profile");
        }
    }

    /// Idempotent. Returns `true` only on the first call for a user.
    pub async fn mark_onboarding_completed(&self, user_id: &str) -> bool {
        match self.db.mark_onboarding_completed(user_id).await {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to mark onboarding completed");
                false
            }
        }
    }

    pub async fn activate_user(&self, user_id: &str) {
        if let Err(e) = self.db.set_user_active(user_id, true).await {
            tracing::warn!(user_id, error = %e, "Failed to activate user");
        }
    }
}
