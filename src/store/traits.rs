//! `Database` trait: the single async interface for all persistence.
//!
//! The core treats empty results as "no data yet", never as errors.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::profile::{Profile, ProfileDelta};

/// A registered user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    /// Opaque id supplied by the transport.
    pub id: String,
    /// Channel-specific address (chat id, phone number).
    pub address: String,
    pub active: bool,
    pub onboarding_completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Message direction relative to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted chat message. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub user_id: String,
    pub direction: Direction,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation session: the medium-term memory tier.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub active: bool,
    pub summary: String,
    pub topic: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering users, profiles, sessions and messages.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Register a user. Fails with `Constraint` if the id is taken.
    async fn create_user(&self, id: &str, address: &str) -> Result<UserRecord, DatabaseError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError>;

    async fn set_user_active(&self, id: &str, active: bool) -> Result<(), DatabaseError>;

    /// Flip the onboarding flag. Returns `true` only if it changed.
    async fn mark_onboarding_completed(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, DatabaseError>;

    /// Field-level upsert: creates the row lazily, never clears unset fields.
    async fn upsert_profile(&self, user_id: &str, delta: &ProfileDelta) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    async fn get_active_session(&self, user_id: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Start a session, deactivating any active one for the user.
    async fn start_session(
        &self,
        user_id: &str,
        summary: &str,
        topic: Option<&str>,
    ) -> Result<SessionRecord, DatabaseError>;

    /// Overwrite summary/topic and bump `last_interaction_at`.
    async fn update_session(
        &self,
        session_id: Uuid,
        summary: &str,
        topic: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        user_id: &str,
        direction: Direction,
        body: &str,
    ) -> Result<StoredMessage, DatabaseError>;

    /// Most recent messages first.
    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;
}
