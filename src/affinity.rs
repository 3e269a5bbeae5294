//! Session affinity: which handler currently owns a user's conversation.
//!
//! A plain key/value map with no TTL. Callers decide expiry against the
//! session's last interaction (see [`crate::memory::is_session_expired`]).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::handler::HandlerName;

/// The handler a user is locked into, and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityEntry {
    pub handler: HandlerName,
    pub since: DateTime<Utc>,
}

/// Process-scoped affinity map, shared across all users' turns.
#[derive(Debug, Default)]
pub struct SessionAffinity {
    entries: RwLock<HashMap<String, AffinityEntry>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `user_id` into `handler`, replacing any prior entry.
    pub async fn set_active(&self, user_id: &str, handler: HandlerName) {
        let entry = AffinityEntry {
            handler,
            since: Utc::now(),
        };
        let prior = self.entries.write().await.insert(user_id.to_string(), entry);
        if let Some(prior) = prior
            && prior.handler != handler
        {
            tracing::debug!(user_id, from = %prior.handler, to = %handler, "Affinity replaced");
        }
    }

    pub async fn get_active(&self, user_id: &str) -> Option<AffinityEntry> {
        self.entries.read().await.get(user_id).copied()
    }

    /// Drop the entry. Returns `true` if one existed.
    pub async fn clear(&self, user_id: &str) -> bool {
        self.entries.write().await.remove(user_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
