//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::profile::{Profile, ProfileDelta};
use crate::store::migrations;
use crate::store::traits::{Database, Direction, SessionRecord, StoredMessage, UserRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// One open transaction at a time on the shared connection.
    tx_lock: tokio::sync::Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            tx_lock: tokio::sync::Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            tx_lock: tokio::sync::Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps lexical order chronological.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<u32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(i64::from(v)),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

/// Ids are always written by us; a malformed one reads back as nil.
fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const USER_COLUMNS: &str = "id, address, active, onboarding_completed, created_at";

const PROFILE_COLUMNS: &str =
    "age, weight_kg, height_cm, goal, training_level, restrictions, name, updated_at";

const SESSION_COLUMNS: &str =
    "id, user_id, active, summary, topic, started_at, last_interaction_at";

const MESSAGE_COLUMNS: &str = "id, user_id, direction, body, created_at";

fn row_to_user(row: &libsql::Row) -> Result<UserRecord, libsql::Error> {
    let active: i64 = row.get(2)?;
    let onboarded: i64 = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(UserRecord {
        id: row.get(0)?,
        address: row.get(1)?,
        active: active != 0,
        onboarding_completed: onboarded != 0,
        created_at: parse_datetime(&created),
    })
}

/// Map a profile row. Unknown goal/level labels read back as unset.
fn row_to_profile(row: &libsql::Row) -> Result<Profile, libsql::Error> {
    let goal: Option<String> = row.get(3).ok();
    let level: Option<String> = row.get(4).ok();
    let updated: Option<String> = row.get(7).ok();
    Ok(Profile {
        age: row.get::<i64>(0).ok().and_then(|v| u32::try_from(v).ok()),
        weight_kg: row.get::<f64>(1).ok(),
        height_cm: row.get::<i64>(2).ok().and_then(|v| u32::try_from(v).ok()),
        goal: goal.and_then(|g| g.parse().ok()),
        training_level: level.and_then(|l| l.parse().ok()),
        restrictions: row.get(5).ok(),
        name: row.get(6).ok(),
        updated_at: updated.as_deref().map(parse_datetime),
    })
}

fn row_to_session(row: &libsql::Row) -> Result<SessionRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let active: i64 = row.get(2)?;
    let started: String = row.get(5)?;
    let last: String = row.get(6)?;
    Ok(SessionRecord {
        id: parse_uuid(&id),
        user_id: row.get(1)?,
        active: active != 0,
        summary: row.get::<String>(3).unwrap_or_default(),
        topic: row.get(4).ok(),
        started_at: parse_datetime(&started),
        last_interaction_at: parse_datetime(&last),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let id: String = row.get(0)?;
    let direction: String = row.get(2)?;
    let created: String = row.get(4)?;
    Ok(StoredMessage {
        id: parse_uuid(&id),
        user_id: row.get(1)?,
        direction: direction.parse().unwrap_or(Direction::Inbound),
        body: row.get(3)?,
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn create_user(&self, id: &str, address: &str) -> Result<UserRecord, DatabaseError> {
        if self.get_user(id).await?.is_some() {
            return Err(DatabaseError::Constraint(format!("user {id} already exists")));
        }

        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO users (id, address, active, onboarding_completed, created_at)
                 VALUES (?1, ?2, 1, 0, ?3)",
                params![id, address, timestamp(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_user: {e}")))?;

        debug!(user_id = id, "User registered");
        Ok(UserRecord {
            id: id.to_string(),
            address: address.to_string(),
            active: true,
            onboarding_completed: false,
            created_at: now,
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let user = row_to_user(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(user))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user: {e}"))),
        }
    }

    async fn set_user_active(&self, id: &str, active: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users SET active = ?1 WHERE id = ?2",
                params![i64::from(active), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_user_active: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "user".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_onboarding_completed(&self, id: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users SET onboarding_completed = 1
                 WHERE id = ?1 AND onboarding_completed = 0",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_onboarding_completed: {e}")))?;
        Ok(changed > 0)
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let profile = row_to_profile(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(profile))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn upsert_profile(&self, user_id: &str, delta: &ProfileDelta) -> Result<(), DatabaseError> {
        if delta.is_empty() {
            return Ok(());
        }

        self.conn()
            .execute(
                "INSERT INTO profiles (user_id, age, weight_kg, height_cm, goal, training_level,
                    restrictions, name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(user_id) DO UPDATE SET
                    age = COALESCE(excluded.age, profiles.age),
                    weight_kg = COALESCE(excluded.weight_kg, profiles.weight_kg),
                    height_cm = COALESCE(excluded.height_cm, profiles.height_cm),
                    goal = COALESCE(excluded.goal, profiles.goal),
                    training_level = COALESCE(excluded.training_level, profiles.training_level),
                    restrictions = COALESCE(excluded.restrictions, profiles.restrictions),
                    name = COALESCE(excluded.name, profiles.name),
                    updated_at = excluded.updated_at",
                params![
                    user_id,
                    opt_int(delta.age),
                    opt_real(delta.weight_kg),
                    opt_int(delta.height_cm),
                    opt_text(delta.goal.as_ref().map(|g| g.as_str())),
                    opt_text(delta.training_level.as_ref().map(|l| l.as_str())),
                    opt_text(delta.restrictions.as_deref()),
                    opt_text(delta.name.as_deref()),
                    timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_profile: {e}")))?;

        debug!(user_id, fields = ?delta.fields(), "Profile updated");
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn get_active_session(&self, user_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE user_id = ?1 AND active = 1
                     ORDER BY last_interaction_at DESC LIMIT 1"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let session = row_to_session(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_session: {e}"))),
        }
    }

    async fn start_session(
        &self,
        user_id: &str,
        summary: &str,
        topic: Option<&str>,
    ) -> Result<SessionRecord, DatabaseError> {
        let query_err = |e: libsql::Error| DatabaseError::Query(format!("start_session: {e}"));
        let _held = self.tx_lock.lock().await;
        let tx = self.conn().transaction().await.map_err(query_err)?;

        // Dropping `tx` on an early return rolls both statements back.
        tx.execute(
            "UPDATE sessions SET active = 0 WHERE user_id = ?1 AND active = 1",
            params![user_id],
        )
        .await
        .map_err(query_err)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let ts = timestamp(now);
        tx.execute(
            "INSERT INTO sessions (id, user_id, active, summary, topic, started_at, last_interaction_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)",
            params![id.to_string(), user_id, summary, opt_text(topic), ts],
        )
        .await
        .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        debug!(user_id, session_id = %id, "Session started");
        Ok(SessionRecord {
            id,
            user_id: user_id.to_string(),
            active: true,
            summary: summary.to_string(),
            topic: topic.map(String::from),
            started_at: now,
            last_interaction_at: now,
        })
    }

    async fn update_session(
        &self,
        session_id: Uuid,
        summary: &str,
        topic: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET summary = ?1, topic = COALESCE(?2, topic), last_interaction_at = ?3
                 WHERE id = ?4",
                params![summary, opt_text(topic), timestamp(Utc::now()), session_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".to_string(),
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        user_id: &str,
        direction: Direction,
        body: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO messages (id, user_id, direction, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), user_id, direction.as_str(), body, timestamp(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        Ok(StoredMessage {
            id,
            user_id: user_id.to_string(),
            direction,
            body: body.to_string(),
            created_at: now,
        })
    }

    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!("Skipping message row: {e}");
                }
            }
        }
        Ok(messages)
    }
}
