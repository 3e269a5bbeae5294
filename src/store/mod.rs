//! Persistence layer: libSQL-backed storage for users, profiles, sessions and messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Direction, SessionRecord, StoredMessage, UserRecord};
