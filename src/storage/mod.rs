//! Persistence gateway for rooms, operations, and sessions.
//!
//! The engine and recovery paths talk to durable storage through the narrow
//! [`OperationStore`] trait: append an operation, read operations by version
//! range, read/update room rows, upsert sessions, purge by age. Two backends:
//!
//! - [`MemoryStore`] — process-local maps; tests and ephemeral servers
//! - [`RocksStore`] — RocksDB column families; durable deployment
//!
//! The one invariant a backend must provide: [`append_operation`] is a single
//! atomic unit that inserts the operation row and bumps the room's
//! `current_version`, rejecting a duplicate `(room_id, version)` pair. The
//! engine's dense-version guarantee rests on that.
//!
//! [`append_operation`]: OperationStore::append_operation

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Operation;

/// Durable room row. The engine treats `current_version` here as the
/// authority when bootstrapping in-memory room state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMeta {
    pub id: String,
    pub name: String,
    pub current_version: i64,
    pub is_active: bool,
    /// ms since epoch
    pub created_at: i64,
    /// ms since epoch
    pub last_activity: i64,
    pub max_users: u32,
    pub settings: Value,
}

impl RoomMeta {
    /// Fresh room row at version 0.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let now = crate::protocol::now_ms();
        Self {
            name: id.clone(),
            id,
            current_version: 0,
            is_active: true,
            created_at: now,
            last_activity: now,
            max_users: 50,
            settings: Value::Null,
        }
    }
}

/// Durable session row, primary key `(room_id, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub room_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// ms since epoch
    pub joined_at: i64,
    /// ms since epoch
    pub last_activity: i64,
    pub is_active: bool,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (I/O, corruption, unavailable).
    DatabaseError(String),
    /// Room row not found where one was required.
    RoomNotFound(String),
    /// `(room_id, version)` already persisted — the caller raced itself.
    VersionConflict { room_id: String, version: i64 },
    /// Row (de)serialization failed.
    SerializationError(String),
    DeserializationError(String),
    /// Payload (de)compression failed.
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseError(e) => write!(f, "database error: {e}"),
            Self::RoomNotFound(id) => write!(f, "room not found: {id}"),
            Self::VersionConflict { room_id, version } => {
                write!(f, "version {version} already persisted for room {room_id}")
            }
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

/// Transactional repository the collaboration core persists through.
///
/// Implementations are synchronous; callers hold per-room locks across these
/// calls, so a slow store throttles its room only (locks are per-room).
pub trait OperationStore: Send + Sync {
    /// Read a room row. `Ok(None)` when the room has never existed.
    fn room_meta(&self, room_id: &str) -> Result<Option<RoomMeta>, StoreError>;

    /// Create or replace a room row.
    fn upsert_room(&self, meta: &RoomMeta) -> Result<(), StoreError>;

    /// Atomically insert `op` and advance the room's `current_version` to
    /// `op.version`. Creates the room row if absent. Fails with
    /// [`StoreError::VersionConflict`] if `(room_id, version)` exists.
    fn append_operation(&self, op: &Operation) -> Result<(), StoreError>;

    /// Operations with `version > after_version`, ascending, at most `limit`.
    fn operations_since(
        &self,
        room_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError>;

    /// Create or refresh a session row keyed by `(room_id, user_id)`.
    fn upsert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Active sessions in a room with `last_activity >= cutoff_ms`.
    fn sessions_active_since(
        &self,
        room_id: &str,
        cutoff_ms: i64,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Delete sessions idle since before `cutoff_ms`. Returns rows removed.
    fn purge_sessions_inactive_before(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Delete operations created before `cutoff_ms`. Returns rows removed.
    fn purge_operations_before(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    // Cross-room counters for health endpoints. Observability only, so
    // backends may answer with full scans.

    /// Active sessions across all rooms with `last_activity >= cutoff_ms`.
    fn count_sessions_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Operations across all rooms with `created_at >= cutoff_ms`.
    fn count_operations_created_since(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Active rooms with `last_activity >= cutoff_ms`.
    fn count_rooms_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError>;
}
