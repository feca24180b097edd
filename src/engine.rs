//! The per-room operation-transform engine.
//!
//! One [`RoomHandle`] per active room, created lazily and bootstrapped from
//! the durable room row. The handle's write lock is the room's single
//! serialization point: transform, version assignment, durable append,
//! window update, and spatial-index update all happen inside it, which is
//! what makes versions dense and race-free.
//!
//! ```text
//! Operation (pending, version 0)
//!       │ validate
//!       ▼
//! room write lock ──► fold through concurrent window ops (transform_chain)
//!       │                       │
//!       │                       ▼
//!       │             candidate = current_version + 1
//!       │                       │
//!       │             store.append_operation()   ← the only I/O wait
//!       │                 ok ─┴─ err → counter untouched, candidate reused
//!       ▼
//! window push / user state / spatial index
//!       │
//!       ▼
//! TransformResult (versioned, for broadcast)
//! ```
//!
//! The rooms map itself is only locked for lookup; unrelated rooms never
//! serialize against each other. A slow store throttles its own room only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{now_ms, BoundingBox, OpKind, Operation, Point, TransformResult, ValidationError};
use crate::spatial::{IndexedStroke, SpatialIndex};
use crate::storage::{OperationStore, StoreError};
use crate::transform::{transform_chain, TransformError};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recent operations kept per room as the transformation window
    pub window_size: usize,
    /// Users idle longer than this are excluded from active listings
    pub user_active_window_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            user_active_window_ms: 5 * 60 * 1000,
        }
    }
}

/// Per-user state inside a room.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserState {
    pub user_id: String,
    /// Highest version attributed to this user
    pub last_version: i64,
    pub cursor_position: Option<Point>,
    pub viewport_bounds: Option<BoundingBox>,
    pub is_active: bool,
    /// ms since epoch
    pub last_activity: i64,
}

struct RoomInner {
    current_version: i64,
    /// Bounded transformation window, oldest first
    window: VecDeque<Operation>,
    users: HashMap<String, UserState>,
}

struct RoomHandle {
    room_id: String,
    inner: RwLock<RoomInner>,
}

/// Engine errors. None of these advance the room's version.
#[derive(Debug)]
pub enum EngineError {
    /// Rejected before transformation; never persisted.
    Validation(ValidationError),
    /// Transformation invariant violation; the room stays usable.
    Transform(TransformError),
    /// Durable append failed; caller should retry with backoff.
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "validation failed: {e}"),
            Self::Transform(e) => write!(f, "transformation failed: {e}"),
            Self::Store(e) => write!(f, "persistence failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<TransformError> for EngineError {
    fn from(e: TransformError) -> Self {
        Self::Transform(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Room-scoped OT engine.
pub struct OtEngine {
    store: Arc<dyn OperationStore>,
    spatial: Arc<SpatialIndex>,
    rooms: RwLock<HashMap<String, Arc<RoomHandle>>>,
    config: EngineConfig,
}

impl OtEngine {
    pub fn new(store: Arc<dyn OperationStore>, spatial: Arc<SpatialIndex>) -> Self {
        Self::with_config(store, spatial, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OperationStore>,
        spatial: Arc<SpatialIndex>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            spatial,
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The spatial index this engine maintains.
    pub fn spatial(&self) -> &Arc<SpatialIndex> {
        &self.spatial
    }

    /// Admit one operation: transform against the concurrent window, assign
    /// the next version, persist durably, update room state.
    ///
    /// Duplicate deliveries (same operation id still inside the window) are
    /// acknowledged with the already-admitted operation rather than
    /// re-admitted, so transport-level retries are harmless.
    ///
    /// On any error the room's version counter is untouched; the failed
    /// candidate version is reused by the next attempt, keeping the version
    /// sequence dense.
    pub async fn process_operation(&self, mut op: Operation) -> Result<TransformResult, EngineError> {
        op.validate()?;

        let room = self.room(&op.room_id).await?;
        let mut inner = room.inner.write().await;

        if !op.id.is_nil() {
            if let Some(existing) = inner.window.iter().find(|w| w.id == op.id) {
                return Ok(TransformResult::ok(existing.clone()));
            }
        } else {
            op.id = Uuid::new_v4();
        }
        // Server clock is authoritative: retention purges by created_at, so a
        // client-supplied time could punch a hole in the middle of the
        // version sequence.
        op.created_at = now_ms();

        let client_version = op.client_version();
        let mut transformed = transform_chain(
            op,
            inner.window.iter().filter(|w| w.version > client_version),
        )?;

        let candidate = inner.current_version + 1;
        transformed.version = candidate;
        transformed.applied_at = Some(now_ms());

        if let Err(e) = self.store.append_operation(&transformed) {
            log::warn!(
                "persist failed for room {} at version {candidate}: {e}",
                room.room_id
            );
            return Err(EngineError::Store(e));
        }
        inner.current_version = candidate;

        inner.window.push_back(transformed.clone());
        if inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }

        Self::note_user_activity(&mut inner, &transformed);

        // Still inside the room's critical section: anyone who observes this
        // version broadcast will see its effect in viewport queries.
        self.apply_spatial(&transformed).await;

        Ok(TransformResult::ok(transformed))
    }

    /// Users active in the room within the configured window.
    pub async fn get_room_users(&self, room_id: &str) -> Result<Vec<UserState>, EngineError> {
        let room = self.room(room_id).await?;
        let inner = room.inner.read().await;
        let cutoff = now_ms() - self.config.user_active_window_ms;
        Ok(inner
            .users
            .values()
            .filter(|u| u.is_active && u.last_activity >= cutoff)
            .cloned()
            .collect())
    }

    /// Mark a user inactive (transport calls this on disconnect).
    pub async fn mark_user_inactive(&self, room_id: &str, user_id: &str) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(room_id) {
            let mut inner = room.inner.write().await;
            if let Some(user) = inner.users.get_mut(user_id) {
                user.is_active = false;
            }
        }
    }

    /// The room's current version as the engine sees it.
    pub async fn current_version(&self, room_id: &str) -> Result<i64, EngineError> {
        let room = self.room(room_id).await?;
        let inner = room.inner.read().await;
        Ok(inner.current_version)
    }

    /// Purge durable operations older than `max_age` and trim in-memory
    /// windows to match. Returns the number of durable rows removed.
    pub async fn cleanup_old_operations(&self, max_age: Duration) -> Result<u64, EngineError> {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let removed = self.store.purge_operations_before(cutoff)?;

        let rooms = self.rooms.read().await;
        for room in rooms.values() {
            let mut inner = room.inner.write().await;
            inner.window.retain(|op| op.created_at >= cutoff);
        }
        Ok(removed)
    }

    /// Get or lazily create a room handle, bootstrapping `current_version`
    /// from the durable room row.
    async fn room(&self, room_id: &str) -> Result<Arc<RoomHandle>, EngineError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        // Durable current_version is authoritative for bootstrap; a room the
        // store has never seen starts at 0.
        let bootstrapped = self.store.room_meta(room_id)?.map_or(0, |m| m.current_version);

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        let room = Arc::new(RoomHandle {
            room_id: room_id.to_string(),
            inner: RwLock::new(RoomInner {
                current_version: bootstrapped,
                window: VecDeque::with_capacity(self.config.window_size),
                users: HashMap::new(),
            }),
        });
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    fn note_user_activity(inner: &mut RoomInner, op: &Operation) {
        let user = inner
            .users
            .entry(op.user_id.clone())
            .or_insert_with(|| UserState {
                user_id: op.user_id.clone(),
                last_version: 0,
                cursor_position: None,
                viewport_bounds: None,
                is_active: true,
                last_activity: 0,
            });
        user.last_version = op.version;
        user.last_activity = now_ms();
        user.is_active = true;
        if op.kind == OpKind::CursorMove {
            user.cursor_position = op.cursor_point();
        }
        if let Some(viewport) = op.viewport_bounds() {
            user.viewport_bounds = Some(viewport);
        }
    }

    async fn apply_spatial(&self, op: &Operation) {
        match op.kind {
            OpKind::StrokeCreate | OpKind::StrokeUpdate => {
                // A geometry-free update (color, width) leaves the indexed
                // extent as it was.
                if let (Some(stroke_id), Some(bbox)) = (op.stroke_id(), op.bounding_box()) {
                    self.spatial
                        .upsert(
                            &op.room_id,
                            IndexedStroke {
                                stroke_id: stroke_id.to_string(),
                                user_id: op.user_id.clone(),
                                bbox,
                                version: op.version,
                                created_at: op.created_at,
                            },
                        )
                        .await;
                }
            }
            OpKind::StrokeDelete => {
                if let Some(stroke_id) = op.stroke_id() {
                    self.spatial.remove(&op.room_id, stroke_id).await;
                }
            }
            OpKind::ClearAll => {
                self.spatial.clear_room(&op.room_id).await;
            }
            OpKind::CursorMove | OpKind::Selection | OpKind::Noop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn data(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn engine() -> (Arc<MemoryStore>, OtEngine) {
        let store = Arc::new(MemoryStore::new());
        let spatial = Arc::new(SpatialIndex::default());
        let engine = OtEngine::new(store.clone(), spatial);
        (store, engine)
    }

    fn create_op(room: &str, stroke: &str) -> Operation {
        Operation::new(
            OpKind::StrokeCreate,
            room,
            "alice",
            data(json!({"stroke_id": stroke, "points": [[0.0, 0.0], [10.0, 10.0]]})),
        )
    }

    #[tokio::test]
    async fn test_versions_assigned_densely() {
        let (_store, engine) = engine();
        for i in 1..=5 {
            let result = engine
                .process_operation(create_op("r", &format!("s{i}")))
                .await
                .unwrap();
            assert_eq!(result.operation.version, i);
            assert!(result.operation.applied_at.is_some());
        }
        assert_eq!(engine.current_version("r").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_rooms_version_independently() {
        let (_store, engine) = engine();
        engine.process_operation(create_op("r1", "a")).await.unwrap();
        engine.process_operation(create_op("r1", "b")).await.unwrap();
        let other = engine.process_operation(create_op("r2", "c")).await.unwrap();
        assert_eq!(other.operation.version, 1);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_engine() {
        let (store, engine) = engine();
        let bad = Operation::new(OpKind::StrokeUpdate, "r", "alice", data(json!({})));
        let err = engine.process_operation(bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back_and_retries_same_version() {
        let (store, engine) = engine();
        engine.process_operation(create_op("r", "s1")).await.unwrap();

        store.set_fail_appends(true);
        let err = engine.process_operation(create_op("r", "s2")).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(engine.current_version("r").await.unwrap(), 1);

        // Store recovers: the same candidate version is used, no gap
        store.set_fail_appends(false);
        let result = engine.process_operation(create_op("r", "s2")).await.unwrap();
        assert_eq!(result.operation.version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_acknowledged_not_readmitted() {
        let (store, engine) = engine();
        let op = create_op("r", "s1");
        let first = engine.process_operation(op.clone()).await.unwrap();
        let second = engine.process_operation(op).await.unwrap();

        assert_eq!(second.operation.version, first.operation.version);
        assert_eq!(store.operation_count(), 1);
        assert_eq!(engine.current_version("r").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_bounded() {
        let store = Arc::new(MemoryStore::new());
        let spatial = Arc::new(SpatialIndex::default());
        let engine = OtEngine::with_config(
            store.clone(),
            spatial,
            EngineConfig {
                window_size: 3,
                ..EngineConfig::default()
            },
        );

        for i in 1..=10 {
            engine
                .process_operation(create_op("r", &format!("s{i}")))
                .await
                .unwrap();
        }

        let room = engine.room("r").await.unwrap();
        let inner = room.inner.read().await;
        assert_eq!(inner.window.len(), 3);
        assert_eq!(inner.window.front().unwrap().version, 8);
    }

    #[tokio::test]
    async fn test_bootstrap_from_durable_version() {
        let store = Arc::new(MemoryStore::new());
        // Simulate history persisted by an earlier process
        let mut op = create_op("r", "s1");
        op.version = 41;
        store.append_operation(&op).unwrap();

        let spatial = Arc::new(SpatialIndex::default());
        let engine = OtEngine::new(store, spatial);
        let result = engine.process_operation(create_op("r", "s2")).await.unwrap();
        assert_eq!(result.operation.version, 42);
    }

    #[tokio::test]
    async fn test_concurrent_update_transformed_against_window() {
        let (_store, engine) = engine();
        engine.process_operation(create_op("r", "s1")).await.unwrap();

        let mut newer = Operation::new(
            OpKind::StrokeUpdate,
            "r",
            "bob",
            data(json!({"stroke_id": "s1", "timestamp": 2000.0, "client_version": 0})),
        );
        engine.process_operation(newer.clone()).await.unwrap();

        // A stale concurrent update (older timestamp, knows nothing) loses
        newer = Operation::new(
            OpKind::StrokeUpdate,
            "r",
            "carol",
            data(json!({"stroke_id": "s1", "timestamp": 1000.0, "client_version": 0})),
        );
        let result = engine.process_operation(newer).await.unwrap();
        assert_eq!(result.operation.kind, OpKind::Noop);
        assert_eq!(result.operation.version, 3);
        assert_eq!(result.operation.transformed_from.len(), 2);
    }

    #[tokio::test]
    async fn test_client_version_limits_window() {
        let (_store, engine) = engine();
        engine.process_operation(create_op("r", "s1")).await.unwrap();

        let del = Operation::new(
            OpKind::StrokeDelete,
            "r",
            "bob",
            data(json!({"stroke_id": "s1", "client_version": 1})),
        );
        let result = engine.process_operation(del).await.unwrap();
        // Client had seen version 1, so nothing was concurrent
        assert!(result.operation.transformed_from.is_empty());
        assert_eq!(result.operation.version, 2);
    }

    #[tokio::test]
    async fn test_user_state_tracked() {
        let (_store, engine) = engine();
        engine.process_operation(create_op("r", "s1")).await.unwrap();

        let cursor = Operation::new(
            OpKind::CursorMove,
            "r",
            "alice",
            data(json!({"x": 42.0, "y": 7.0})),
        );
        engine.process_operation(cursor).await.unwrap();

        let users = engine.get_room_users("r").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "alice");
        assert_eq!(users[0].last_version, 2);
        assert_eq!(users[0].cursor_position, Some(Point::new(42.0, 7.0)));

        engine.mark_user_inactive("r", "alice").await;
        assert!(engine.get_room_users("r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spatial_index_follows_operations() {
        let (_store, engine) = engine();
        let viewport = BoundingBox::new(-100.0, -100.0, 100.0, 100.0);

        engine.process_operation(create_op("r", "s1")).await.unwrap();
        assert_eq!(engine.spatial().query_viewport("r", viewport).await.result_count, 1);

        let del = Operation::new(
            OpKind::StrokeDelete,
            "r",
            "alice",
            data(json!({"stroke_id": "s1", "client_version": 1})),
        );
        engine.process_operation(del).await.unwrap();
        assert_eq!(engine.spatial().query_viewport("r", viewport).await.result_count, 0);

        engine.process_operation(create_op("r", "s2")).await.unwrap();
        let clear = Operation::new(OpKind::ClearAll, "r", "alice", data(json!({})));
        engine.process_operation(clear).await.unwrap();
        assert_eq!(engine.spatial().query_viewport("r", viewport).await.result_count, 0);
    }

    #[tokio::test]
    async fn test_admission_stamps_server_time() {
        let (store, engine) = engine();
        let before = now_ms();

        // A client clock sixty days behind must not drive retention
        let mut op = create_op("r", "s1");
        op.created_at = before - 60 * 24 * 60 * 60 * 1000;
        let result = engine.process_operation(op).await.unwrap();

        assert!(result.operation.created_at >= before);
        let stored = &store.operations_since("r", 0, 10).unwrap()[0];
        assert!(stored.created_at >= before);
    }

    #[tokio::test]
    async fn test_cleanup_trims_window_and_store() {
        let (store, engine) = engine();
        // History persisted by an earlier run, already aged out
        let mut old = create_op("r", "s1");
        old.version = 1;
        old.created_at = now_ms() - 10_000_000;
        store.append_operation(&old).unwrap();

        engine.process_operation(create_op("r", "s2")).await.unwrap();

        let removed = engine
            .cleanup_old_operations(Duration::from_secs(1000))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.operation_count(), 1);

        let room = engine.room("r").await.unwrap();
        assert_eq!(room.inner.read().await.window.len(), 1);
    }
}
