//! In-memory store: tests and persistence-free deployments.
//!
//! A single mutex over three maps. Operations are keyed by
//! `(room_id, version)` in a BTreeMap so range reads come back in version
//! order for free.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::protocol::Operation;
use crate::storage::{OperationStore, RoomMeta, SessionRecord, StoreError};

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, RoomMeta>,
    ops: BTreeMap<(String, i64), Operation>,
    sessions: HashMap<(String, String), SessionRecord>,
}

/// Process-local [`OperationStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: make every subsequent `append_operation` fail until
    /// reset. Used to exercise the engine's version-rollback path.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Total persisted operations across all rooms.
    pub fn operation_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").ops.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }
}

impl OperationStore for MemoryStore {
    fn room_meta(&self, room_id: &str) -> Result<Option<RoomMeta>, StoreError> {
        Ok(self.lock().rooms.get(room_id).cloned())
    }

    fn upsert_room(&self, meta: &RoomMeta) -> Result<(), StoreError> {
        self.lock().rooms.insert(meta.id.clone(), meta.clone());
        Ok(())
    }

    fn append_operation(&self, op: &Operation) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected append failure".into()));
        }

        let mut inner = self.lock();
        let key = (op.room_id.clone(), op.version);
        if inner.ops.contains_key(&key) {
            return Err(StoreError::VersionConflict {
                room_id: op.room_id.clone(),
                version: op.version,
            });
        }

        inner.ops.insert(key, op.clone());
        let room = inner
            .rooms
            .entry(op.room_id.clone())
            .or_insert_with(|| RoomMeta::new(&op.room_id));
        room.current_version = op.version;
        room.last_activity = crate::protocol::now_ms();
        Ok(())
    }

    fn operations_since(
        &self,
        room_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        let inner = self.lock();
        let lo = (room_id.to_string(), after_version.saturating_add(1));
        let hi = (room_id.to_string(), i64::MAX);
        Ok(inner
            .ops
            .range(lo..=hi)
            .take(limit)
            .map(|(_, op)| op.clone())
            .collect())
    }

    fn upsert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.lock().sessions.insert(
            (session.room_id.clone(), session.user_id.clone()),
            session.clone(),
        );
        Ok(())
    }

    fn sessions_active_since(
        &self,
        room_id: &str,
        cutoff_ms: i64,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let inner = self.lock();
        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| s.room_id == room_id && s.is_active && s.last_activity >= cutoff_ms)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    fn purge_sessions_inactive_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.last_activity >= cutoff_ms);
        Ok((before - inner.sessions.len()) as u64)
    }

    fn purge_operations_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.ops.len();
        inner.ops.retain(|_, op| op.created_at >= cutoff_ms);
        Ok((before - inner.ops.len()) as u64)
    }

    fn count_sessions_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_active && s.last_activity >= cutoff_ms)
            .count() as u64)
    }

    fn count_operations_created_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .ops
            .values()
            .filter(|op| op.created_at >= cutoff_ms)
            .count() as u64)
    }

    fn count_rooms_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .rooms
            .values()
            .filter(|r| r.is_active && r.last_activity >= cutoff_ms)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpKind;
    use serde_json::json;

    fn versioned_op(room: &str, version: i64) -> Operation {
        let mut op = Operation::new(
            OpKind::StrokeCreate,
            room,
            "alice",
            match json!({"stroke_id": format!("s{version}"), "points": [[0, 0]]}) {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            },
        );
        op.version = version;
        op
    }

    #[test]
    fn test_append_creates_room_and_bumps_version() {
        let store = MemoryStore::new();
        store.append_operation(&versioned_op("r1", 1)).unwrap();
        store.append_operation(&versioned_op("r1", 2)).unwrap();

        let meta = store.room_meta("r1").unwrap().unwrap();
        assert_eq!(meta.current_version, 2);
        assert!(meta.is_active);
    }

    #[test]
    fn test_append_rejects_duplicate_version() {
        let store = MemoryStore::new();
        store.append_operation(&versioned_op("r1", 1)).unwrap();
        let err = store.append_operation(&versioned_op("r1", 1)).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { version: 1, .. }));
    }

    #[test]
    fn test_operations_since_range_and_order() {
        let store = MemoryStore::new();
        for v in 1..=5 {
            store.append_operation(&versioned_op("r1", v)).unwrap();
        }
        // Another room must not leak in
        store.append_operation(&versioned_op("r2", 1)).unwrap();

        let ops = store.operations_since("r1", 2, 100).unwrap();
        let versions: Vec<i64> = ops.iter().map(|o| o.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);

        let capped = store.operations_since("r1", 0, 2).unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].version, 1);
    }

    #[test]
    fn test_session_upsert_and_active_filter() {
        let store = MemoryStore::new();
        let now = crate::protocol::now_ms();
        let mk = |user: &str, last: i64, active: bool| SessionRecord {
            room_id: "r1".into(),
            user_id: user.into(),
            session_token: Some("tok".into()),
            joined_at: now,
            last_activity: last,
            is_active: active,
        };

        store.upsert_session(&mk("alice", now, true)).unwrap();
        store.upsert_session(&mk("bob", now - 600_000, true)).unwrap();
        store.upsert_session(&mk("carol", now, false)).unwrap();

        let active = store.sessions_active_since("r1", now - 300_000).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "alice");
    }

    #[test]
    fn test_purges() {
        let store = MemoryStore::new();
        let now = crate::protocol::now_ms();

        let mut old = versioned_op("r1", 1);
        old.created_at = now - 100_000;
        store.append_operation(&old).unwrap();
        let mut fresh = versioned_op("r1", 2);
        fresh.created_at = now;
        store.append_operation(&fresh).unwrap();

        assert_eq!(store.purge_operations_before(now - 50_000).unwrap(), 1);
        assert_eq!(store.operation_count(), 1);

        store
            .upsert_session(&SessionRecord {
                room_id: "r1".into(),
                user_id: "alice".into(),
                session_token: None,
                joined_at: now - 100_000,
                last_activity: now - 100_000,
                is_active: true,
            })
            .unwrap();
        assert_eq!(store.purge_sessions_inactive_before(now).unwrap(), 1);
    }

    #[test]
    fn test_activity_counters() {
        let store = MemoryStore::new();
        let now = crate::protocol::now_ms();

        let mut old = versioned_op("r1", 1);
        old.created_at = now - 100_000;
        store.append_operation(&old).unwrap();
        let mut fresh = versioned_op("r1", 2);
        fresh.created_at = now;
        store.append_operation(&fresh).unwrap();

        assert_eq!(store.count_operations_created_since(now - 50_000).unwrap(), 1);
        assert_eq!(store.count_operations_created_since(now - 200_000).unwrap(), 2);
        assert_eq!(store.count_rooms_active_since(now - 1000).unwrap(), 1);

        store
            .upsert_session(&SessionRecord {
                room_id: "r1".into(),
                user_id: "alice".into(),
                session_token: None,
                joined_at: now,
                last_activity: now - 100_000,
                is_active: true,
            })
            .unwrap();
        assert_eq!(store.count_sessions_active_since(now - 50_000).unwrap(), 0);
        assert_eq!(store.count_sessions_active_since(now - 200_000).unwrap(), 1);
    }

    #[test]
    fn test_fault_injection() {
        let store = MemoryStore::new();
        store.set_fail_appends(true);
        assert!(store.append_operation(&versioned_op("r1", 1)).is_err());
        store.set_fail_appends(false);
        assert!(store.append_operation(&versioned_op("r1", 1)).is_ok());
    }
}
