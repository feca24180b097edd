//! Session recovery: reconnect catch-up, room state snapshots, and
//! background retention cleanup.
//!
//! A client that drops and reconnects sends the last version it applied;
//! the recovery path replies with every operation after it, in version
//! order, so replaying them lands the client on the room's current state.
//! When retention has already purged part of that range the response says
//! so explicitly and the client must resync from a snapshot instead of
//! silently diverging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::protocol::{now_ms, Operation};
use crate::spatial::SpatialIndex;
use crate::storage::{OperationStore, RoomMeta, SessionRecord, StoreError};

/// Most operations returned per recovery call; clients page by re-requesting
/// from the last version they received.
pub const RECOVERY_BATCH_LIMIT: usize = 1000;

/// Reconnect request from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub room_id: String,
    pub user_id: String,
    /// Last version the client applied before losing its connection
    pub last_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Recovery outcome. `success: false` with `room_exists: true` means the
/// requested range is no longer replayable and the client needs a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub success: bool,
    pub missed_operations: Vec<Operation>,
    pub current_version: i64,
    pub room_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryResponse {
    fn failed(room_exists: bool, current_version: i64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            missed_operations: Vec::new(),
            current_version,
            room_exists,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Full-state snapshot for clients that cannot (or should not) replay.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStateSnapshot {
    pub room: RoomMeta,
    pub current_version: i64,
    /// Most recent operations, oldest first
    pub recent_operations: Vec<Operation>,
    pub active_users: Vec<SessionRecord>,
    /// Live strokes currently indexed for the room
    pub stroke_count: usize,
}

/// Cross-room recovery and retention counters for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    /// Sessions active in the last 5 minutes
    pub active_sessions: u64,
    /// Sessions active in the last hour
    pub recent_sessions: u64,
    /// Operations admitted in the last 24 hours
    pub total_operations: u64,
    /// Rooms with activity in the last hour
    pub active_rooms: u64,
}

/// Retention knobs for [`SessionRecovery::spawn_cleanup`].
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub session_max_age: Duration,
    pub operation_max_age: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            session_max_age: Duration::from_secs(24 * 60 * 60),
            operation_max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Recovery and retention service over the shared store and spatial index.
pub struct SessionRecovery {
    store: Arc<dyn OperationStore>,
    spatial: Arc<SpatialIndex>,
    /// Users idle longer than this are excluded from snapshots
    active_window_ms: i64,
    /// Operations included in a snapshot
    snapshot_depth: i64,
}

impl SessionRecovery {
    pub fn new(store: Arc<dyn OperationStore>, spatial: Arc<SpatialIndex>) -> Self {
        Self {
            store,
            spatial,
            active_window_ms: 5 * 60 * 1000,
            snapshot_depth: 100,
        }
    }

    /// Handle a reconnect. Never panics or errors at the call boundary;
    /// failures are folded into the response so the transport can always
    /// serialize a reply.
    pub fn handle_recovery_request(&self, req: &RecoveryRequest) -> RecoveryResponse {
        let meta = match self.store.room_meta(&req.room_id) {
            Ok(meta) => meta,
            Err(e) => {
                log::error!("recovery lookup failed for room {}: {e}", req.room_id);
                return RecoveryResponse::failed(false, 0, format!("room lookup failed: {e}"));
            }
        };

        let meta = match meta {
            Some(meta) if meta.is_active => meta,
            _ => {
                return RecoveryResponse::failed(
                    false,
                    0,
                    format!("room {} does not exist or is inactive", req.room_id),
                );
            }
        };

        let ops = match self
            .store
            .operations_since(&req.room_id, req.last_version, RECOVERY_BATCH_LIMIT)
        {
            Ok(ops) => ops,
            Err(e) => {
                log::error!("recovery read failed for room {}: {e}", req.room_id);
                return RecoveryResponse::failed(
                    true,
                    meta.current_version,
                    format!("operation read failed: {e}"),
                );
            }
        };

        // Retention may have purged operations anywhere in the requested
        // range, not just at its start. A client replaying across a hole
        // would diverge, so the batch must be dense from last_version + 1
        // through its final element; otherwise refuse and force a snapshot
        // resync instead.
        let mut next_expected = req.last_version + 1;
        for op in &ops {
            if op.version != next_expected {
                break;
            }
            next_expected += 1;
        }
        let replayable = match ops.last() {
            Some(last) => next_expected > last.version,
            None => meta.current_version <= req.last_version,
        };
        if !replayable {
            return RecoveryResponse::failed(
                true,
                meta.current_version,
                format!("operation {next_expected} is no longer available; full resync required"),
            );
        }

        // Best effort: a failed session write must not block recovery.
        if req.session_id.is_some() {
            let now = now_ms();
            let session = SessionRecord {
                room_id: req.room_id.clone(),
                user_id: req.user_id.clone(),
                session_token: req.session_id.clone(),
                joined_at: now,
                last_activity: now,
                is_active: true,
            };
            if let Err(e) = self.store.upsert_session(&session) {
                log::warn!(
                    "session upsert failed for {}/{}: {e}",
                    req.room_id,
                    req.user_id
                );
            }
        }

        let count = ops.len();
        let last_delivered = ops.last().map_or(req.last_version, |o| o.version);
        let message = if last_delivered < meta.current_version {
            format!(
                "recovered {count} operations, {} remain; request again from version {last_delivered}",
                meta.current_version - last_delivered
            )
        } else {
            format!("recovered {count} missed operations")
        };

        log::info!(
            "recovered {}/{}: {} operations after version {}",
            req.room_id,
            req.user_id,
            count,
            req.last_version
        );

        RecoveryResponse {
            success: true,
            missed_operations: ops,
            current_version: meta.current_version,
            room_exists: true,
            message: Some(message),
            error: None,
        }
    }

    /// Snapshot a room for a client joining cold or resyncing after a
    /// recovery gap.
    pub async fn get_room_state(&self, room_id: &str) -> Result<RoomStateSnapshot, StoreError> {
        let meta = self
            .store
            .room_meta(room_id)?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;

        let after = (meta.current_version - self.snapshot_depth).max(0);
        let recent_operations =
            self.store
                .operations_since(room_id, after, self.snapshot_depth as usize)?;

        let active_users = self
            .store
            .sessions_active_since(room_id, now_ms() - self.active_window_ms)?;

        let stroke_count = per_room_count(&self.spatial.stats().await.room_counts, room_id);

        Ok(RoomStateSnapshot {
            current_version: meta.current_version,
            room: meta,
            recent_operations,
            active_users,
            stroke_count,
        })
    }

    /// Cross-room counters: session, operation, and room activity.
    pub fn recovery_stats(&self) -> Result<RecoveryStats, StoreError> {
        let now = now_ms();
        Ok(RecoveryStats {
            active_sessions: self.store.count_sessions_active_since(now - 5 * 60 * 1000)?,
            recent_sessions: self.store.count_sessions_active_since(now - 60 * 60 * 1000)?,
            total_operations: self
                .store
                .count_operations_created_since(now - 24 * 60 * 60 * 1000)?,
            active_rooms: self.store.count_rooms_active_since(now - 60 * 60 * 1000)?,
        })
    }

    /// One retention pass: drop stale sessions and aged-out operations.
    /// Returns `(sessions_removed, operations_removed)`.
    pub fn cleanup_expired(&self, config: &CleanupConfig) -> Result<(u64, u64), StoreError> {
        let now = now_ms();
        let sessions = self
            .store
            .purge_sessions_inactive_before(now - config.session_max_age.as_millis() as i64)?;
        let operations = self
            .store
            .purge_operations_before(now - config.operation_max_age.as_millis() as i64)?;

        if sessions > 0 || operations > 0 {
            log::info!("retention pass removed {sessions} sessions, {operations} operations");
        }
        Ok((sessions, operations))
    }

    /// Run retention on a fixed interval until the handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, config: CleanupConfig) -> JoinHandle<()> {
        let recovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            // interval fires immediately; retention should wait a full period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = recovery.cleanup_expired(&config) {
                    log::error!("retention pass failed: {e}");
                }
            }
        })
    }
}

fn per_room_count(counts: &HashMap<String, usize>, room_id: &str) -> usize {
    counts.get(room_id).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpKind;
    use crate::storage::MemoryStore;
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

    fn service() -> (Arc<MemoryStore>, SessionRecovery) {
        let store = Arc::new(MemoryStore::new());
        let spatial = Arc::new(SpatialIndex::default());
        let recovery = SessionRecovery::new(store.clone(), spatial);
        (store, recovery)
    }

    fn request(room: &str, last_version: i64) -> RecoveryRequest {
        RecoveryRequest {
            room_id: room.into(),
            user_id: "alice".into(),
            last_version,
            session_id: None,
        }
    }

    #[test]
    fn test_unknown_room_reported() {
        let (_store, recovery) = service();
        let resp = recovery.handle_recovery_request(&request("nope", 0));
        assert!(!resp.success);
        assert!(!resp.room_exists);
        assert!(resp.error.is_some());
    }

    #[test]
    fn test_full_replay_from_zero() {
        let (store, recovery) = service();
        for v in 1..=4 {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }

        let resp = recovery.handle_recovery_request(&request("r", 0));
        assert!(resp.success);
        assert!(resp.room_exists);
        assert_eq!(resp.current_version, 4);
        let versions: Vec<i64> = resp.missed_operations.iter().map(|o| o.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_partial_replay() {
        let (store, recovery) = service();
        for v in 1..=4 {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }

        let resp = recovery.handle_recovery_request(&request("r", 2));
        assert!(resp.success);
        assert_eq!(resp.missed_operations.len(), 2);
        assert_eq!(resp.missed_operations[0].version, 3);
    }

    #[test]
    fn test_up_to_date_client() {
        let (store, recovery) = service();
        store.append_operation(&versioned_op("r", 1)).unwrap();

        let resp = recovery.handle_recovery_request(&request("r", 1));
        assert!(resp.success);
        assert!(resp.missed_operations.is_empty());
        assert_eq!(resp.current_version, 1);
    }

    #[test]
    fn test_purged_range_forces_resync() {
        let (store, recovery) = service();
        for v in 1..=5 {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }
        // Retention removed everything before version 4
        store
            .purge_operations_before(crate::protocol::now_ms() + 1)
            .unwrap();
        store.append_operation(&versioned_op("r", 6)).unwrap();

        let resp = recovery.handle_recovery_request(&request("r", 1));
        assert!(!resp.success);
        assert!(resp.room_exists);
        assert_eq!(resp.current_version, 6);
        assert!(resp.error.unwrap().contains("no longer available"));
    }

    #[test]
    fn test_mid_history_hole_forces_resync() {
        let (store, recovery) = service();
        store.append_operation(&versioned_op("r", 1)).unwrap();
        // Version 2 was purged by retention; its neighbors survive
        store.append_operation(&versioned_op("r", 3)).unwrap();

        let resp = recovery.handle_recovery_request(&request("r", 0));
        assert!(!resp.success);
        assert!(resp.room_exists);
        assert!(resp.missed_operations.is_empty());
        assert!(resp.error.unwrap().contains("no longer available"));
    }

    #[test]
    fn test_hole_past_the_client_position_forces_resync() {
        let (store, recovery) = service();
        for v in [1, 2, 3, 5, 6] {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }

        // Client at version 2 would replay [3, 5, 6] across the missing 4
        let resp = recovery.handle_recovery_request(&request("r", 2));
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("operation 4"));

        // A client already past the hole replays cleanly
        let resp = recovery.handle_recovery_request(&request("r", 4));
        assert!(resp.success);
        let versions: Vec<i64> = resp.missed_operations.iter().map(|o| o.version).collect();
        assert_eq!(versions, vec![5, 6]);
    }

    #[test]
    fn test_empty_store_with_advanced_version_is_a_gap() {
        let (store, recovery) = service();
        store.append_operation(&versioned_op("r", 1)).unwrap();
        store
            .purge_operations_before(crate::protocol::now_ms() + 1)
            .unwrap();

        let resp = recovery.handle_recovery_request(&request("r", 0));
        assert!(!resp.success);
        assert!(resp.room_exists);
    }

    #[test]
    fn test_session_upserted_when_token_present() {
        let (store, recovery) = service();
        store.append_operation(&versioned_op("r", 1)).unwrap();

        let mut req = request("r", 0);
        req.session_id = Some("tok-1".into());
        let resp = recovery.handle_recovery_request(&req);
        assert!(resp.success);

        let sessions = store.sessions_active_since("r", 0).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_pagination_message_when_capped() {
        let (store, recovery) = service();
        for v in 1..=(RECOVERY_BATCH_LIMIT as i64 + 5) {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }

        let resp = recovery.handle_recovery_request(&request("r", 0));
        assert!(resp.success);
        assert_eq!(resp.missed_operations.len(), RECOVERY_BATCH_LIMIT);
        assert!(resp.message.unwrap().contains("request again"));
    }

    #[tokio::test]
    async fn test_room_state_snapshot() {
        let (store, recovery) = service();
        for v in 1..=3 {
            store.append_operation(&versioned_op("r", v)).unwrap();
        }
        let now = now_ms();
        store
            .upsert_session(&SessionRecord {
                room_id: "r".into(),
                user_id: "alice".into(),
                session_token: None,
                joined_at: now,
                last_activity: now,
                is_active: true,
            })
            .unwrap();

        let snapshot = recovery.get_room_state("r").await.unwrap();
        assert_eq!(snapshot.current_version, 3);
        assert_eq!(snapshot.recent_operations.len(), 3);
        assert_eq!(snapshot.active_users.len(), 1);
        assert_eq!(snapshot.stroke_count, 0);
    }

    #[test]
    fn test_recovery_stats_counters() {
        let (store, recovery) = service();
        let now = now_ms();
        store.append_operation(&versioned_op("r1", 1)).unwrap();
        store.append_operation(&versioned_op("r2", 1)).unwrap();

        let mk = |user: &str, last: i64| SessionRecord {
            room_id: "r1".into(),
            user_id: user.into(),
            session_token: None,
            joined_at: now,
            last_activity: last,
            is_active: true,
        };
        store.upsert_session(&mk("alice", now)).unwrap();
        // Active within the hour but not the five-minute window
        store.upsert_session(&mk("bob", now - 30 * 60 * 1000)).unwrap();

        let stats = recovery.recovery_stats().unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.recent_sessions, 2);
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.active_rooms, 2);
    }

    #[test]
    fn test_cleanup_expired() {
        let (store, recovery) = service();
        let now = now_ms();

        let mut old = versioned_op("r", 1);
        old.created_at = now - 40 * 24 * 60 * 60 * 1000;
        store.append_operation(&old).unwrap();
        store.append_operation(&versioned_op("r", 2)).unwrap();
        store
            .upsert_session(&SessionRecord {
                room_id: "r".into(),
                user_id: "bob".into(),
                session_token: None,
                joined_at: now,
                last_activity: now - 48 * 60 * 60 * 1000,
                is_active: true,
            })
            .unwrap();

        let (sessions, operations) = recovery.cleanup_expired(&CleanupConfig::default()).unwrap();
        assert_eq!(sessions, 1);
        assert_eq!(operations, 1);
        assert_eq!(store.operation_count(), 1);
    }
}
