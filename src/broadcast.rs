//! Fan-out of admitted operations to room members.
//!
//! Each room gets one tokio broadcast channel; every member holds an
//! independent receiver buffering up to `capacity` operations. A member
//! that stops draining lags and eventually drops messages rather than
//! stalling the room; a lagging client is expected to run session
//! recovery, which is why dropped fan-out is safe.
//!
//! Stats are atomics so `publish` never takes a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::Operation;

/// Snapshot of a channel's health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

struct AtomicChannelStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A member of a room channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: String,
    /// RGBA presence color, stable per user id
    pub color: [f32; 4],
}

impl MemberInfo {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for(&user_id),
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Deterministic presence color so a user looks the same on every peer.
fn color_for(user_id: &str) -> [f32; 4] {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in user_id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let hue = (hash % 360) as f32;
    let (r, g, b) = hue_to_rgb(hue);
    [r, g, b, 1.0]
}

fn hue_to_rgb(hue: f32) -> (f32, f32, f32) {
    let h = hue / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    }
}

/// One room's fan-out channel.
///
/// Receivers get every published operation including the sender's own
/// admission ack; filtering by `user_id` is the transport's job.
pub struct RoomChannel {
    sender: broadcast::Sender<Arc<Operation>>,
    members: RwLock<HashMap<String, MemberInfo>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl RoomChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicChannelStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Join the room; the returned receiver yields operations published
    /// after this call.
    pub async fn join(&self, member: MemberInfo) -> broadcast::Receiver<Arc<Operation>> {
        let mut members = self.members.write().await;
        members.insert(member.user_id.clone(), member);
        self.sender.subscribe()
    }

    pub async fn leave(&self, user_id: &str) -> Option<MemberInfo> {
        self.members.write().await.remove(user_id)
    }

    /// Publish an admitted operation to every receiver. Lock-free.
    /// Returns the number of receivers reached.
    pub fn publish(&self, op: Arc<Operation>) -> usize {
        let reached = match self.sender.send(op) {
            Ok(n) => n,
            Err(_) => {
                // No receivers; the operation is already durable, nothing lost
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    /// Subscribe without registering membership (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Operation>> {
        self.sender.subscribe()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, user_id: &str) -> bool {
        self.members.read().await.contains_key(user_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }
}

/// Maps room ids to their channels, creating them lazily.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, Arc<RoomChannel>>>,
    default_capacity: usize,
}

impl RoomDirectory {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<RoomChannel> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(RoomChannel::new(self.default_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Drop a room channel once its last member left.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.member_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
