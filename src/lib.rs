//! # atelier-collab — Operation-transform engine for shared drawing rooms
//!
//! Concurrent stroke edits from many clients are serialized per room,
//! transformed against everything the submitting client had not yet seen,
//! stamped with the next dense version, persisted, and fanned out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     Operation       ┌─────────────┐
//! │   Client    │ ───────────────────►│  OtEngine   │
//! │ (per user)  │ ◄─────────────────── │ (per room)  │
//! └──────┬──────┘   TransformResult   └──────┬──────┘
//!        │                                   │
//!        │ reconnect                 ┌───────┼────────┐
//!        ▼                           ▼       ▼        ▼
//! ┌───────────────┐          ┌─────────┐ ┌────────┐ ┌─────────────┐
//! │SessionRecovery│ ◄─────── │ Storage │ │Spatial │ │ RoomChannel │
//! │ (catch-up)    │          │ (Rocks) │ │ Index  │ │ (fan-out)   │
//! └───────────────┘          └─────────┘ └────────┘ └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Operation envelope, geometry, validation
//! - [`transform`] — Pairwise transformation rules and chain folding
//! - [`engine`] — Per-room admission: transform, version, persist, commit
//! - [`spatial`] — Uniform-grid viewport and radius queries
//! - [`recovery`] — Reconnect catch-up, snapshots, retention cleanup
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`storage`] — RocksDB-backed and in-memory operation stores

pub mod broadcast;
pub mod engine;
pub mod protocol;
pub mod recovery;
pub mod spatial;
pub mod storage;
pub mod transform;

// Re-exports for convenience
pub use broadcast::{ChannelStats, MemberInfo, RoomChannel, RoomDirectory};
pub use engine::{EngineConfig, EngineError, OtEngine, UserState};
pub use protocol::{
    now_ms, BoundingBox, OpKind, Operation, Point, TransformResult, ValidationError,
};
pub use recovery::{
    CleanupConfig, RecoveryRequest, RecoveryResponse, RecoveryStats, RoomStateSnapshot,
    SessionRecovery, RECOVERY_BATCH_LIMIT,
};
pub use spatial::{
    IndexedStroke, SpatialConfig, SpatialIndex, SpatialStats, ViewportResult,
};
pub use storage::{
    MemoryStore, OperationStore, RocksStore, RoomMeta, SessionRecord, StoreConfig, StoreError,
};
pub use transform::{transform_chain, transform_pair, TransformError, TRANSFORM_RULES_VERSION};
