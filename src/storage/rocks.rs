//! RocksDB-backed operation store.
//!
//! Column families:
//! - `rooms`      — room rows (JSON, keyed by room id)
//! - `operations` — operation rows (LZ4-compressed JSON, keyed by
//!   `room_id \0 version_be64` so a prefix scan yields ascending versions)
//! - `sessions`   — session rows (JSON, keyed by `room_id \0 user_id`)
//!
//! `append_operation` uses a single `WriteBatch` for the operation row and the
//! room-version bump, which is the atomic "insert + bump" unit the engine's
//! dense-version invariant requires. Room ids may not contain NUL bytes
//! because NUL is the key separator.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::PathBuf;

use crate::protocol::{now_ms, Operation};
use crate::storage::{OperationStore, RoomMeta, SessionRecord, StoreError};

const CF_ROOMS: &str = "rooms";
const CF_OPERATIONS: &str = "operations";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_OPERATIONS, CF_SESSIONS];

const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — OS-buffered)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable [`OperationStore`] on RocksDB.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — callers serialize per room)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS | CF_SESSIONS => {
                // Small rows, point lookups
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Values are pre-compressed with lz4_flex; skip double work
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family: {name}")))
    }

    /// Key format: `<room_id bytes><0x00><version:8 bytes big-endian>`.
    fn op_key(room_id: &str, version: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + 9);
        key.extend_from_slice(room_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(&(version as u64).to_be_bytes());
        key
    }

    fn session_key(room_id: &str, user_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(room_id.len() + user_id.len() + 1);
        key.extend_from_slice(room_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(user_id.as_bytes());
        key
    }

    fn room_prefix(room_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(room_id.len() + 1);
        prefix.extend_from_slice(room_id.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn check_room_id(room_id: &str) -> Result<(), StoreError> {
        if room_id.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::SerializationError(
                "room id may not contain NUL bytes".into(),
            ));
        }
        Ok(())
    }

    fn encode_op(op: &Operation) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(op)?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode_op(bytes: &[u8]) -> Result<Operation, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl OperationStore for RocksStore {
    fn room_meta(&self, room_id: &str) -> Result<Option<RoomMeta>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => {
                let meta = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn upsert_room(&self, meta: &RoomMeta) -> Result<(), StoreError> {
        Self::check_room_id(&meta.id)?;
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(&cf, meta.id.as_bytes(), serde_json::to_vec(meta)?, &self.write_opts())?;
        Ok(())
    }

    fn append_operation(&self, op: &Operation) -> Result<(), StoreError> {
        Self::check_room_id(&op.room_id)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let key = Self::op_key(&op.room_id, op.version);
        if self.db.get_cf(&cf_ops, &key)?.is_some() {
            return Err(StoreError::VersionConflict {
                room_id: op.room_id.clone(),
                version: op.version,
            });
        }

        let mut room = self
            .room_meta(&op.room_id)?
            .unwrap_or_else(|| RoomMeta::new(&op.room_id));
        room.current_version = op.version;
        room.last_activity = now_ms();

        // One durable unit: operation row + room version bump
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, &key, Self::encode_op(op)?);
        batch.put_cf(&cf_rooms, op.room_id.as_bytes(), serde_json::to_vec(&room)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn operations_since(
        &self,
        room_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        Self::check_room_id(room_id)?;
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = Self::room_prefix(room_id);
        let start_key = Self::op_key(room_id, after_version.saturating_add(1));

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            ops.push(Self::decode_op(&value)?);
            if ops.len() >= limit {
                break;
            }
        }

        Ok(ops)
    }

    fn upsert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        Self::check_room_id(&session.room_id)?;
        let cf = self.cf(CF_SESSIONS)?;
        let key = Self::session_key(&session.room_id, &session.user_id);
        self.db
            .put_cf_opt(&cf, &key, serde_json::to_vec(session)?, &self.write_opts())?;
        Ok(())
    }

    fn sessions_active_since(
        &self,
        room_id: &str,
        cutoff_ms: i64,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Self::check_room_id(room_id)?;
        let cf = self.cf(CF_SESSIONS)?;
        let prefix = Self::room_prefix(room_id);

        let mut sessions = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let session: SessionRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if session.is_active && session.last_activity >= cutoff_ms {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    fn purge_sessions_inactive_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let session: SessionRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if session.last_activity < cutoff_ms {
                batch.delete_cf(&cf, &key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }

    fn purge_operations_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let op = Self::decode_op(&value)?;
            if op.created_at < cutoff_ms {
                batch.delete_cf(&cf, &key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }

    fn count_sessions_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let session: SessionRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if session.is_active && session.last_activity >= cutoff_ms {
                count += 1;
            }
        }
        Ok(count)
    }

    fn count_operations_created_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if Self::decode_op(&value)?.created_at >= cutoff_ms {
                count += 1;
            }
        }
        Ok(count)
    }

    fn count_rooms_active_since(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let room: RoomMeta = serde_json::from_slice(&value)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if room.is_active && room.last_activity >= cutoff_ms {
                count += 1;
            }
        }
        Ok(count)
    }
}
