//! RocksDB-backed mailbox store.
//!
//! Column families:
//! - `mailboxes` — one value per mailbox key, a bincode-encoded record list
//!   compressed with LZ4 (size-prepended)
//!
//! Wire notifications skip absent optional fields, which a non
//! self-describing format cannot round-trip, so values go through a
//! dedicated [`StoredNotification`] record.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Options,
    SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::MailboxStore;
use crate::protocol::{Notification, NotificationKind};

const CF_MAILBOXES: &str = "mailboxes";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("impactflow_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small cache, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// On-disk form of a [`Notification`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNotification {
    id: String,
    kind: NotificationKind,
    title: String,
    message: String,
    owner_user_id: String,
    project_id: String,
    created_at: u64,
    read: bool,
    action_url: Option<String>,
}

impl From<&Notification> for StoredNotification {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.clone(),
            kind: n.kind,
            title: n.title.clone(),
            message: n.message.clone(),
            owner_user_id: n.owner_user_id.clone(),
            project_id: n.project_id.clone(),
            created_at: n.created_at,
            read: n.read,
            action_url: n.action_url.clone(),
        }
    }
}

impl From<StoredNotification> for Notification {
    fn from(s: StoredNotification) -> Self {
        Notification {
            id: s.id,
            kind: s.kind,
            title: s.title,
            message: s.message,
            owner_user_id: s.owner_user_id,
            project_id: s.project_id,
            created_at: s.created_at,
            read: s.read,
            action_url: s.action_url,
        }
    }
}

fn encode(notifications: &[Notification]) -> Result<Vec<u8>, StoreError> {
    let records: Vec<StoredNotification> = notifications.iter().map(StoredNotification::from).collect();
    let raw = bincode::serde::encode_to_vec(&records, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode(bytes: &[u8]) -> Result<Vec<Notification>, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (records, _): (Vec<StoredNotification>, usize) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(records.into_iter().map(Notification::from).collect())
}

/// RocksDB-backed mailbox store.
pub struct RocksMailboxStore {
    /// RocksDB instance (single-threaded mode; callers serialize access)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksMailboxStore {
    /// Open the store, creating the database if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4-compressed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_MAILBOXES, cf_opts)],
        )?;
        log::debug!("Opened mailbox store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Keys of every stored mailbox.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_MAILBOXES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_MAILBOXES}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl MailboxStore for RocksMailboxStore {
    fn load(&self, key: &str) -> Result<Option<Vec<Notification>>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, notifications: &[Notification]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let value = encode(notifications)?;
        self.db
            .put_cf_opt(cf, key.as_bytes(), &value, &self.write_options())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
        Ok(())
    }
}
