//! Durable storage for notification mailboxes.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────┐   save / load   ┌───────────────────┐
//! │ NotificationMailbox │ ──────────────► │ dyn MailboxStore  │
//! └─────────────────────┘  "<ns>:<user>"  └─────────┬─────────┘
//!                                                   │
//!                                  ┌────────────────┴───────────────┐
//!                                  ▼                                ▼
//!                       RocksMailboxStore                 MemoryMailboxStore
//!                       (bincode + LZ4)                   (tests, ephemeral)
//! ```
//!
//! A mailbox is always written as a whole: it is small and capped, so
//! there is no incremental log.

pub mod rocks;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::Notification;

pub use rocks::{RocksMailboxStore, StoreConfig, StoreError};

/// Key/value persistence for whole mailboxes.
pub trait MailboxStore: Send + Sync {
    /// Load the mailbox stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<Vec<Notification>>, StoreError>;
    /// Replace the mailbox stored under `key`.
    fn save(&self, key: &str, notifications: &[Notification]) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store. Contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryMailboxStore {
    entries: Mutex<HashMap<String, Vec<Notification>>>,
}

impl MemoryMailboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Notification>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl MailboxStore for MemoryMailboxStore {
    fn load(&self, key: &str) -> Result<Option<Vec<Notification>>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn save(&self, key: &str, notifications: &[Notification]) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), notifications.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
