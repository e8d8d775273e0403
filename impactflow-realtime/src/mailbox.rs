//! Client-side notification mailbox.
//!
//! Keeps the most recent notifications for one user profile, oldest first,
//! and writes the whole list back to its [`MailboxStore`] after every
//! mutation. Notifications pushed while the client was offline are never
//! replayed by the server, so the mailbox only holds what it saw.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::protocol::{Notification, ServerEvent};
use crate::storage::{MailboxStore, StoreError};

pub const DEFAULT_NAMESPACE: &str = "impactflow_notifications";
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Oldest entries are evicted beyond this many
    pub capacity: usize,
    pub namespace: String,
    /// Distinguishes mailboxes sharing one store (normally the user id)
    pub profile: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            namespace: DEFAULT_NAMESPACE.to_string(),
            profile: "default".to_string(),
        }
    }
}

impl MailboxConfig {
    pub fn for_profile(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Self::default()
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.namespace, self.profile)
    }
}

pub struct NotificationMailbox {
    config: MailboxConfig,
    key: String,
    store: Arc<dyn MailboxStore>,
    items: VecDeque<Notification>,
}

impl NotificationMailbox {
    /// Open the mailbox, restoring whatever the store holds for it.
    pub fn open(config: MailboxConfig, store: Arc<dyn MailboxStore>) -> Result<Self, StoreError> {
        let key = config.storage_key();
        let mut items: VecDeque<Notification> = store.load(&key)?.unwrap_or_default().into();
        while items.len() > config.capacity {
            items.pop_front();
        }
        log::debug!("Mailbox {key} opened with {} notification(s)", items.len());
        Ok(Self {
            config,
            key,
            store,
            items,
        })
    }

    /// Append a notification. Returns `false` if its id is already present.
    ///
    /// On a store error the in-memory mailbox keeps the change.
    pub fn append(&mut self, notification: Notification) -> Result<bool, StoreError> {
        if self.items.iter().any(|n| n.id == notification.id) {
            return Ok(false);
        }
        self.items.push_back(notification);
        while self.items.len() > self.config.capacity {
            if let Some(evicted) = self.items.pop_front() {
                log::trace!("Mailbox {} evicted {}", self.key, evicted.id);
            }
        }
        self.persist()?;
        Ok(true)
    }

    /// Mark one notification read. Returns whether the id exists.
    pub fn mark_read(&mut self, id: &str) -> Result<bool, StoreError> {
        let Some(notification) = self.items.iter_mut().find(|n| n.id == id) else {
            return Ok(false);
        };
        if !notification.read {
            notification.read = true;
            self.persist()?;
        }
        Ok(true)
    }

    /// Mark everything read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> Result<usize, StoreError> {
        let mut changed = 0;
        for notification in self.items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed += 1;
        }
        if changed > 0 {
            self.persist()?;
        }
        Ok(changed)
    }

    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        self.items.clear();
        self.store.remove(&self.key)
    }

    /// Record the notification carried by a server event, if any.
    pub fn ingest(&mut self, event: &ServerEvent) -> Result<bool, StoreError> {
        match event {
            ServerEvent::Notification { notification } => self.append(notification.clone()),
            _ => Ok(false),
        }
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    /// Notifications, oldest first.
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        self.store.save(&self.key, self.items.make_contiguous())
    }
}
