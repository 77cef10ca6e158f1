//! Directory of registered sessions.
//!
//! Every read and write goes through one mutex guarding the whole map, and no
//! method holds it across a send. Callers that fan out take a snapshot with
//! [`Registry::snapshot_targets`] and write after the lock is released.
//!
//! Nicknames are not unique. Two connections may register the same name, in
//! which case [`Registry::find_by_nickname`] returns the one registered first.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionId};

struct Entry {
    connection: Arc<Connection>,
    nickname: String,
}

#[derive(Default)]
pub struct Registry {
    // Keyed by id so iteration follows accept order.
    entries: Mutex<BTreeMap<ConnectionId, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection` under `nickname`. Duplicate nicknames are accepted.
    pub async fn register(&self, connection: Arc<Connection>, nickname: impl Into<String>) {
        let nickname = nickname.into();
        let mut entries = self.entries.lock().await;
        entries.insert(
            connection.id(),
            Entry {
                connection,
                nickname,
            },
        );
    }

    /// Removes the entry and returns its nickname. A second call for the same
    /// id returns `None`.
    pub async fn unregister(&self, id: ConnectionId) -> Option<String> {
        let mut entries = self.entries.lock().await;
        entries.remove(&id).map(|entry| entry.nickname)
    }

    /// Point-in-time copy of every registered connection except `exclude`.
    pub async fn snapshot_targets(&self, exclude: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, entry)| Arc::clone(&entry.connection))
            .collect()
    }

    pub async fn find_by_nickname(&self, nickname: &str) -> Option<Arc<Connection>> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .find(|entry| entry.nickname == nickname)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub async fn nicknames(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.values().map(|entry| entry.nickname.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
