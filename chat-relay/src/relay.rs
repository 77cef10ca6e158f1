//! Delivery paths shared by all sessions: broadcast, whisper and eviction.

use std::{collections::VecDeque, sync::Arc};

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::{
    connection::{Connection, ConnectionId},
    protocol,
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperOutcome {
    Delivered,
    TargetNotFound,
}

#[derive(Clone, Default)]
pub struct Relay {
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sends `line` to every registered connection except `exclude`.
    ///
    /// Peers that cannot be written to are evicted, and their departure is
    /// announced to whoever is left. Those announcements can evict further
    /// peers; the queue drains until a round goes out cleanly.
    pub async fn broadcast(&self, line: &str, exclude: Option<ConnectionId>) {
        let mut pending = VecDeque::from([(line.to_string(), exclude)]);

        while let Some((line, exclude)) = pending.pop_front() {
            for connection in self.fan_out(&line, exclude).await {
                if let Some(nickname) = self.evict(&connection).await {
                    info!(peer = ?connection.peer(), %nickname, "evicted unreachable client");
                    pending.push_back((protocol::departed(&nickname), None));
                }
            }
        }
    }

    /// Delivers one line and returns the connections that failed to take it.
    async fn fan_out(&self, line: &str, exclude: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        let targets = self.registry.snapshot_targets(exclude).await;
        let results = join_all(targets.iter().map(|target| target.send(line))).await;

        targets
            .into_iter()
            .zip(results)
            .filter_map(|(target, result)| match result {
                Ok(()) => None,
                Err(error) => {
                    debug!(connection = %target.id(), ?error, "broadcast delivery failed");
                    Some(target)
                }
            })
            .collect()
    }

    /// Resolves `target` by nickname and delivers `content` to it, confirming
    /// back to `requester`. Delivery failures on either side are logged and
    /// otherwise ignored.
    pub async fn whisper(
        &self,
        sender: &str,
        target: &str,
        content: &str,
        requester: &Connection,
    ) -> WhisperOutcome {
        let Some(recipient) = self.registry.find_by_nickname(target).await else {
            if let Err(error) = requester
                .send(&protocol::whisper_target_missing(target))
                .await
            {
                debug!(connection = %requester.id(), ?error, "failed to report missing whisper target");
            }
            return WhisperOutcome::TargetNotFound;
        };

        if let Err(error) = recipient.send(&protocol::whisper(sender, content)).await {
            debug!(connection = %recipient.id(), ?error, "whisper delivery failed");
        }
        if let Err(error) = requester
            .send(&protocol::whisper_sent(target, content))
            .await
        {
            debug!(connection = %requester.id(), ?error, "whisper confirmation failed");
        }

        WhisperOutcome::Delivered
    }

    /// Unregisters and closes `connection`, returning the nickname it held.
    ///
    /// Only the first caller gets the nickname back, so only one party ever
    /// announces a departure.
    pub async fn evict(&self, connection: &Connection) -> Option<String> {
        let nickname = self.registry.unregister(connection.id()).await;
        connection.close().await;
        nickname
    }

    /// Evicts `connection` and tells everyone still registered that it left.
    pub async fn disconnect(&self, connection: &Connection) -> Option<String> {
        let nickname = self.evict(connection).await?;
        info!(peer = ?connection.peer(), %nickname, "client disconnected");
        self.broadcast(&protocol::departed(&nickname), None).await;
        Some(nickname)
    }
}
