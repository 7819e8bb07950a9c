//! The Channel Manager: a named registry of AMQP channels layered on top of the Connection
//! Manager, with prefetch applied at open time and a consumer roster kept for recovery.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use lapin::options::BasicQosOptions;
use lapin::Channel;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ChannelOptions;
use crate::connection::ConnectionManager;
use crate::error::Result;

struct ChannelEntry {
    connection_name: String,
    channel: Option<Channel>,
    /// Consumer tags opened on this channel, tracked so recovery can re-open them.
    consumers: HashSet<String>,
}

/// Owns named AMQP channels, each tied to a named connection.
pub(crate) struct ChannelManager {
    entries: DashMap<String, Arc<Mutex<ChannelEntry>>>,
    options: ChannelOptions,
}

impl ChannelManager {
    pub(crate) fn new(options: ChannelOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
        }
    }

    /// Creates (or returns, if already open) the named channel on top of `connection_name`,
    /// ensuring that connection exists in `connections` first.
    pub(crate) async fn create(
        &self,
        name: &str,
        connection_name: &str,
        connections: &ConnectionManager,
    ) -> Result<()> {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChannelEntry {
                    connection_name: connection_name.to_string(),
                    channel: None,
                    consumers: HashSet::new(),
                }))
            })
            .clone();

        let mut guard = entry.lock().await;
        if guard.channel.is_some() {
            return Ok(());
        }

        guard.connection_name = connection_name.to_string();
        let channel = self.open_channel(connection_name, connections).await?;
        guard.channel = Some(channel);
        Ok(())
    }

    async fn open_channel(
        &self,
        connection_name: &str,
        connections: &ConnectionManager,
    ) -> Result<Channel> {
        let connection = connections
            .get(connection_name)
            .await
            .expect("connection must exist before opening a channel on it");
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.options.limit, BasicQosOptions::default())
            .await?;
        debug!(channel_name = connection_name, prefetch = self.options.limit, "opened channel");
        Ok(channel)
    }

    /// Returns the live `lapin::Channel` for `name`, if one is open.
    pub(crate) async fn get(&self, name: &str) -> Option<Channel> {
        let entry = self.entries.get(name)?.clone();
        let guard = entry.lock().await;
        guard.channel.clone()
    }

    /// Returns whether a channel entry exists for `name` (regardless of whether it is currently
    /// open).
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Closes the named channel, if open. The descriptor (connection name, consumer roster) is
    /// preserved so a later [`Self::recover`] call reopens it without needing either again.
    pub(crate) async fn close(&self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.get(name).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut guard = entry.lock().await;
        if let Some(channel) = guard.channel.take() {
            channel.close(200, "closed by application").await?;
        }
        Ok(())
    }

    /// Records that `consumer_tag` is consuming on `name`'s channel, so it can be replayed after
    /// recovery.
    pub(crate) async fn add_consumer(&self, name: &str, consumer_tag: String) {
        if let Some(entry) = self.entries.get(name) {
            entry.lock().await.consumers.insert(consumer_tag);
        }
    }

    /// Forgets `consumer_tag` for `name`'s channel.
    pub(crate) async fn remove_consumer(&self, name: &str, consumer_tag: &str) {
        if let Some(entry) = self.entries.get(name) {
            entry.lock().await.consumers.remove(consumer_tag);
        }
    }

    /// Returns the names of every channel opened against `connection_name`, for the recovery
    /// coordinator to re-open after the connection itself has been recovered.
    pub(crate) async fn names_for_connection(&self, connection_name: &str) -> Vec<String> {
        let snapshot: Vec<(String, Arc<Mutex<ChannelEntry>>)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut names = Vec::new();
        for (name, entry) in snapshot {
            if entry.lock().await.connection_name == connection_name {
                names.push(name);
            }
        }
        names
    }

    /// Re-opens the named channel against its connection's current state, preserving the
    /// consumer tag roster so the caller can re-subscribe them.
    pub(crate) async fn recover(&self, name: &str, connections: &ConnectionManager) -> Result<HashSet<String>> {
        let Some(entry) = self.entries.get(name).map(|e| e.clone()) else {
            return Ok(HashSet::new());
        };

        let mut guard = entry.lock().await;
        guard.channel = None;
        let connection_name = guard.connection_name.clone();
        let channel = self.open_channel(&connection_name, connections).await?;
        guard.channel = Some(channel);
        Ok(guard.consumers.clone())
    }

    /// Removes the named channel entirely, closing it first if open.
    pub(crate) async fn remove(&self, name: &str) -> Result<()> {
        self.close(name).await?;
        self.entries.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_on_unknown_name_is_none() {
        let manager = ChannelManager::new(ChannelOptions::default());
        assert!(manager.get("default").await.is_none());
    }

    #[tokio::test]
    async fn remove_on_unknown_name_is_a_no_op() {
        let manager = ChannelManager::new(ChannelOptions::default());
        assert!(manager.remove("default").await.is_ok());
    }

    #[tokio::test]
    async fn contains_is_false_for_unknown_name() {
        let manager = ChannelManager::new(ChannelOptions::default());
        assert!(!manager.contains("publisher"));
    }

    #[tokio::test]
    async fn close_on_unknown_name_is_a_no_op() {
        let manager = ChannelManager::new(ChannelOptions::default());
        assert!(manager.close("publisher").await.is_ok());
    }
}
