//! The Connection Manager: a named registry of AMQP connections, opened idempotently and
//! recreated with a bounded retry budget.
//!
//! A concurrent map from name to a per-name lock guards lazily-created state, the same shape used
//! by the channel registry and the partition dispatcher's per-key queues, just guarding a
//! `lapin::Connection` instead.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};

/// Delay between connection creation retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the broker-initiated-close notification channel. One slot per concurrently
/// recovering connection is plenty; a slow coordinator simply coalesces bursts of the same name.
const LOST_CAPACITY: usize = 16;

struct ConnectionEntry {
    options: ConnectionOptions,
    connection: Option<Arc<Connection>>,
}

/// Owns named AMQP connections.
pub(crate) struct ConnectionManager {
    entries: DashMap<String, Arc<Mutex<ConnectionEntry>>>,
    events: EventBus,
    retry_count: u32,
    lost: broadcast::Sender<String>,
}

impl ConnectionManager {
    pub(crate) fn new(events: EventBus, retry_count: u32) -> Self {
        let (lost, _) = broadcast::channel(LOST_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            retry_count,
            lost,
        }
    }

    /// Subscribes to broker-initiated connection closes: each closed connection's name is sent
    /// once its `on_error` callback fires. Driven by the facade's recovery coordinator.
    pub(crate) fn subscribe_lost(&self) -> broadcast::Receiver<String> {
        self.lost.subscribe()
    }

    /// Creates (or returns, if already open) the named connection.
    ///
    /// If an entry already exists for `name` but has no live connection (e.g. after [`Self::close`]),
    /// this reconnects using the options it was originally created with; `options` may be omitted
    /// in that case. Omitting `options` for a name that has never been created fails synchronously
    /// with [`Error::MissingConnectionOptions`].
    pub(crate) async fn create(&self, name: &str, options: Option<ConnectionOptions>) -> Result<()> {
        let entry = match self.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let options = options.clone().ok_or(Error::MissingConnectionOptions)?;
                let entry = Arc::new(Mutex::new(ConnectionEntry {
                    options,
                    connection: None,
                }));
                vacant.insert(entry.clone());
                entry
            }
        };

        let mut guard = entry.lock().await;
        if guard.connection.is_some() {
            return Ok(());
        }

        if let Some(options) = options {
            guard.options = options;
        }
        let connection = self.connect_with_retry(name, &guard.options).await?;
        guard.connection = Some(Arc::new(connection));
        Ok(())
    }

    async fn connect_with_retry(&self, name: &str, options: &ConnectionOptions) -> Result<Connection> {
        let uri = options.uri();
        let properties = ConnectionProperties::default();
        let attempt_timeout = options.heartbeat_duration();

        let retries = self.retry_count;
        let mut attempt = 0;
        loop {
            debug!(connection_name = %name, attempt, "connecting to AMQP broker");
            let outcome = match tokio::time::timeout(attempt_timeout, Connection::connect(&uri, properties.clone())).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    warn!(connection_name = %name, attempt, timeout = ?attempt_timeout, "connection attempt timed out");
                    if attempt < retries {
                        attempt += 1;
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    error!(connection_name = %name, attempts = attempt + 1, "exhausted connection retries after repeated timeouts");
                    self.events.emit(Event::RecoveryFailed {
                        connection_name: name.to_string(),
                    });
                    return Err(Error::ConnectionRetry);
                }
            };

            match outcome {
                Ok(connection) => {
                    info!(connection_name = %name, "connected to AMQP broker");
                    let lost = self.lost.clone();
                    let watched_name = name.to_string();
                    connection.on_error(move |err| {
                        warn!(connection_name = %watched_name, error = %err, "connection reported an error");
                        let _ = lost.send(watched_name.clone());
                    });
                    return Ok(connection);
                }
                Err(err) if attempt < retries => {
                    warn!(connection_name = %name, attempt, error = %err, "connection attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(connection_name = %name, attempts = attempt + 1, error = %err, "exhausted connection retries");
                    self.events.emit(Event::RecoveryFailed {
                        connection_name: name.to_string(),
                    });
                    return Err(Error::ConnectionRetry);
                }
            }
        }
    }

    /// Returns whether a connection entry exists for `name` (regardless of whether it is
    /// currently open).
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the live `lapin::Connection` for `name`, if one is open.
    pub(crate) async fn get(&self, name: &str) -> Option<Arc<Connection>> {
        let entry = self.entries.get(name)?.clone();
        let guard = entry.lock().await;
        guard.connection.clone()
    }

    /// Closes the named connection, if open. The descriptor (options) is preserved so a later
    /// [`Self::create`] call reconnects without needing the options again.
    pub(crate) async fn close(&self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.get(name).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut guard = entry.lock().await;
        if let Some(connection) = guard.connection.take() {
            connection.close(200, "closed by application").await?;
        }
        Ok(())
    }

    /// Removes the named connection entirely, closing it first if open.
    pub(crate) async fn remove(&self, name: &str) -> Result<()> {
        self.close(name).await?;
        self.entries.remove(name);
        Ok(())
    }

    /// Re-establishes the named connection after a broker-initiated close, emitting
    /// `recovering`/`recovered`/`recovery.failed` events around the attempt.
    pub(crate) async fn recover(&self, name: &str) -> Result<()> {
        let Some(entry) = self.entries.get(name).map(|e| e.clone()) else {
            return Ok(());
        };

        self.events.emit(Event::Recovering {
            connection_name: name.to_string(),
        });

        let mut guard = entry.lock().await;
        guard.connection = None;
        let options = guard.options.clone();
        match self.connect_with_retry(name, &options).await {
            Ok(connection) => {
                guard.connection = Some(Arc::new(connection));
                self.events.emit(Event::Recovered {
                    connection_name: name.to_string(),
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contains_is_false_for_unknown_name() {
        let manager = ConnectionManager::new(EventBus::new(), 2);
        assert!(!manager.contains("default"));
    }

    #[tokio::test]
    async fn remove_on_unknown_name_is_a_no_op() {
        let manager = ConnectionManager::new(EventBus::new(), 2);
        assert!(manager.remove("default").await.is_ok());
    }

    #[tokio::test]
    async fn create_without_options_for_an_unknown_name_fails_synchronously() {
        let manager = ConnectionManager::new(EventBus::new(), 2);
        let result = manager.create("default", None).await;
        assert!(matches!(result, Err(Error::MissingConnectionOptions)));
    }
}
