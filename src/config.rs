//! Crate-wide configuration: a `Default` baseline plus `with_*` builder methods, the same way
//! [`crate::SubscriptionOptions`] is built. Loading these values from a file or environment
//! variable remains the embedding application's job; this module only owns the defaults.

use std::time::Duration;

/// Connection-level options: everything needed to dial the broker.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Whether to connect over TLS.
    pub(crate) ssl: bool,
    /// AMQP username.
    pub(crate) user: String,
    /// AMQP password.
    pub(crate) password: String,
    /// Broker hostname.
    pub(crate) server: String,
    /// Broker port.
    pub(crate) port: u16,
    /// AMQP virtual host.
    pub(crate) vhost: String,
    /// Heartbeat interval, in milliseconds.
    pub(crate) heartbeat: u32,
}

impl ConnectionOptions {
    /// Creates connection options pointing at `server:port` with the given credentials.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets whether to connect over TLS. Defaults to `false`.
    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Sets the AMQP credentials. Defaults to `guest`/`guest`.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Sets the AMQP virtual host. Defaults to `%2f` (the default vhost, URL-encoded).
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Sets the heartbeat interval. Defaults to 2000ms.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = u32::try_from(heartbeat.as_millis()).unwrap_or(u32::MAX);
        self
    }

    /// Builds the AMQP connection URI for these options.
    pub(crate) fn uri(&self) -> String {
        let scheme = if self.ssl { "amqps" } else { "amqp" };
        format!(
            "{scheme}://{user}:{password}@{server}:{port}/{vhost}",
            scheme = scheme,
            user = self.user,
            password = self.password,
            server = self.server,
            port = self.port,
            vhost = self.vhost,
        )
    }

    /// Returns the configured heartbeat as a [`Duration`].
    pub(crate) fn heartbeat_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.heartbeat))
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ssl: false,
            user: "guest".to_string(),
            password: "guest".to_string(),
            server: "localhost".to_string(),
            port: 5672,
            vhost: "%2f".to_string(),
            heartbeat: 2000,
        }
    }
}

/// Channel-level options: prefetch and default exchange.
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Prefetch (QoS) limit applied to every consumer opened on the channel.
    pub(crate) limit: u16,
    /// Default exchange to assert/publish against.
    pub(crate) global_exchange: String,
}

impl ChannelOptions {
    /// Sets the prefetch limit. Defaults to 5.
    pub fn with_limit(mut self, limit: u16) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the global (topic) exchange name. Defaults to `"default-exchange"`.
    pub fn with_global_exchange(mut self, global_exchange: impl Into<String>) -> Self {
        self.global_exchange = global_exchange.into();
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            limit: 5,
            global_exchange: "default-exchange".to_string(),
        }
    }
}

/// Top-level facade configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Options used to dial the broker.
    pub(crate) connection: ConnectionOptions,
    /// Options used when opening channels.
    pub(crate) channel: ChannelOptions,
    /// Whether the broker auto-acknowledges deliveries (skips explicit acks when a handler calls
    /// `ack()` itself, to avoid double-acking).
    pub(crate) auto_acknowledgement: bool,
    /// Suffix appended to a queue's name to build its error queue name.
    pub(crate) error_queue_suffix: String,
    /// If true, suppress non-essential `tracing` output.
    pub(crate) silence: bool,
    /// Optional ceiling on `retryCount` before a requeue is treated as a reject.
    pub(crate) max_retry_count: Option<u32>,
    /// Whether to validate the `source` header of incoming messages against a known publisher list.
    pub(crate) validate_publisher: bool,
    /// Ordered partition-key selector templates, e.g. `"{message.serialNumber}"`.
    pub(crate) serial_dispatch_partition_key_selectors: Vec<String>,
    /// Number of retries attempted by the Connection Manager before giving up.
    pub(crate) connection_retry_count: u32,
}

impl Config {
    /// Creates a new config with the given connection options and otherwise-default settings.
    pub fn new(connection: ConnectionOptions) -> Self {
        Self {
            connection,
            ..Self::default_with(ConnectionOptions::default())
        }
    }

    fn default_with(connection: ConnectionOptions) -> Self {
        Self {
            connection,
            channel: ChannelOptions::default(),
            auto_acknowledgement: false,
            error_queue_suffix: "_error".to_string(),
            silence: false,
            max_retry_count: None,
            validate_publisher: false,
            serial_dispatch_partition_key_selectors: Vec::new(),
            connection_retry_count: 2,
        }
    }

    /// Overrides the channel options (prefetch limit, global exchange).
    pub fn with_channel_options(mut self, channel: ChannelOptions) -> Self {
        self.channel = channel;
        self
    }

    /// Sets whether the broker is configured for auto-acknowledgement. Defaults to `false`.
    pub fn with_auto_acknowledgement(mut self, auto_acknowledgement: bool) -> Self {
        self.auto_acknowledgement = auto_acknowledgement;
        self
    }

    /// Sets the error queue suffix. Defaults to `"_error"`.
    pub fn with_error_queue_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.error_queue_suffix = suffix.into();
        self
    }

    /// Sets the maximum retry count before a requeue becomes a reject. Unset by default.
    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = Some(max_retry_count);
        self
    }

    /// Sets whether to validate the `source` header of incoming messages. Defaults to `false`.
    pub fn with_validate_publisher(mut self, validate_publisher: bool) -> Self {
        self.validate_publisher = validate_publisher;
        self
    }

    /// Sets the ordered partition-key selector templates used by the partition dispatcher.
    pub fn with_partition_key_selectors(mut self, selectors: Vec<String>) -> Self {
        self.serial_dispatch_partition_key_selectors = selectors;
        self
    }

    /// Sets the number of connection creation retries. Defaults to 2.
    pub fn with_connection_retry_count(mut self, connection_retry_count: u32) -> Self {
        self.connection_retry_count = connection_retry_count;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_with(ConnectionOptions::default())
    }
}
