//! Error taxonomy, partitioned the way the source broker calls are partitioned: configuration
//! errors caught synchronously, transport errors recovered underneath the caller, subscription
//! errors surfaced to the caller, and per-message errors that never escape the dispatch loop.

use thiserror::Error as ThisError;

/// Errors that may be returned by the public facade API.
#[derive(Debug, ThisError)]
pub enum Error {
    /// `publish` was called with a message that has no resolvable routing key.
    #[error("Could not determine a route key for the message (expected a non-empty `event`)")]
    NoRouteKey,

    /// A manager `create` call was made without the required options.
    #[error("Expected connectionOptions to be supplied")]
    MissingConnectionOptions,

    /// Connection (re)establishment exhausted its retry budget.
    #[error("Exceeded maximum attempts of retries")]
    ConnectionRetry,

    /// `subscribe` was called for a queue that already has an active subscription.
    #[error("A subscription for queue {0:?} already exists")]
    SubscriptionExist(String),

    /// `subscribe` was called for a queue that has been blocked.
    #[error("Queue {0:?} is blocked and cannot be subscribed to")]
    SubscriptionBlocked(String),

    /// An underlying `lapin` call failed.
    #[error("An underlying `lapin` call failed: {0}")]
    Lapin(#[from] lapin::Error),

    /// The message payload could not be serialized/deserialized as JSON.
    #[error("Could not decode JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Convenience alias for a result with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of resolving a delivered message to a handler and letting it run.
///
/// Unlike [`Error`], a [`DispatchError`] never propagates out of the consume loop: it is always
/// translated into a reject, requeue, or log line, matching the rule that per-message failures
/// never kill the consumer.
#[derive(Debug, ThisError)]
pub enum DispatchError {
    /// The payload was not valid JSON.
    #[error("Could not decode JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The decoded payload had no `event` field to route on.
    #[error("Message has no `event` field to route on")]
    MissingEvent,

    /// No handler was registered for the resolved routing key.
    #[error("No handler found")]
    NoHandlerFound,

    /// The configured `maxRetryCount` was exceeded.
    #[error("Exceeded max retry count")]
    MaxRetryCountExceeded,

    /// The handler itself returned or panicked with an error. The reason is whatever the handler
    /// chose to report.
    #[error("Handler failed: {0}")]
    Handler(String),
}
