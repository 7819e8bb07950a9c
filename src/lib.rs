//! # warren
//!
//! An opinionated publish/subscribe facade over AMQP 0-9-1, built on top of
//! [lapin](https://github.com/amqp-rs/lapin).
//!
//! warren gives you durable topic-exchange pub/sub with JSON payloads, automatic error-queue
//! routing, connection recovery, and per-partition-key serial dispatch, so your service code only
//! has to write handlers.

// warren is 100% Safe Rust.
#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    unused_crate_dependencies,
    clippy::as_conversions,
)]

// Re-exporting underlying lapin version so you don't have to add the same version as a dependency.
pub use lapin;

mod channel;
pub mod config;
mod connection;
mod dispatcher;
pub mod error;
pub mod events;
mod facade;
mod helpers;
pub mod message;
pub mod subscription;

pub use config::{ChannelOptions, ConnectionOptions, Config};
pub use error::{DispatchError, Error, Result};
pub use events::Event;
pub use facade::BrokerFacade;
pub use message::{DecodedMessage, MessageHeaders, OutgoingMessage};
pub use subscription::delivery::Delivery;
pub use subscription::{Handler, SubscriptionOptions};

#[cfg(test)]
mod tests {
    pub use super::*;

    mod scenarios;
}
