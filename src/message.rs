//! The message data model: what goes out on `publish`, and what a handler receives on the way in.

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;
use crate::helpers::new_transaction_id;

/// Headers carried alongside a message's JSON payload.
///
/// These mirror the broker headers table, not the payload itself -- `event` lives inside the
/// payload (it's what [`crate::helpers::route_key_of`] extracts to resolve a route key), while
/// these describe the message's provenance and delivery history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Unique id assigned at publish time, used to correlate retries and error-queue entries.
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    /// When the message was first published.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Version string of the library that published the message.
    #[serde(rename = "libraryVersion")]
    pub library_version: String,
    /// Logical name of the publishing service, used for `validatePublisher` checks.
    pub source: Option<String>,
    /// The routing key the message was published with.
    #[serde(rename = "routeKey")]
    pub route_key: String,
    /// Number of times this message has been requeued.
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    /// When the message was most recently requeued, if ever.
    #[serde(rename = "requeuedAt")]
    pub requeued_at: Option<DateTime<Utc>>,
    /// When the message was routed to its error queue, if ever.
    #[serde(rename = "erroredAt")]
    pub errored_at: Option<DateTime<Utc>>,
    /// Arbitrary user-supplied headers, passed through unmodified.
    #[serde(flatten)]
    pub user_headers: HashMap<String, Value>,
}

impl MessageHeaders {
    /// Parses an inbound AMQP headers table into a [`MessageHeaders`], defaulting anything a
    /// foreign (non-library) publisher left out so every delivery ends up with a usable
    /// `transactionId`/`createdAt`, the same way the library's own publish path would have
    /// stamped them.
    pub(crate) fn from_field_table(table: Option<&FieldTable>, route_key: &str) -> Self {
        let mut headers = Self {
            transaction_id: new_transaction_id(),
            created_at: Utc::now(),
            library_version: crate::helpers::LIBRARY_VERSION.to_string(),
            route_key: route_key.to_string(),
            ..Self::default()
        };

        let Some(table) = table else {
            return headers;
        };

        for (key, value) in table.inner() {
            match (key.as_str(), value) {
                ("transactionId", AMQPValue::LongString(s)) => {
                    headers.transaction_id = s.to_string();
                }
                ("createdAt", AMQPValue::LongString(s)) => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(&s.to_string()) {
                        headers.created_at = parsed.with_timezone(&Utc);
                    }
                }
                ("libraryVersion", AMQPValue::LongString(s)) => {
                    headers.library_version = s.to_string();
                }
                ("source", AMQPValue::LongString(s)) => {
                    headers.source = Some(s.to_string());
                }
                ("retryCount", AMQPValue::LongLongInt(n)) => {
                    headers.retry_count = u32::try_from(*n).unwrap_or(0);
                }
                ("requeuedAt", AMQPValue::LongString(s)) => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(&s.to_string()) {
                        headers.requeued_at = Some(parsed.with_timezone(&Utc));
                    }
                }
                ("erroredAt", AMQPValue::LongString(s)) => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(&s.to_string()) {
                        headers.errored_at = Some(parsed.with_timezone(&Utc));
                    }
                }
                (other, AMQPValue::LongString(s)) => {
                    // User headers are encoded as JSON text so non-string values round-trip; a
                    // foreign publisher's plain string header falls back to itself when it isn't
                    // valid JSON.
                    let value = serde_json::from_str(&s.to_string())
                        .unwrap_or_else(|_| Value::String(s.to_string()));
                    headers.user_headers.insert(other.to_string(), value);
                }
                _ => {}
            }
        }

        headers
    }
}

/// A message ready to be published: a JSON payload plus the headers describing it.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub(crate) payload: Value,
    pub(crate) headers: MessageHeaders,
}

impl OutgoingMessage {
    /// Builds an outgoing message from any serializable payload.
    ///
    /// The payload must serialize to a JSON object with a string `event` field; this is checked
    /// lazily when the route key is resolved, not here, since callers may still want to attach
    /// headers to a message whose route key is supplied separately.
    pub fn new(payload: impl Serialize) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self {
            payload,
            headers: MessageHeaders::default(),
        })
    }

    /// Attaches a user header to the message.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        self.headers.user_headers.insert(key.into(), value);
        Ok(self)
    }

    /// Sets the logical publisher name recorded in the `source` header.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.headers.source = Some(source.into());
        self
    }
}

/// A message delivered to a handler: the decoded JSON payload, plus a typed accessor.
#[derive(Clone, Debug)]
pub struct DecodedMessage {
    pub(crate) payload: Value,
    pub(crate) headers: MessageHeaders,
}

impl DecodedMessage {
    /// Constructs a decoded message from its raw JSON payload and headers.
    pub(crate) fn new(payload: Value, headers: MessageHeaders) -> Self {
        Self { payload, headers }
    }

    /// Returns the message headers.
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Returns the raw JSON payload.
    pub fn raw(&self) -> &Value {
        &self.payload
    }

    /// Deserializes the payload into `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn decode_round_trips_typed_payload() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }

        let message = DecodedMessage::new(json!({ "id": 7 }), MessageHeaders::default());
        let order: Order = message.decode().unwrap();
        assert_eq!(order, Order { id: 7 });
    }

    #[tokio::test]
    async fn outgoing_message_carries_user_headers() {
        let message = OutgoingMessage::new(json!({ "event": "order.created" }))
            .unwrap()
            .with_header("tenant", "acme")
            .unwrap();

        assert_eq!(
            message.headers.user_headers.get("tenant"),
            Some(&json!("acme"))
        );
    }
}
