//! Free functions shared by the managers and the facade: header construction, routing-key
//! derivation, payload encode/decode, and partition-key template resolution.

use chrono::Utc;
use lapin::types::{AMQPValue, FieldTable};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DispatchError, Error};
use crate::message::{MessageHeaders, OutgoingMessage};

/// The library version string stamped onto every outgoing message's `libraryVersion` header.
pub(crate) const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Generates a fresh transaction id.
pub(crate) fn new_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// Finalizes an [`OutgoingMessage`]'s headers ahead of publish: stamps `transactionId`,
/// `createdAt`, `libraryVersion` and the resolved `routeKey`.
pub(crate) fn finalize_headers(message: &mut OutgoingMessage, route_key: String) {
    message.headers.transaction_id = new_transaction_id();
    message.headers.created_at = Utc::now();
    message.headers.library_version = LIBRARY_VERSION.to_string();
    message.headers.route_key = route_key;
}

/// Extracts the routing key from a JSON payload: the `event` field, which must be a non-empty
/// string.
pub(crate) fn route_key_of(payload: &Value) -> Result<String, Error> {
    payload
        .get("event")
        .and_then(Value::as_str)
        .filter(|event| !event.is_empty())
        .map(str::to_string)
        .ok_or(Error::NoRouteKey)
}

/// Extracts the routing key from a delivered payload, for use inside the dispatch loop where a
/// missing or malformed `event` field is a per-message [`DispatchError`], not a facade-level
/// [`Error`].
pub(crate) fn dispatch_route_key_of(payload: &Value) -> Result<String, DispatchError> {
    payload
        .get("event")
        .and_then(Value::as_str)
        .filter(|event| !event.is_empty())
        .map(str::to_string)
        .ok_or(DispatchError::MissingEvent)
}

/// Builds a new [`MessageHeaders`] for a requeue: increments `retryCount` and stamps
/// `requeuedAt`.
pub(crate) fn headers_for_requeue(mut headers: MessageHeaders) -> MessageHeaders {
    headers.retry_count += 1;
    headers.requeued_at = Some(Utc::now());
    headers
}

/// Builds a new [`MessageHeaders`] for a reject into the error queue: stamps `erroredAt`.
pub(crate) fn headers_for_error_queue(mut headers: MessageHeaders) -> MessageHeaders {
    headers.errored_at = Some(Utc::now());
    headers
}

/// Encodes [`MessageHeaders`] into the AMQP headers table shape used on the wire.
pub(crate) fn headers_to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        "transactionId".into(),
        AMQPValue::LongString(headers.transaction_id.clone().into()),
    );
    table.insert(
        "createdAt".into(),
        AMQPValue::LongString(headers.created_at.to_rfc3339().into()),
    );
    table.insert(
        "libraryVersion".into(),
        AMQPValue::LongString(headers.library_version.clone().into()),
    );
    table.insert(
        "routeKey".into(),
        AMQPValue::LongString(headers.route_key.clone().into()),
    );
    table.insert(
        "retryCount".into(),
        AMQPValue::LongLongInt(i64::from(headers.retry_count)),
    );
    if let Some(source) = &headers.source {
        table.insert("source".into(), AMQPValue::LongString(source.clone().into()));
    }
    if let Some(requeued_at) = &headers.requeued_at {
        table.insert(
            "requeuedAt".into(),
            AMQPValue::LongString(requeued_at.to_rfc3339().into()),
        );
    }
    if let Some(errored_at) = &headers.errored_at {
        table.insert(
            "erroredAt".into(),
            AMQPValue::LongString(errored_at.to_rfc3339().into()),
        );
    }
    for (key, value) in &headers.user_headers {
        // Encoded as JSON text rather than restricted to `AMQPValue::LongString` so non-string
        // headers (numbers, bools, nested objects) survive the round trip instead of being
        // silently dropped.
        if let Ok(encoded) = serde_json::to_string(value) {
            table.insert(key.as_str().into(), AMQPValue::LongString(encoded.into()));
        }
    }
    table
}

/// Resolves a partition key for serial dispatch by trying each selector template in order against
/// the decoded payload, falling back to `"default"` if none resolve.
///
/// A selector is a template like `"{message.orderId}"`: the braces are stripped and the remaining
/// dotted path is walked through the JSON payload. A selector resolves only if the path leads to a
/// JSON string, number, or bool; anything else (missing field, object, array, null) is treated as
/// a miss and the next selector is tried.
pub(crate) fn resolve_partition_key(payload: &Value, selectors: &[String]) -> String {
    for selector in selectors {
        let path = selector.trim_start_matches('{').trim_end_matches('}');
        if let Some(value) = walk_path(payload, path) {
            if let Some(resolved) = scalar_to_string(value) {
                return resolved;
            }
        }
    }
    "default".to_string()
}

fn walk_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| {
        if segment.is_empty() {
            Some(current)
        } else {
            current.get(segment)
        }
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_key_of_extracts_event_field() {
        let payload = json!({ "event": "order.created" });
        assert_eq!(route_key_of(&payload).unwrap(), "order.created");
    }

    #[test]
    fn route_key_of_rejects_missing_event() {
        let payload = json!({ "foo": "bar" });
        assert!(matches!(route_key_of(&payload), Err(Error::NoRouteKey)));
    }

    #[test]
    fn route_key_of_rejects_empty_event() {
        let payload = json!({ "event": "" });
        assert!(matches!(route_key_of(&payload), Err(Error::NoRouteKey)));
    }

    #[test]
    fn dispatch_route_key_of_rejects_missing_event() {
        let payload = json!({});
        assert!(matches!(
            dispatch_route_key_of(&payload),
            Err(DispatchError::MissingEvent)
        ));
    }

    #[test]
    fn resolve_partition_key_walks_nested_path() {
        let payload = json!({ "message": { "orderId": "abc-123" } });
        let selectors = vec!["{message.orderId}".to_string()];
        assert_eq!(resolve_partition_key(&payload, &selectors), "abc-123");
    }

    #[test]
    fn resolve_partition_key_falls_back_through_selectors() {
        let payload = json!({ "message": { "customerId": "c-1" } });
        let selectors = vec![
            "{message.orderId}".to_string(),
            "{message.customerId}".to_string(),
        ];
        assert_eq!(resolve_partition_key(&payload, &selectors), "c-1");
    }

    #[test]
    fn resolve_partition_key_defaults_when_nothing_resolves() {
        let payload = json!({ "message": {} });
        let selectors = vec!["{message.orderId}".to_string()];
        assert_eq!(resolve_partition_key(&payload, &selectors), "default");
    }

    #[test]
    fn resolve_partition_key_with_no_selectors_defaults() {
        let payload = json!({ "message": { "orderId": "abc" } });
        assert_eq!(resolve_partition_key(&payload, &[]), "default");
    }

    #[test]
    fn headers_to_field_table_preserves_non_string_user_headers() {
        let mut headers = MessageHeaders::default();
        headers.user_headers.insert("count".to_string(), json!(5));
        headers.user_headers.insert("tenant".to_string(), json!("acme"));

        let table = headers_to_field_table(&headers);
        let decoded = MessageHeaders::from_field_table(Some(&table), "order.created");

        assert_eq!(decoded.user_headers.get("count"), Some(&json!(5)));
        assert_eq!(decoded.user_headers.get("tenant"), Some(&json!("acme")));
    }
}
