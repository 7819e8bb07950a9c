//! End-to-end scenarios driven through the public facade against a real broker.
//!
//! These need a live AMQP broker reachable with the default configuration (`amqp://guest:guest@
//! localhost:5672/%2f`) and are skipped by default, the same way the storage layer's own
//! service-backed tests are.
//!
//! Run with: `cargo test --ignored -- --test-threads=1`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn collecting_handler(tx: mpsc::UnboundedSender<DecodedMessage>) -> Handler {
    Arc::new(move |message, handle| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(message);
            let _ = handle.ack().await;
        })
    })
}

/// Requeues once (to exercise `retryCount`), then hands the second delivery off.
fn requeue_once_then_collect(tx: mpsc::UnboundedSender<DecodedMessage>) -> Handler {
    Arc::new(move |message, handle| {
        let tx = tx.clone();
        Box::pin(async move {
            if message.headers().retry_count == 0 {
                let _ = handle.requeue().await;
            } else {
                let _ = tx.send(message);
                let _ = handle.ack().await;
            }
        })
    })
}

#[tokio::test]
#[ignore]
async fn publish_and_subscribe_round_trip_with_wildcard_pattern() {
    let facade = BrokerFacade::connect(Config::default()).await.unwrap();
    let queue = "scenario.orders";
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handlers = HashMap::new();
    handlers.insert("order.*".to_string(), collecting_handler(tx));
    facade.subscribe(queue, handlers).await.unwrap();

    let message = OutgoingMessage::new(json!({ "event": "order.created", "orderId": "abc-123" })).unwrap();
    facade.publish(message).await.unwrap();

    let received = timeout(RECEIVE_TIMEOUT, rx.recv())
        .await
        .expect("handler should receive the published message")
        .expect("sender should not have been dropped");

    assert_eq!(received.raw()["orderId"].as_str(), Some("abc-123"));
    assert_eq!(received.headers().route_key, "order.created");

    facade.unsubscribe(queue).await.unwrap();
    facade.delete_queue(queue).await.unwrap();
    facade.delete_queue("scenario.orders_error").await.unwrap();
    facade.stop().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn requeue_increments_retry_count_before_redelivery() {
    let facade = BrokerFacade::connect(Config::default()).await.unwrap();
    let queue = "scenario.requeue";
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handlers = HashMap::new();
    handlers.insert("order.created".to_string(), requeue_once_then_collect(tx));
    facade.subscribe(queue, handlers).await.unwrap();

    let message = OutgoingMessage::new(json!({ "event": "order.created" })).unwrap();
    facade.publish(message).await.unwrap();

    let received = timeout(RECEIVE_TIMEOUT, rx.recv())
        .await
        .expect("handler should eventually receive the requeued delivery")
        .expect("sender should not have been dropped");

    assert_eq!(received.headers().retry_count, 1);
    assert!(received.headers().requeued_at.is_some());

    facade.unsubscribe(queue).await.unwrap();
    facade.delete_queue(queue).await.unwrap();
    facade.delete_queue("scenario.requeue_error").await.unwrap();
    facade.stop().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn subscribing_twice_to_the_same_queue_fails() {
    let facade = BrokerFacade::connect(Config::default()).await.unwrap();
    let queue = "scenario.duplicate";

    facade.subscribe(queue, HashMap::new()).await.unwrap();
    let second = facade.subscribe(queue, HashMap::new()).await;

    assert!(matches!(second, Err(Error::SubscriptionExist(name)) if name == queue));

    facade.unsubscribe(queue).await.unwrap();
    facade.delete_queue(queue).await.unwrap();
    facade.delete_queue("scenario.duplicate_error").await.unwrap();
    facade.stop().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn internal_requeue_helper_republishes_directly_to_the_queue() {
    let facade = BrokerFacade::connect(Config::default()).await.unwrap();
    let queue = "scenario.requeue.target";
    facade.create_queue(queue).await.unwrap();

    let message = DecodedMessage::new(
        json!({ "event": "order.created", "orderId": "xyz" }),
        MessageHeaders::default(),
    );
    facade.requeue(&message, "publisher", queue).await.unwrap();

    let redelivered = timeout(RECEIVE_TIMEOUT, async {
        loop {
            if let Some(found) = facade.get(queue).await.unwrap() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the requeued message should be retrievable via basic.get");

    assert_eq!(redelivered.raw()["orderId"].as_str(), Some("xyz"));
    assert_eq!(redelivered.headers().retry_count, 1);
    assert!(redelivered.headers().requeued_at.is_some());

    facade.delete_queue(queue).await.unwrap();
    facade.stop().await.unwrap();
}
