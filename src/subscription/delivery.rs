//! The `ack`/`reject`/`requeue` capability handed to handlers, and the drop-safety net that
//! guarantees every delivery is eventually resolved, even if a handler panics.
//!
//! An unresolved delivery is nacked with `requeue: true` when dropped, from a spawned task since
//! nacking is async and `Drop` isn't.

use std::mem;

use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicNackOptions, BasicPublishOptions,
};
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, Result};
use crate::helpers::{headers_for_error_queue, headers_for_requeue, headers_to_field_table};
use crate::message::MessageHeaders;

/// A delivered message's resolution capability: exactly one of `ack`, `reject`, or `requeue` must
/// be called, and calling none lets [`Drop`] nack-with-requeue on the caller's behalf.
#[must_use = "a delivery must be resolved with ack(), reject(...), or requeue()"]
pub struct Delivery {
    delivery: LapinDelivery,
    channel: Channel,
    resolved: bool,
    payload: Value,
    headers: MessageHeaders,
    queue: String,
    error_queue: String,
    max_retry_count: Option<u32>,
    auto_acknowledgement: bool,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        delivery: LapinDelivery,
        channel: Channel,
        payload: Value,
        headers: MessageHeaders,
        queue: String,
        error_queue: String,
        max_retry_count: Option<u32>,
        auto_acknowledgement: bool,
    ) -> Self {
        Self {
            delivery,
            channel,
            resolved: false,
            payload,
            headers,
            queue,
            error_queue,
            max_retry_count,
            auto_acknowledgement,
        }
    }

    /// Acknowledges the delivery, telling the broker it was handled successfully.
    ///
    /// A no-op against the broker when the queue was consumed with `autoAcknowledgement`, since
    /// the broker already considered the delivery acked the moment it was sent.
    ///
    /// # Errors
    /// Returns `Err` on network failures.
    pub async fn ack(mut self) -> Result<()> {
        self.ack_underlying().await?;
        self.resolved = true;
        Ok(())
    }

    /// Routes the original payload to the error queue with `erroredAt` and a reason header set,
    /// then acks the original delivery so it leaves the main queue.
    ///
    /// # Errors
    /// Returns `Err` on network failures.
    pub async fn reject(mut self, reason: impl Into<String>) -> Result<()> {
        self.publish_to_error_queue(reason.into()).await?;
        self.ack_underlying().await?;
        self.resolved = true;
        Ok(())
    }

    /// Republishes the payload to the original queue with `retryCount` incremented and
    /// `requeuedAt` stamped, then acks the original delivery. If `maxRetryCount` is configured and
    /// would be exceeded, this is equivalent to `reject("Exceeded max retry count")`.
    ///
    /// # Errors
    /// Returns `Err` on network failures.
    pub async fn requeue(mut self) -> Result<()> {
        let next_retry_count = self.headers.retry_count + 1;
        if let Some(max) = self.max_retry_count {
            if next_retry_count > max {
                return self.reject(DispatchError::MaxRetryCountExceeded.to_string()).await;
            }
        }

        let headers = headers_for_requeue(self.headers.clone());
        self.publish(&self.queue.clone(), headers).await?;
        self.ack_underlying().await?;
        self.resolved = true;
        Ok(())
    }

    async fn ack_underlying(&self) -> Result<()> {
        if self.auto_acknowledgement {
            return Ok(());
        }
        self.delivery
            .ack(BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn publish_to_error_queue(&self, reason: String) -> Result<()> {
        let mut headers = headers_for_error_queue(self.headers.clone());
        headers
            .user_headers
            .insert("reason".to_string(), Value::String(reason));
        let error_queue = self.error_queue.clone();
        self.publish(&error_queue, headers).await
    }

    /// Publishes directly to the named queue via the default exchange, the same way every queue
    /// is implicitly bound under its own name, rather than through the topic exchange (which only
    /// knows the handler event patterns, not the queue's own name).
    async fn publish(&self, routing_key: &str, headers: MessageHeaders) -> Result<()> {
        let body = serde_json::to_vec(&self.payload)?;
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers_to_field_table(&headers));

        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }
}

impl Drop for Delivery {
    /// An unresolved delivery is either a handler that forgot to call `ack`/`reject`/`requeue`, or
    /// one that panicked while holding it. The two are told apart with `thread::panicking()`: a
    /// panic is treated as an implicit `reject`, consistent with a handler that deliberately gave
    /// up on the message, while a plain oversight is nacked with `requeue: true` so the message
    /// isn't silently lost.
    fn drop(&mut self) {
        if self.resolved || self.auto_acknowledgement {
            return;
        }

        let acker = mem::take(&mut self.delivery.acker);
        let queue = self.queue.clone();

        if std::thread::panicking() {
            error!(queue = %queue, "handler panicked while holding an unresolved delivery, rejecting to the error queue");

            let channel = self.channel.clone();
            let error_queue = self.error_queue.clone();
            let body = serde_json::to_vec(&self.payload);
            let mut headers = headers_for_error_queue(self.headers.clone());
            let reason = DispatchError::Handler("handler panicked".to_string()).to_string();
            headers
                .user_headers
                .insert("reason".to_string(), Value::String(reason));

            tokio::spawn(async move {
                let body = match body {
                    Ok(body) => body,
                    Err(err) => {
                        error!(queue = %queue, error = %err, "failed to encode panicking delivery's payload");
                        return;
                    }
                };
                let properties = BasicProperties::default()
                    .with_content_type(ShortString::from("application/json"))
                    .with_headers(headers_to_field_table(&headers));

                if let Err(err) = channel
                    .basic_publish("", &error_queue, BasicPublishOptions::default(), &body, properties)
                    .await
                {
                    error!(queue = %queue, error = %err, "failed to publish panicking delivery to error queue");
                    return;
                }

                match acker.ack(BasicAckOptions { multiple: false }).await {
                    Ok(()) => debug!(queue = %queue, "acked delivery after handler panic"),
                    Err(err) => error!(queue = %queue, error = %err, "failed to ack delivery after handler panic"),
                }
            });
        } else {
            warn!(queue = %queue, "nacking unresolved delivery due to drop, requeueing");
            tokio::spawn(async move {
                match acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
                {
                    Ok(()) => debug!(queue = %queue, "nacked dropped delivery"),
                    Err(err) => error!(queue = %queue, error = %err, "failed to nack dropped delivery"),
                }
            });
        }

        self.resolved = true;
    }
}
