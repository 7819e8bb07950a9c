//! The Broker Facade: the public API surface of the crate, orchestrating the managers defined in
//! [`crate::connection`], [`crate::channel`], [`crate::subscription`], and [`crate::dispatcher`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::ChannelManager;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::dispatcher::PartitionDispatcher;
use crate::error::{DispatchError, Error, Result};
use crate::events::{Event, EventBus};
use crate::helpers::{
    dispatch_route_key_of, finalize_headers, headers_for_requeue, headers_to_field_table,
    resolve_partition_key, route_key_of,
};
use crate::message::{DecodedMessage, MessageHeaders, OutgoingMessage};
use crate::subscription::delivery::Delivery;
use crate::subscription::{Handler, SubscriptionManager, SubscriptionOptions};

const DEFAULT_CONNECTION: &str = "default";
const PUBLISHER_CHANNEL: &str = "publisher";

fn subscriber_channel_name(queue: &str) -> String {
    format!("subscribe:{queue}")
}

/// The opinionated publish/subscribe facade over AMQP 0-9-1.
///
/// Construct one with [`BrokerFacade::connect`], subscribe and publish through it, and call
/// [`BrokerFacade::stop`] to drain and close it down.
pub struct BrokerFacade {
    config: Config,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<PartitionDispatcher>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
}

impl BrokerFacade {
    /// Connects to the broker described by `config`, opening the default connection and the
    /// shared publisher channel.
    pub async fn connect(config: Config) -> Result<Self> {
        let events = EventBus::new();
        let connections = Arc::new(ConnectionManager::new(
            events.clone(),
            config.connection_retry_count,
        ));
        connections
            .create(DEFAULT_CONNECTION, Some(config.connection.clone()))
            .await?;

        let channels = Arc::new(ChannelManager::new(config.channel.clone()));
        channels
            .create(PUBLISHER_CHANNEL, DEFAULT_CONNECTION, &connections)
            .await?;

        let subscriptions = Arc::new(SubscriptionManager::new(events.clone()));
        let dispatcher = Arc::new(PartitionDispatcher::new());
        let shutdown = broadcast::channel(1).0;

        let facade = Self {
            subscriptions,
            dispatcher,
            connections,
            channels,
            config,
            events,
            shutdown,
        };

        facade.assert_global_exchange().await?;
        facade.spawn_recovery_coordinator();
        Ok(facade)
    }

    /// Watches for broker-initiated connection closes and drives the recovery described in
    /// [`Self::recover_connection`], for as long as the facade itself lives.
    fn spawn_recovery_coordinator(&self) {
        let lost = self.connections.subscribe_lost();
        let connections = self.connections.clone();
        let channels = self.channels.clone();
        let subscriptions = self.subscriptions.clone();
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(recovery_coordinator(
            lost,
            connections,
            channels,
            subscriptions,
            dispatcher,
            config,
            events,
            shutdown,
        ));
    }

    async fn publisher_channel(&self) -> Channel {
        self.channels
            .get(PUBLISHER_CHANNEL)
            .await
            .expect("publisher channel must exist after connect()")
    }

    async fn assert_global_exchange(&self) -> Result<()> {
        self.publisher_channel()
            .await
            .exchange_declare(
                &self.config.channel.global_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Subscribes to this facade's lifecycle event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Publishes `message` to the global topic exchange, routed by its payload's `event` field.
    pub async fn publish(&self, mut message: OutgoingMessage) -> Result<()> {
        let route_key = route_key_of(&message.payload)?;
        finalize_headers(&mut message, route_key.clone());

        self.publish_raw(
            &self.config.channel.global_exchange.clone(),
            &route_key,
            &message,
        )
        .await?;

        self.events.emit(Event::MessagePublished { route_key });
        Ok(())
    }

    /// Publishes `message` directly to `queue_name`, bypassing the topic exchange.
    pub async fn send(&self, mut message: OutgoingMessage, queue_name: &str) -> Result<()> {
        finalize_headers(&mut message, queue_name.to_string());
        self.publish_raw("", queue_name, &message).await?;
        self.events.emit(Event::MessagePublished {
            route_key: queue_name.to_string(),
        });
        Ok(())
    }

    async fn publish_raw(&self, exchange: &str, routing_key: &str, message: &OutgoingMessage) -> Result<()> {
        use lapin::options::BasicPublishOptions;
        use lapin::types::ShortString;
        use lapin::BasicProperties;

        let body = serde_json::to_vec(&message.payload)?;
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers_to_field_table(&message.headers));

        self.publisher_channel()
            .await
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }

    /// Republishes `message` to `queue_name` via `channel_name`'s channel, re-establishing the
    /// channel (and its connection) transparently if either was closed since the message was
    /// received. Exposed for testing the requeue step in isolation from a live subscription.
    #[allow(dead_code)]
    pub(crate) async fn requeue(
        &self,
        message: &DecodedMessage,
        channel_name: &str,
        queue_name: &str,
    ) -> Result<()> {
        use lapin::options::BasicPublishOptions;
        use lapin::types::ShortString;
        use lapin::BasicProperties;

        if self.channels.get(channel_name).await.is_none() {
            self.channels
                .create(channel_name, DEFAULT_CONNECTION, &self.connections)
                .await?;
        }
        let channel = self
            .channels
            .get(channel_name)
            .await
            .expect("channel just ensured");

        let headers = headers_for_requeue(message.headers.clone());
        let body = serde_json::to_vec(&message.payload)?;
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers_to_field_table(&headers));

        channel
            .basic_publish(
                "",
                queue_name,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }

    /// Subscribes to `queue`, routing deliveries whose `event` matches a key in `handlers` (exact
    /// match first, then best-matching wildcard pattern) to that handler.
    pub async fn subscribe(&self, queue: impl Into<String>, handlers: HashMap<String, Handler>) -> Result<()> {
        self.subscribe_with_options(queue, handlers, SubscriptionOptions::default())
            .await
    }

    /// As [`Self::subscribe`], with explicit per-queue options (`maxRetryCount`,
    /// `validatePublisher`).
    pub async fn subscribe_with_options(
        &self,
        queue: impl Into<String>,
        handlers: HashMap<String, Handler>,
        options: SubscriptionOptions,
    ) -> Result<()> {
        let queue = queue.into();

        if self.subscriptions.is_blocked(&queue) {
            return Err(Error::SubscriptionBlocked(queue));
        }
        if !self.subscriptions.create(queue.clone(), handlers, options.clone()) {
            return Err(Error::SubscriptionExist(queue));
        }

        let channel_name = subscriber_channel_name(&queue);
        self.channels
            .create(&channel_name, DEFAULT_CONNECTION, &self.connections)
            .await?;
        let channel = self
            .channels
            .get(&channel_name)
            .await
            .expect("channel was just created");

        self.assert_global_exchange().await?;

        let error_queue = format!("{queue}{}", self.config.error_queue_suffix);
        let binding_keys: Vec<String> = self
            .subscriptions
            .get(&queue)
            .map(|sub| sub.handlers.keys().cloned().collect())
            .unwrap_or_default();

        let consumer_tag = format!("{queue}-consumer");
        let consumer = declare_bind_and_consume(
            &channel,
            &queue,
            &error_queue,
            &self.config.channel.global_exchange,
            &binding_keys,
            &consumer_tag,
            self.config.auto_acknowledgement,
        )
        .await?;

        self.subscriptions.tag(&queue, consumer_tag.clone());
        self.channels.add_consumer(&channel_name, consumer_tag).await;
        self.events.emit(Event::QueueSubscribed {
            queue_name: queue.clone(),
        });

        let dispatcher = self.dispatcher.clone();
        let subscriptions = self.subscriptions.clone();
        let config = self.config.clone();
        let queue_for_loop = queue.clone();
        let channel_for_loop = channel.clone();
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            consume_loop(
                queue_for_loop,
                error_queue,
                consumer,
                channel_for_loop,
                dispatcher,
                subscriptions,
                config,
                shutdown,
            )
            .await;
        });

        Ok(())
    }

    /// Cancels the broker consumer for `queue` and forgets it. A no-op if not subscribed.
    pub async fn unsubscribe(&self, queue: &str) -> Result<()> {
        let Some(subscription) = self.subscriptions.get(queue) else {
            return Ok(());
        };
        let channel_name = subscriber_channel_name(queue);

        if let Some(consumer_tag) = subscription.consumer_tag {
            if let Some(channel) = self.channels.get(&channel_name).await {
                channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await?;
            }
            self.channels.remove_consumer(&channel_name, &consumer_tag).await;
        }

        self.subscriptions.clear(queue);
        self.events.emit(Event::QueueUnsubscribed {
            queue_name: queue.to_string(),
        });
        Ok(())
    }

    /// Fetches a single message from `queue` via `basic.get`, bypassing any active subscription.
    pub async fn get(&self, queue: &str) -> Result<Option<DecodedMessage>> {
        let channel = self.publisher_channel().await;
        let Some(get_message) = channel.basic_get(queue, BasicGetOptions::default()).await? else {
            return Ok(None);
        };
        let payload: serde_json::Value = serde_json::from_slice(&get_message.data)?;
        let route_key = dispatch_route_key_of(&payload).unwrap_or_default();
        let headers = MessageHeaders::from_field_table(get_message.properties.headers().as_ref(), &route_key);
        get_message
            .ack(lapin::options::BasicAckOptions::default())
            .await?;
        Ok(Some(DecodedMessage::new(payload, headers)))
    }

    /// Declares an exchange of the given kind.
    pub async fn create_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.publisher_channel()
            .await
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.publisher_channel()
            .await
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    /// Declares a durable queue.
    pub async fn create_queue(&self, name: &str) -> Result<()> {
        self.publisher_channel()
            .await
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Deletes a queue.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.publisher_channel()
            .await
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    /// Purges all messages from a queue.
    pub async fn purge_queue(&self, name: &str) -> Result<()> {
        self.publisher_channel()
            .await
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        Ok(())
    }

    /// Asserts that a queue exists, declaring it as durable if not (`basic.declare` is
    /// idempotent, so this doubles as an existence check).
    pub async fn check_queue(&self, name: &str) -> Result<()> {
        self.create_queue(name).await
    }

    /// Asserts that a topic exchange exists (see [`Self::check_queue`]).
    pub async fn check_exchange(&self, name: &str) -> Result<()> {
        self.create_exchange(name, ExchangeKind::Topic, true).await
    }

    /// Blocks `queue` from future subscription attempts.
    pub fn block(&self, queue: &str) -> bool {
        self.subscriptions.block(queue)
    }

    /// Unblocks a previously blocked queue.
    pub fn unblock(&self, queue: &str) -> bool {
        self.subscriptions.unblock(queue)
    }

    /// Best-effort drain and shutdown: signals every consume loop to stop, clears subscription
    /// state, and closes the default connection.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.subscriptions.clear_all();
        for channel_name in self.channels.names_for_connection(DEFAULT_CONNECTION).await {
            self.channels.close(&channel_name).await?;
        }
        self.connections.close(DEFAULT_CONNECTION).await?;
        info!("broker facade stopped");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    queue: String,
    error_queue: String,
    mut consumer: lapin::Consumer,
    channel: Channel,
    dispatcher: Arc<PartitionDispatcher>,
    subscriptions: Arc<SubscriptionManager>,
    config: Config,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let delivery = tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!(queue = %queue, "stopping consume loop on shutdown signal");
                break;
            }

            delivery = consumer.next() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!(queue = %queue, "consumer stream ended");
                    break;
                }
            },
        };

        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(queue = %queue, error = %err, "error receiving delivery");
                continue;
            }
        };

        let Some(subscription) = subscriptions.get(&queue) else {
            continue;
        };
        let max_retry_count = subscription.options.max_retry_count.or(config.max_retry_count);

        let payload: serde_json::Value = match serde_json::from_slice(&delivery.data) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(queue = %queue, error = %err, "could not decode JSON payload, rejecting");
                let headers = MessageHeaders::from_field_table(delivery.properties.headers().as_ref(), "");
                let bad_delivery = Delivery::new(
                    delivery,
                    channel.clone(),
                    serde_json::Value::Null,
                    headers,
                    queue.clone(),
                    error_queue.clone(),
                    max_retry_count,
                    config.auto_acknowledgement,
                );
                let _ = bad_delivery.reject(DispatchError::InvalidJson(err).to_string()).await;
                continue;
            }
        };

        let route_key = match dispatch_route_key_of(&payload) {
            Ok(route_key) => route_key,
            Err(err) => {
                let headers = MessageHeaders::from_field_table(delivery.properties.headers().as_ref(), "");
                let bad_delivery = Delivery::new(
                    delivery,
                    channel.clone(),
                    payload,
                    headers,
                    queue.clone(),
                    error_queue.clone(),
                    max_retry_count,
                    config.auto_acknowledgement,
                );
                let _ = bad_delivery.reject(err.to_string()).await;
                continue;
            }
        };

        let Some(handler) = subscription.resolve(&route_key).cloned() else {
            let headers = MessageHeaders::from_field_table(delivery.properties.headers().as_ref(), &route_key);
            let bad_delivery = Delivery::new(
                delivery,
                channel.clone(),
                payload,
                headers,
                queue.clone(),
                error_queue.clone(),
                max_retry_count,
                config.auto_acknowledgement,
            );
            let _ = bad_delivery.reject(DispatchError::NoHandlerFound.to_string()).await;
            continue;
        };

        let headers = MessageHeaders::from_field_table(delivery.properties.headers().as_ref(), &route_key);
        let partition_key = resolve_partition_key(&payload, &config.serial_dispatch_partition_key_selectors);
        let dispatch_key = format!("{queue}:{partition_key}");

        let handler_payload = payload.clone();
        let handler_headers = headers.clone();
        let decoded = DecodedMessage::new(handler_payload, handler_headers);
        let handle = Delivery::new(
            delivery,
            channel.clone(),
            payload,
            headers,
            queue.clone(),
            error_queue.clone(),
            max_retry_count,
            config.auto_acknowledgement,
        );

        dispatcher
            .dispatch(dispatch_key, async move {
                handler(decoded, handle).await;
            })
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn declare_bind_and_consume(
    channel: &Channel,
    queue: &str,
    error_queue: &str,
    global_exchange: &str,
    binding_keys: &[String],
    consumer_tag: &str,
    auto_acknowledgement: bool,
) -> Result<lapin::Consumer> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            error_queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;

    for binding_key in binding_keys {
        channel
            .queue_bind(
                queue,
                global_exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions {
                no_ack: auto_acknowledgement,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?)
}

/// Watches for broker-initiated connection closes and drives recovery: reconnect, reopen every
/// channel that lived on the closed connection, re-declare and re-bind subscriber queues, and
/// re-consume so handlers keep receiving deliveries without the application noticing.
///
/// Built on `Connection::on_error`'s callback, generalized from a single watched connection to any
/// number of named connections, each reconnected and replayed independently.
#[allow(clippy::too_many_arguments)]
async fn recovery_coordinator(
    mut lost: broadcast::Receiver<String>,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<PartitionDispatcher>,
    config: Config,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        let connection_name = tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            lost = lost.recv() => match lost {
                Ok(name) => name,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Err(err) = recover_connection(
            &connection_name,
            &connections,
            &channels,
            &subscriptions,
            &dispatcher,
            &config,
            &events,
            &shutdown,
        )
        .await
        {
            warn!(connection_name = %connection_name, error = %err, "recovery attempt failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn recover_connection(
    connection_name: &str,
    connections: &Arc<ConnectionManager>,
    channels: &Arc<ChannelManager>,
    subscriptions: &Arc<SubscriptionManager>,
    dispatcher: &Arc<PartitionDispatcher>,
    config: &Config,
    events: &EventBus,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    connections.recover(connection_name).await?;

    if connection_name == DEFAULT_CONNECTION {
        channels.recover(PUBLISHER_CHANNEL, connections).await?;
        if let Some(publisher_channel) = channels.get(PUBLISHER_CHANNEL).await {
            publisher_channel
                .exchange_declare(
                    &config.channel.global_exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
    }

    for channel_name in channels.names_for_connection(connection_name).await {
        let Some(queue) = channel_name.strip_prefix("subscribe:") else {
            continue;
        };
        let queue = queue.to_string();

        if let Err(err) = recover_subscriber_channel(
            &channel_name,
            &queue,
            connections,
            channels,
            subscriptions,
            dispatcher,
            config,
            events,
            shutdown,
        )
        .await
        {
            warn!(queue = %queue, error = %err, "failed to recover subscriber channel");
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn recover_subscriber_channel(
    channel_name: &str,
    queue: &str,
    connections: &Arc<ConnectionManager>,
    channels: &Arc<ChannelManager>,
    subscriptions: &Arc<SubscriptionManager>,
    dispatcher: &Arc<PartitionDispatcher>,
    config: &Config,
    events: &EventBus,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let Some(subscription) = subscriptions.get(queue) else {
        return Ok(());
    };

    channels.recover(channel_name, connections).await?;
    let channel = channels
        .get(channel_name)
        .await
        .expect("channel was just recovered");

    let error_queue = format!("{queue}{}", config.error_queue_suffix);
    let binding_keys: Vec<String> = subscription.handlers.keys().cloned().collect();
    let consumer_tag = format!("{queue}-consumer");

    let consumer = declare_bind_and_consume(
        &channel,
        queue,
        &error_queue,
        &config.channel.global_exchange,
        &binding_keys,
        &consumer_tag,
        config.auto_acknowledgement,
    )
    .await?;

    subscriptions.tag(queue, consumer_tag.clone());
    channels.add_consumer(channel_name, consumer_tag).await;

    let dispatcher = dispatcher.clone();
    let subscriptions = subscriptions.clone();
    let config = config.clone();
    let queue_owned = queue.to_string();
    let shutdown_rx = shutdown.subscribe();

    tokio::spawn(async move {
        consume_loop(
            queue_owned,
            error_queue,
            consumer,
            channel,
            dispatcher,
            subscriptions,
            config,
            shutdown_rx,
        )
        .await;
    });

    events.emit(Event::QueueSubscribed {
        queue_name: queue.to_string(),
    });

    Ok(())
}
