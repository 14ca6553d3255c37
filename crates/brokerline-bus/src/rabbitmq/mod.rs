//! Topic-exchange adapter.
//!
//! The adapter owns one connection and one channel. On start it declares a
//! durable topic exchange and a durable queue, binds them with the configured
//! routing key and only then reports [`ConnectionState::Ready`]. Losing the
//! connection moves it to [`ConnectionState::Degraded`]; from then on every
//! publish/subscribe fails fast with [`QueueError::NotConnected`] until the
//! process builds a new adapter.
//!
//! Deliveries are consumed with prefetch 1 by a single task, so the handler
//! never runs concurrently with itself. Only the first `subscribe` starts a
//! consumer; later calls are warned no-ops. Success acks the delivery; any
//! failure nacks it with requeue, which gives at-least-once delivery.

#[cfg(feature = "rabbitmq")]
mod lapin_transport;

#[cfg(feature = "rabbitmq")]
pub use lapin_transport::LapinTransport;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RabbitMqSettings;
use crate::envelope::{AMQP_TYPE_HEADER, CONTENT_TYPE_JSON, Envelope};
use crate::error::QueueError;
use crate::service::{
    ConnectionState, MessageHandler, Provider, QueueService, SharedHandler, StateCell,
};

/// Deliveries are processed one at a time end to end.
pub const PREFETCH_COUNT: u16 = 1;

/// Called with a description of the failure when the broker connection dies.
pub type ConnectionLostHook = Box<dyn Fn(String) + Send + Sync>;

pub type DeliveryStream = BoxStream<'static, anyhow::Result<Delivery>>;

/// Message handed to the broker by [`AmqpTransport::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    /// Survives a broker restart (delivery mode 2).
    pub persistent: bool,
    /// Unix seconds.
    pub timestamp: u64,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// The broker did not take the message (buffer full / negative confirm).
    NotAccepted,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> anyhow::Result<()>;
    async fn nack(&self, requeue: bool) -> anyhow::Result<()>;
}

pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
        }
    }
}

/// Connection + channel pair the adapter drives.
///
/// Declarations are always durable; the exchange is always of kind `topic`.
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    fn on_connection_lost(&self, hook: ConnectionLostHook);
    async fn declare_exchange(&self, exchange: &str) -> anyhow::Result<()>;
    async fn declare_queue(&self, queue: &str) -> anyhow::Result<()>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> anyhow::Result<()>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> anyhow::Result<PublishOutcome>;
    async fn set_prefetch(&self, count: u16) -> anyhow::Result<()>;
    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> anyhow::Result<DeliveryStream>;
    async fn close_channel(&self) -> anyhow::Result<()>;
    async fn close_connection(&self) -> anyhow::Result<()>;
}

pub struct TopicExchangeQueue {
    settings: RabbitMqSettings,
    transport: Arc<dyn AmqpTransport>,
    state: StateCell,
    subscribed: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TopicExchangeQueue {
    /// Opens a real broker connection and declares the topology.
    #[cfg(feature = "rabbitmq")]
    pub async fn connect(settings: RabbitMqSettings) -> Result<Self, QueueError> {
        let transport = LapinTransport::connect(&settings.url)
            .await
            .map_err(|err| QueueError::backend("rabbitmq connect", err))?;
        Self::start(settings, Arc::new(transport)).await
    }

    /// Declares exchange, queue and binding on an already open transport.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn start(
        settings: RabbitMqSettings,
        transport: Arc<dyn AmqpTransport>,
    ) -> Result<Self, QueueError> {
        let state = StateCell::new();
        state.set(ConnectionState::Connecting);

        let watcher = state.clone();
        transport.on_connection_lost(Box::new(move |reason| {
            if watcher.transition(ConnectionState::Ready, ConnectionState::Degraded)
                || watcher.transition(ConnectionState::Connecting, ConnectionState::Degraded)
            {
                error!(reason = %reason, "rabbitmq connection lost");
            }
        }));

        if let Err(err) = declare_topology(transport.as_ref(), &settings).await {
            error!(error = %err, "failed to initialize rabbitmq");
            shutdown_transport(transport.as_ref()).await;
            state.set(ConnectionState::Closed);
            return Err(err);
        }

        if !state.transition(ConnectionState::Connecting, ConnectionState::Ready) {
            shutdown_transport(transport.as_ref()).await;
            state.set(ConnectionState::Closed);
            return Err(QueueError::NotConnected(Provider::RabbitMq));
        }

        info!(
            queue = %settings.queue,
            exchange = %settings.exchange,
            routing_key = %settings.routing_key,
            "rabbitmq connected"
        );

        Ok(Self {
            settings,
            transport,
            state,
            subscribed: AtomicBool::new(false),
            consumer: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == ConnectionState::Ready
    }

    async fn start_consumer(&self) -> Result<DeliveryStream, QueueError> {
        self.transport
            .set_prefetch(PREFETCH_COUNT)
            .await
            .map_err(|err| QueueError::backend("set prefetch", err))?;
        self.transport
            .consume(&self.settings.queue)
            .await
            .map_err(|err| QueueError::backend("rabbitmq consume", err))
    }

    fn ensure_ready(&self) -> Result<(), QueueError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(QueueError::NotConnected(Provider::RabbitMq))
        }
    }
}

async fn declare_topology(
    transport: &dyn AmqpTransport,
    settings: &RabbitMqSettings,
) -> Result<(), QueueError> {
    transport
        .declare_exchange(&settings.exchange)
        .await
        .map_err(|err| QueueError::backend("declare exchange", err))?;
    transport
        .declare_queue(&settings.queue)
        .await
        .map_err(|err| QueueError::backend("declare queue", err))?;
    transport
        .bind_queue(&settings.queue, &settings.exchange, &settings.routing_key)
        .await
        .map_err(|err| QueueError::backend("bind queue", err))?;
    Ok(())
}

/// Channel first, then connection. Errors are reported, never raised.
async fn shutdown_transport(transport: &dyn AmqpTransport) {
    if let Err(err) = transport.close_channel().await {
        warn!(error = %err, "error closing rabbitmq channel");
    }
    if let Err(err) = transport.close_connection().await {
        warn!(error = %err, "error closing rabbitmq connection");
    }
}

#[async_trait]
impl QueueService for TopicExchangeQueue {
    fn provider(&self) -> Provider {
        Provider::RabbitMq
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.ensure_ready()?;
        envelope.validate()?;

        let mut headers = BTreeMap::new();
        headers.insert(AMQP_TYPE_HEADER.to_string(), envelope.kind.clone());
        let message = OutboundMessage {
            body: envelope.to_bytes()?,
            content_type: CONTENT_TYPE_JSON,
            persistent: true,
            timestamp: OffsetDateTime::now_utc().unix_timestamp().max(0) as u64,
            headers,
        };

        let outcome = self
            .transport
            .publish(&self.settings.exchange, &self.settings.routing_key, message)
            .await
            .map_err(|err| {
                error!(error = %err, message_type = %envelope.kind, "failed to publish message to rabbitmq");
                QueueError::backend("rabbitmq publish", err)
            })?;

        match outcome {
            PublishOutcome::Accepted => {
                counter!("brokerline_messages_published_total", "provider" => "rabbitmq")
                    .increment(1);
                info!(
                    message_type = %envelope.kind,
                    message_id = envelope.message_id.as_deref().unwrap_or(""),
                    "message published to rabbitmq"
                );
            }
            PublishOutcome::NotAccepted => {
                warn!(message_type = %envelope.kind, "message was not published (buffer full)");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, handler: SharedHandler) -> Result<(), QueueError> {
        self.ensure_ready()?;
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(queue = %self.settings.queue, "already consuming from rabbitmq queue");
            return Ok(());
        }
        info!(queue = %self.settings.queue, "subscribing to rabbitmq queue");

        let deliveries = match self.start_consumer().await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                // Nothing is consuming; a later call may try again.
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let task = tokio::spawn(consume_loop(deliveries, handler));
        *self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        info!(queue = %self.settings.queue, "subscribed to rabbitmq queue");
        Ok(())
    }

    async fn close(&self) {
        if self.state.close() == ConnectionState::Closed {
            debug!("rabbitmq adapter already closed");
            return;
        }
        info!("closing rabbitmq connection");
        shutdown_transport(self.transport.as_ref()).await;
        if let Some(task) = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        info!("rabbitmq connection closed");
    }
}

async fn consume_loop(mut deliveries: DeliveryStream, handler: SharedHandler) {
    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => process_delivery(delivery, handler.as_ref()).await,
            Err(err) => warn!(error = %err, "rabbitmq consumer error"),
        }
    }
    debug!("rabbitmq delivery stream ended");
}

async fn process_delivery(delivery: Delivery, handler: &dyn MessageHandler) {
    counter!("brokerline_messages_received_total", "provider" => "rabbitmq").increment(1);

    let outcome = match Envelope::from_slice(&delivery.body) {
        Ok(envelope) => {
            debug!(
                delivery_tag = delivery.delivery_tag,
                message_type = %envelope.kind,
                "received message from rabbitmq"
            );
            handler.handle(envelope).await
        }
        Err(err) => {
            // Permanently malformed bodies come straight back after requeue.
            error!(
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                error = %err,
                "undecodable rabbitmq message"
            );
            Err(err.into())
        }
    };

    match outcome {
        Ok(()) => {
            if let Err(err) = delivery.acker.ack().await {
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to ack rabbitmq delivery");
            }
        }
        Err(err) => {
            counter!("brokerline_messages_failed_total", "provider" => "rabbitmq").increment(1);
            error!(
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "error processing message; requeueing"
            );
            if let Err(err) = delivery.acker.nack(true).await {
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to nack rabbitmq delivery");
            }
        }
    }
}
