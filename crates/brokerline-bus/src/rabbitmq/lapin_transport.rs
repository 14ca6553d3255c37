use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::publisher_confirm::Confirmation;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use super::{
    Acknowledger, AmqpTransport, ConnectionLostHook, Delivery, DeliveryStream, OutboundMessage,
    PublishOutcome,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// [`AmqpTransport`] over a `lapin` connection with a single channel.
pub struct LapinTransport {
    connection: Connection,
    channel: Channel,
}

impl LapinTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("connect to rabbitmq")?;
        let channel = connection
            .create_channel()
            .await
            .context("open rabbitmq channel")?;
        // Publisher confirms let broker nacks surface as `NotAccepted`.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("enable rabbitmq publisher confirms")?;
        Ok(Self {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    fn on_connection_lost(&self, hook: ConnectionLostHook) {
        self.connection
            .on_error(move |err: lapin::Error| hook(err.to_string()));
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PublishOutcome> {
        let mut headers = FieldTable::default();
        for (key, value) in message.headers {
            headers.insert(
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            );
        }
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_timestamp(message.timestamp)
            .with_headers(headers);
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        let confirmation = confirm.await?;
        Ok(publish_outcome(&confirmation))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("brokerline-{queue}"),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|next| {
            next.map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.redelivered,
                    delivery.data,
                    Box::new(LapinAcker(delivery.acker)),
                )
            })
            .map_err(anyhow::Error::from)
        });
        Ok(deliveries.boxed())
    }

    async fn close_channel(&self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.connection.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

fn publish_outcome(confirmation: &Confirmation) -> PublishOutcome {
    if confirmation.is_nack() {
        PublishOutcome::NotAccepted
    } else {
        PublishOutcome::Accepted
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
