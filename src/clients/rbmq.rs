use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker as LapinAcker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::{Acker, Broker, BrokerError, BrokerMessage, BrokerResult, Subscription},
    models::event::{HEADER_DELIVERY_COUNT, Headers},
};

/// RabbitMQ transport: subjects are routing keys on a durable topic exchange.
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    exchange: String,
    prefetch_count: u16,
}

impl RabbitMqBroker {
    pub async fn connect(url: &str, exchange: &str, prefetch_count: u16) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", exchange, e))?;

        info!(exchange = %exchange, "Event exchange declared");

        Ok(Self {
            connection,
            channel,
            exchange: exchange.to_string(),
            prefetch_count,
        })
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn subscribe(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BrokerResult<Box<dyn Subscription>> {
        let channel = self.connection.create_channel().await?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        // Quorum queues report x-delivery-count on redeliveries.
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-queue-type"),
            AMQPValue::LongString(LongString::from("quorum")),
        );

        channel
            .queue_declare(
                durable_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;

        let routing_pattern = amqp_binding_pattern(subject_filter);
        channel
            .queue_bind(
                durable_name,
                &self.exchange,
                &routing_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("{}-{}", durable_name, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                durable_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %durable_name,
            binding = %routing_pattern,
            "Consumer created for queue"
        );

        Ok(Box::new(RabbitMqSubscription {
            channel,
            consumer,
            consumer_tag,
        }))
    }

    async fn publish(&self, subject: &str, payload: &[u8], headers: &Headers) -> BrokerResult<()> {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        self.channel
            .basic_publish(
                &self.exchange,
                subject,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type(ShortString::from("application/json"))
                    .with_headers(table),
            )
            .await?;

        debug!(subject = %subject, bytes = payload.len(), "Message published");

        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Err(e) = self.channel.close(200, "closing").await {
            warn!(error = %e, "Failed to close RabbitMQ channel cleanly");
        }
        self.connection.close(200, "closing").await?;

        info!("RabbitMQ connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct RabbitMqSubscription {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn fetch(
        &mut self,
        batch_size: usize,
        timeout: Duration,
    ) -> BrokerResult<Vec<BrokerMessage>> {
        let mut batch = Vec::with_capacity(batch_size);

        match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => return Ok(batch),
            Ok(None) => return Err(BrokerError::Closed),
            Ok(Some(delivery)) => batch.push(into_message(delivery?)),
        }

        while batch.len() < batch_size {
            match self.consumer.next().now_or_never() {
                Some(Some(delivery)) => batch.push(into_message(delivery?)),
                _ => break,
            }
        }

        Ok(batch)
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;

        // Closing the channel returns unacked deliveries to the queue.
        self.channel.close(200, "unsubscribed").await?;

        info!(consumer_tag = %self.consumer_tag, "Consumer cancelled");
        Ok(())
    }
}

struct RabbitMqAcker(LapinAcker);

#[async_trait]
impl Acker for RabbitMqAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nak(&self) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn into_message(delivery: Delivery) -> BrokerMessage {
    let mut headers = Headers::new();
    let mut delivery_count = None;

    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == HEADER_DELIVERY_COUNT {
                delivery_count = amqp_integer(value).and_then(|n| u32::try_from(n).ok());
                continue;
            }
            if let AMQPValue::LongString(text) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(text.as_bytes()).into_owned(),
                );
            }
        }
    }

    if delivery_count.is_none() && !delivery.redelivered {
        delivery_count = Some(0);
    }

    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    BrokerMessage::new(
        delivery.routing_key.as_str(),
        delivery.data,
        headers,
        Box::new(RabbitMqAcker(delivery.acker)),
    )
    .with_delivery_count(delivery_count)
    .with_message_id(message_id)
}

fn amqp_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(i64::from(*n)),
        _ => None,
    }
}

/// Maps a subject filter onto an AMQP topic binding (`>` becomes `#`).
pub fn amqp_binding_pattern(subject_filter: &str) -> String {
    subject_filter
        .split('.')
        .map(|token| if token == ">" { "#" } else { token })
        .collect::<Vec<_>>()
        .join(".")
}
