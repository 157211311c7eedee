// src/rabbitmq/lapin_client.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    tcp::OwnedTLSConfig,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as LapinExchangeKind,
};
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::message::{MessageProperties, OutgoingMessage, RawDelivery};

use super::amqp_client::{AmqpChannel, AmqpConnection, Connector};
use super::errors::{RabbitMQError, Result};
use super::events::TransportEvents;
use super::publisher::ConfirmOutcome;
use super::topology::{ExchangeDescriptor, ExchangeKind, QueueDescriptor};

/// Connects to a real broker through lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: TransportEvents,
    ) -> Result<Arc<dyn AmqpConnection>> {
        let uri = settings.amqp_uri();
        info!(
            uri = %settings.redacted_uri(),
            generation = events.generation(),
            "Attempting to connect to RabbitMQ"
        );

        let mut properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(settings.connection_name.clone()));
        properties.locale = settings.locale.clone();

        let connection = match (&settings.tls.ca_cert_path, settings.tls.enabled) {
            (Some(path), true) => {
                let cert_chain = std::fs::read_to_string(path)?;
                let tls = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(cert_chain),
                };
                Connection::connect_with_config(&uri, properties, tls).await?
            }
            _ => Connection::connect(&uri, properties).await?,
        };

        let on_error = events.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection failed");
            on_error.connection_closed(err.to_string());
        });

        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection, events }))
    }
}

struct LapinConnection {
    connection: Connection,
    events: TransportEvents,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self.connection.create_channel().await?;

        let on_error = self.events.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "RabbitMQ channel closed by broker");
            on_error.channel_closed(err.to_string());
        });

        Ok(Arc::new(LapinChannel {
            channel,
            events: self.events.clone(),
            confirms: AtomicBool::new(false),
        }))
    }

    async fn keep_alive(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Err(RabbitMQError::ConnectionError(
                "connection is no longer connected".to_string(),
            ));
        }
        // A channel open/close pair is a full round trip on channel 0 and the new channel.
        let probe = self.connection.create_channel().await?;
        probe.close(200, "keep-alive").await?;
        Ok(())
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(reply_code, reply_text).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct LapinChannel {
    channel: Channel,
    events: TransportEvents,
    confirms: AtomicBool,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueDescriptor) -> Result<u32> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(declared.message_count())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<u32> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(declared.message_count())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
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

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let events = self.events.clone();
        let consumer_tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => events.delivery(raw_delivery(delivery)),
                    Err(err) => {
                        // The channel/connection error callbacks report the failure itself.
                        warn!(error = %err, consumer_tag = %consumer_tag, "Error receiving message");
                        return;
                    }
                }
            }
            events.consumer_cancelled(consumer_tag);
        });
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn basic_publish(&self, message: &OutgoingMessage, message_number: u64) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(&message.properties),
            )
            .await?;

        if !self.confirms.load(Ordering::Acquire) {
            return Ok(());
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(_)) => {
                    events.confirmation(message_number, false, ConfirmOutcome::Ack)
                }
                Ok(Confirmation::Nack(_)) => {
                    events.confirmation(message_number, false, ConfirmOutcome::Nack)
                }
                Ok(Confirmation::NotRequested) => {}
                Err(err) => {
                    debug!(error = %err, message_number, "Confirmation lost with its channel")
                }
            }
        });
        Ok(())
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        self.channel.close(reply_code, reply_text).await?;
        Ok(())
    }
}

fn lapin_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn raw_delivery(delivery: lapin::message::Delivery) -> RawDelivery {
    let properties = &delivery.properties;
    let properties = MessageProperties {
        app_id: properties.app_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        delivery_mode: *properties.delivery_mode(),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        timestamp: *properties.timestamp(),
    };

    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties,
        data: delivery.data,
    }
}
