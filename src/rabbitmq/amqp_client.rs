// src/rabbitmq/amqp_client.rs
//
// Capability traits between the connection state machine and the broker client.
// `lapin_client` provides the production implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionSettings;
use crate::message::OutgoingMessage;

use super::errors::Result;
use super::events::TransportEvents;
use super::topology::{ExchangeDescriptor, QueueDescriptor};

/// Opens physical connections. One call per connect or reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unexpected closes of the returned connection (and of its channels) must be
    /// reported through `events`.
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: TransportEvents,
    ) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    /// Cheap broker round trip proving the connection is alive.
    async fn keep_alive(&self) -> Result<()>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, exchange: &ExchangeDescriptor) -> Result<()>;

    /// Returns the number of ready messages in the queue.
    async fn queue_declare(&self, queue: &QueueDescriptor) -> Result<u32>;

    async fn queue_declare_passive(&self, queue: &str) -> Result<u32>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    /// Deliveries and a later cancellation arrive as events on the transport sink.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<()>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// `message_number` is the confirm-mode sequence number of this publish; the
    /// matching confirmation is reported with it as the delivery tag.
    async fn basic_publish(&self, message: &OutgoingMessage, message_number: u64) -> Result<()>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<()>;
}
