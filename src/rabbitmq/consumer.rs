// src/rabbitmq/consumer.rs

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{Delivery, RawDelivery};

use super::amqp_client::AmqpChannel;
use super::errors::{RabbitMQError, Result};
use super::publisher::Publisher;

/// Implemented by whatever processes tasks pulled from the queue.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// `Ok(true)` acknowledges the delivery. `Ok(false)`, an error or a panic leave
    /// it unacknowledged so the broker redelivers it once the channel goes away.
    async fn on_message(&self, channel: &ChannelHandle, delivery: &Delivery) -> anyhow::Result<bool>;
}

/// Adapts a plain closure into a [`MessageCallback`].
pub struct FnCallback<F>(F);

#[async_trait]
impl<F> MessageCallback for FnCallback<F>
where
    F: Fn(&ChannelHandle, &Delivery) -> anyhow::Result<bool> + Send + Sync,
{
    async fn on_message(&self, channel: &ChannelHandle, delivery: &Delivery) -> anyhow::Result<bool> {
        (self.0)(channel, delivery)
    }
}

pub fn callback_fn<F>(f: F) -> Arc<dyn MessageCallback>
where
    F: Fn(&ChannelHandle, &Delivery) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// What a callback gets to work with besides the delivery itself.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    channel_id: u16,
    publisher: Option<Publisher>,
}

impl ChannelHandle {
    pub(crate) fn new(channel_id: u16, publisher: Option<Publisher>) -> Self {
        ChannelHandle {
            channel_id,
            publisher,
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// Publishes a result through the connection's publisher role.
    pub fn publish<T: Serialize>(&self, payload: &T) -> Result<()> {
        match &self.publisher {
            Some(publisher) => publisher.publish(payload),
            None => Err(RabbitMQError::ConfigError(
                "no publisher registered on this connection".to_string(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Upper bound of unacknowledged deliveries held by this worker.
    pub prefetch_count: u16,
    pub consumer_tag_prefix: String,
    pub callback: Arc<dyn MessageCallback>,
}

impl ConsumerConfig {
    pub fn new(queue: &str, prefetch_count: u16, callback: Arc<dyn MessageCallback>) -> Self {
        ConsumerConfig {
            queue: queue.to_string(),
            prefetch_count,
            consumer_tag_prefix: "consumer".to_string(),
            callback,
        }
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("queue", &self.queue)
            .field("prefetch_count", &self.prefetch_count)
            .field("consumer_tag_prefix", &self.consumer_tag_prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked,
    LeftUnacked,
    Rejected,
}

/// A live subscription on the current channel.
pub struct ConsumerSession {
    consumer_tag: String,
    prefetch_count: u16,
    callback: Arc<dyn MessageCallback>,
}

impl ConsumerSession {
    /// Sets QoS, then starts consuming. QoS always precedes `basic.consume`.
    pub async fn subscribe(channel: &dyn AmqpChannel, config: &ConsumerConfig) -> Result<Self> {
        debug!(prefetch = config.prefetch_count, "Setting channel QoS");
        channel.basic_qos(config.prefetch_count).await?;

        let consumer_tag = format!(
            "{}-{}",
            config.consumer_tag_prefix,
            &Uuid::new_v4().to_string()[..8]
        );
        channel.basic_consume(&config.queue, &consumer_tag).await?;
        info!(queue = %config.queue, consumer_tag = %consumer_tag, "Started consuming");

        Ok(ConsumerSession {
            consumer_tag,
            prefetch_count: config.prefetch_count,
            callback: config.callback.clone(),
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Decodes one delivery and runs the callback. Never fails: every problem is
    /// logged and the delivery stays unacknowledged.
    pub async fn dispatch(
        &self,
        channel: &dyn AmqpChannel,
        handle: &ChannelHandle,
        raw: RawDelivery,
    ) -> DispatchOutcome {
        let delivery = match Delivery::decode(raw) {
            Ok(delivery) => delivery,
            Err((raw, err)) => {
                error!(delivery_tag = raw.delivery_tag, error = %err, "Rejecting message with a non UTF-8 body");
                if let Err(e) = channel.basic_reject(raw.delivery_tag, false).await {
                    error!(error = %e, "Failed to reject message");
                }
                return DispatchOutcome::Rejected;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        info!(
            delivery_tag,
            app_id = delivery.properties.app_id.as_deref().unwrap_or("-"),
            redelivered = delivery.redelivered,
            "Received message"
        );

        let result = AssertUnwindSafe(self.callback.on_message(handle, &delivery))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(true)) => match channel.basic_ack(delivery_tag).await {
                Ok(()) => {
                    debug!(delivery_tag, "Acknowledged message");
                    DispatchOutcome::Acked
                }
                Err(e) => {
                    error!(delivery_tag, error = %e, "Failed to acknowledge message");
                    DispatchOutcome::LeftUnacked
                }
            },
            Ok(Ok(false)) => {
                warn!(delivery_tag, "Callback reported failure, leaving message unacknowledged");
                DispatchOutcome::LeftUnacked
            }
            Ok(Err(e)) => {
                error!(delivery_tag, error = %e, "Error processing message");
                DispatchOutcome::LeftUnacked
            }
            Err(panic) => {
                error!(delivery_tag, panic = %panic_message(&panic), "Callback panicked");
                DispatchOutcome::LeftUnacked
            }
        }
    }
}

impl fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("consumer_tag", &self.consumer_tag)
            .field("prefetch_count", &self.prefetch_count)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
