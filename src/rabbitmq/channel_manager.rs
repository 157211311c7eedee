// src/rabbitmq/channel_manager.rs

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::errors::{RabbitMQError, Result};
use super::topology::Topology;

/// Steps of bringing a fresh channel to a usable state, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetupStage {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    Bind,
    Ready,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::OpenChannel => "open channel",
            SetupStage::DeclareExchange => "declare exchange",
            SetupStage::DeclareQueue => "declare queue",
            SetupStage::Bind => "bind queue",
            SetupStage::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Opens a channel and declares the topology on it. Each stage only starts once the
/// previous one succeeded; any failure is reported as a channel protocol error
/// naming the stage.
pub struct ChannelSetup<'a> {
    topology: &'a Topology,
    stage: SetupStage,
}

impl<'a> ChannelSetup<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        ChannelSetup {
            topology,
            stage: SetupStage::OpenChannel,
        }
    }

    /// Runs every stage against `connection` and returns the ready channel.
    pub async fn run(mut self, connection: &dyn AmqpConnection) -> Result<Arc<dyn AmqpChannel>> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| self.fail(e))?;
        debug!(channel_id = channel.id(), "Channel opened");

        match self.declare(channel.as_ref()).await {
            Ok(()) => Ok(channel),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn declare(&mut self, channel: &dyn AmqpChannel) -> Result<()> {
        let exchange = &self.topology.exchange;

        self.stage = SetupStage::DeclareExchange;
        info!(exchange = %exchange.name, kind = ?exchange.kind, durable = exchange.durable, "Declaring exchange");
        channel.exchange_declare(exchange).await?;

        self.stage = SetupStage::DeclareQueue;
        for queue in &self.topology.queues {
            let ready = channel.queue_declare(queue).await?;
            info!(queue = %queue.name, durable = queue.durable, messages = ready, "Declared queue");
        }

        self.stage = SetupStage::Bind;
        for queue in &self.topology.queues {
            channel
                .queue_bind(&queue.name, &exchange.name, &queue.routing_key)
                .await?;
            debug!(queue = %queue.name, exchange = %exchange.name, routing_key = %queue.routing_key, "Bound queue");
        }

        self.stage = SetupStage::Ready;
        Ok(())
    }

    fn fail(&self, err: RabbitMQError) -> RabbitMQError {
        error!(stage = %self.stage, error = %err, "Channel setup failed");
        RabbitMQError::ChannelProtocolError(format!("{} failed: {}", self.stage, err))
    }
}
