use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rust_rabbit_worker::message::{parse_task, Delivery, WorkerMessage};
use rust_rabbit_worker::rabbitmq::{
    ChannelHandle, ConnectionRegistry, HandlerFactory, HandlerSpec, MessageCallback,
};
use rust_rabbit_worker::WorkerConfig;

/// Accepts JSON object tasks and publishes a result envelope for each.
struct TaskHandler;

#[async_trait]
impl MessageCallback for TaskHandler {
    async fn on_message(&self, channel: &ChannelHandle, delivery: &Delivery) -> anyhow::Result<bool> {
        info!(delivery_tag = delivery.delivery_tag, "Received task");

        let task = match parse_task(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                // Unusable tasks are acknowledged so they do not come back.
                error!(error = %e, body = %delivery.body, "Malformed task, discarding");
                return Ok(true);
            }
        };

        let result = WorkerMessage::new("task.done", Value::Object(task));
        channel
            .publish(&result)
            .context("failed to publish task result")?;
        info!(result_id = %result.id, "Task processed");
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = WorkerConfig::load().context("invalid worker configuration")?;

    let registry = ConnectionRegistry::new();
    let connection = registry.get_or_init(config.settings.clone(), config.topology())?;

    HandlerFactory::create(
        &connection,
        HandlerSpec::Consumer(config.consumer_config(Arc::new(TaskHandler))),
    )?;
    HandlerFactory::create(&connection, HandlerSpec::Publisher(config.publisher_config()))?;

    let stopper = connection.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping worker");
                stopper.stop();
            }
            Err(e) => error!(error = %e, "Unable to listen for shutdown signal"),
        }
    });

    info!(queue = %config.task_queue, "Worker starting");
    connection.start_heartbeat();
    connection.clone().run().await?;

    let stats = connection.publish_stats();
    info!(
        acked = stats.acked,
        nacked = stats.nacked,
        dropped = stats.dropped,
        abandoned = stats.abandoned,
        reconnects = connection.reconnects(),
        "Worker stopped"
    );
    registry.teardown();
    Ok(())
}
