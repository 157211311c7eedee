// src/env.rs
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use dotenv::dotenv;
use tracing::debug;

use crate::config::ConnectionSettings;
use crate::rabbitmq::consumer::{ConsumerConfig, MessageCallback};
use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::publisher::PublisherConfig;
use crate::rabbitmq::topology::{ExchangeDescriptor, ExchangeKind, QueueDescriptor, Topology};

/// Everything the worker binary needs, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub settings: ConnectionSettings,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Queue the worker consumes tasks from.
    pub task_queue: String,
    /// Extra queues bound to the exchange with the same routing key.
    pub data_queues: Vec<String>,
    pub routing_key: String,
    pub result_routing_key: String,
    pub app_id: String,
    pub prefetch_count: u16,
}

fn default_exchange() -> String { "message".to_string() }
fn default_task_queue() -> String { "tasks".to_string() }
fn default_routing_key() -> String { "example.text".to_string() }
fn default_result_routing_key() -> String { "example.result".to_string() }
fn default_app_id() -> String { "rabbit-worker".to_string() }
fn default_prefetch_count() -> u16 { 1 }

impl WorkerConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. `RABBITMQ_USER` and
    /// `RABBITMQ_PASSWORD` are required; everything else has a default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = required(&lookup, "RABBITMQ_USER")?;
        let password = required(&lookup, "RABBITMQ_PASSWORD")?;

        let mut settings = ConnectionSettings::new(&username, &password);
        if let Some(host) = lookup("RABBITMQ_HOST") {
            settings.host = host;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            settings.virtual_host = vhost;
        }
        settings.port = parsed(&lookup, "RABBITMQ_PORT", settings.port)?;
        settings.heartbeat_interval = optional(&lookup, "RABBITMQ_HEARTBEAT")?;
        settings.channel_max = optional(&lookup, "RABBITMQ_CHANNEL_MAX")?;
        settings.frame_max = optional(&lookup, "RABBITMQ_FRAME_MAX")?;
        settings.connection_attempts =
            parsed(&lookup, "RABBITMQ_CONNECTION_ATTEMPTS", settings.connection_attempts)?;
        settings.retry_delay_ms = parsed(&lookup, "RABBITMQ_RETRY_DELAY_MS", settings.retry_delay_ms)?;
        settings.socket_timeout_ms =
            parsed(&lookup, "RABBITMQ_SOCKET_TIMEOUT_MS", settings.socket_timeout_ms)?;
        settings.keep_alive_interval_ms =
            parsed(&lookup, "RABBITMQ_KEEP_ALIVE_MS", settings.keep_alive_interval_ms)?;
        settings.queue_depth_interval_ms = optional(&lookup, "RABBITMQ_QUEUE_DEPTH_MS")?;
        settings.backpressure_threshold = optional(&lookup, "RABBITMQ_BACKPRESSURE_THRESHOLD")?;
        settings.tls.enabled = flag(&lookup, "RABBITMQ_TLS")?;
        settings.tls.ca_cert_path = lookup("RABBITMQ_CA_CERT").map(PathBuf::from);
        if let Some(locale) = lookup("RABBITMQ_LOCALE") {
            settings.locale = locale;
        }
        if let Some(name) = lookup("RABBITMQ_CONNECTION_NAME") {
            settings.connection_name = name;
        }
        settings.validate()?;

        let exchange_kind = match lookup("RABBITMQ_EXCHANGE_KIND") {
            Some(raw) => raw
                .parse::<ExchangeKind>()
                .map_err(|e| RabbitMQError::ConfigError(format!("RABBITMQ_EXCHANGE_KIND: {}", e)))?,
            None => ExchangeKind::Topic,
        };

        let data_queues = lookup("WORKER_DATA_QUEUES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = WorkerConfig {
            settings,
            exchange: lookup("RABBITMQ_EXCHANGE").unwrap_or_else(default_exchange),
            exchange_kind,
            task_queue: lookup("WORKER_TASK_QUEUE").unwrap_or_else(default_task_queue),
            data_queues,
            routing_key: lookup("RABBITMQ_ROUTING_KEY").unwrap_or_else(default_routing_key),
            result_routing_key: lookup("WORKER_RESULT_ROUTING_KEY")
                .unwrap_or_else(default_result_routing_key),
            app_id: lookup("WORKER_APP_ID").unwrap_or_else(default_app_id),
            prefetch_count: parsed(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch_count())?,
        };
        debug!(
            task_queue = %config.task_queue,
            data_queues = ?config.data_queues,
            exchange = %config.exchange,
            "Loaded worker configuration"
        );
        Ok(config)
    }

    /// The exchange with the task queue and every data queue bound to it.
    pub fn topology(&self) -> Topology {
        let mut topology =
            Topology::new(ExchangeDescriptor::new(&self.exchange, self.exchange_kind))
                .with_queue(QueueDescriptor::new(&self.task_queue, &self.routing_key));
        for queue in &self.data_queues {
            if topology.queue(queue).is_none() {
                topology = topology.with_queue(QueueDescriptor::new(queue, &self.routing_key));
            }
        }
        topology
    }

    pub fn consumer_config(&self, callback: Arc<dyn MessageCallback>) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(&self.task_queue, self.prefetch_count, callback);
        config.consumer_tag_prefix = self.app_id.clone();
        config
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::new(&self.exchange, &self.result_routing_key, &self.app_id)
    }
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| RabbitMQError::ConfigError(format!("{} is not set", key)))
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(optional(lookup, key)?.unwrap_or(default))
}

fn optional<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RabbitMQError::ConfigError(format!("{}: invalid value `{}`", key, raw))),
        None => Ok(None),
    }
}

fn flag<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => Ok(false),
        Some(v) => Err(RabbitMQError::ConfigError(format!("{}: invalid flag `{}`", key, v))),
    }
}
