// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Broker connection options. Unset fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub channel_max: Option<u16>,
    #[serde(default)]
    pub frame_max: Option<u32>,
    /// Broker-negotiated AMQP heartbeat, in seconds.
    #[serde(default)]
    pub heartbeat_interval: Option<u16>,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Warn once this many publishes are waiting for a confirmation.
    #[serde(default)]
    pub backpressure_threshold: Option<usize>,
    /// Interval of the client-side keep-alive ticker.
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Queue-depth sampling interval; sampling is off when unset.
    #[serde(default)]
    pub queue_depth_interval_ms: Option<u64>,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// PEM bundle of CA certificates to trust in addition to the system roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_virtual_host() -> String { "/".to_string() }
fn default_connection_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 5000 }
fn default_socket_timeout_ms() -> u64 { 10000 }
fn default_locale() -> String { "en_US".to_string() }
fn default_keep_alive_interval_ms() -> u64 { 50000 }
fn default_connection_name() -> String { "rabbit-worker".to_string() }

impl ConnectionSettings {
    pub fn new(username: &str, password: &str) -> Self {
        ConnectionSettings {
            host: default_host(),
            port: default_port(),
            virtual_host: default_virtual_host(),
            username: username.to_string(),
            password: password.to_string(),
            channel_max: None,
            frame_max: None,
            heartbeat_interval: None,
            tls: TlsSettings::default(),
            connection_attempts: default_connection_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            locale: default_locale(),
            backpressure_threshold: None,
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            queue_depth_interval_ms: None,
            connection_name: default_connection_name(),
        }
    }

    /// Parses settings from a JSON document and validates them.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: ConnectionSettings = serde_json::from_str(json)
            .map_err(|e| RabbitMQError::ConfigError(format!("invalid connection settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings that can never produce a working connection.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(RabbitMQError::ConfigError("username cannot be empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(RabbitMQError::ConfigError("password cannot be empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(RabbitMQError::ConfigError("host cannot be empty".to_string()));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(RabbitMQError::ConfigError(
                "keep_alive_interval_ms must be positive".to_string(),
            ));
        }
        if self.queue_depth_interval_ms == Some(0) {
            return Err(RabbitMQError::ConfigError(
                "queue_depth_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn queue_depth_interval(&self) -> Option<Duration> {
        self.queue_depth_interval_ms.map(Duration::from_millis)
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.connection_attempts.max(1)
    }

    /// Builds the AMQP URI understood by the broker client.
    pub fn amqp_uri(&self) -> String {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        let mut query = Vec::new();
        if let Some(heartbeat) = self.heartbeat_interval {
            query.push(format!("heartbeat={}", heartbeat));
        }
        if let Some(channel_max) = self.channel_max {
            query.push(format!("channel_max={}", channel_max));
        }
        if let Some(frame_max) = self.frame_max {
            query.push(format!("frame_max={}", frame_max));
        }
        query.push(format!("connection_timeout={}", self.socket_timeout_ms));

        let uri = format!(
            "{}://{}:{}@{}:{}/{}?{}",
            scheme,
            encode_component(&self.username),
            encode_component(&self.password),
            self.host,
            self.port,
            encode_component(&self.virtual_host),
            query.join("&")
        );
        debug!(host = %self.host, port = self.port, vhost = %self.virtual_host, "Built AMQP URI");
        uri
    }

    /// Same as [`amqp_uri`](Self::amqp_uri) with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        format!(
            "{}://{}:***@{}:{}/{}",
            scheme,
            self.username,
            self.host,
            self.port,
            encode_component(&self.virtual_host)
        )
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02x}", byte)),
        }
    }
    encoded
}
