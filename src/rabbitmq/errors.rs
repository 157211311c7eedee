// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

use super::state::ConnectionState;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Transport-level failure. Triggers a scheduled reconnect unless stopping.
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    /// The broker closed the channel (e.g. incompatible redeclare). Fatal for the channel.
    #[error("RabbitMQ channel protocol error: {0}")]
    ChannelProtocolError(String),

    #[error("Consumer `{0}` was cancelled")]
    ConsumerCancelled(String),

    /// Channel not ready at publish time. Logged as a warning, never raised to callers.
    #[error("Publish dropped: {0}")]
    PublishDropped(String),

    #[error("Confirmation for delivery tag {0} has no outstanding record")]
    ConfirmationMismatch(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Connection event loop is already running")]
    AlreadyRunning,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether the failure belongs to the transport and should end in a reconnect.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::TimeoutError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::ProtocolError(err) => RabbitMQError::ChannelProtocolError(err.to_string()),
            LapinError::IOError(err) => RabbitMQError::ConnectionError(err.to_string()),
            LapinError::InvalidConnectionState(state) => {
                RabbitMQError::ConnectionError(format!("invalid connection state: {:?}", state))
            }
            LapinError::InvalidChannelState(state) => {
                RabbitMQError::ChannelProtocolError(format!("invalid channel state: {:?}", state))
            }
            other => {
                // Use string representation for the remaining variants
                let error_text = other.to_string();
                if error_text.contains("connection") {
                    RabbitMQError::ConnectionError(error_text)
                } else if error_text.contains("channel") {
                    RabbitMQError::ChannelProtocolError(error_text)
                } else {
                    RabbitMQError::Unknown(error_text)
                }
            }
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<std::env::VarError> for RabbitMQError {
    fn from(err: std::env::VarError) -> Self {
        RabbitMQError::ConfigError(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}

impl From<std::io::Error> for RabbitMQError {
    fn from(err: std::io::Error) -> Self {
        RabbitMQError::ConfigError(format!("I/O error: {}", err))
    }
}
