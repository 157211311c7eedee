use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rabbitmq::errors::{RabbitMQError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages the broker writes to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// The subset of AMQP basic properties this client reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
    }
}

/// A delivery as handed over by the transport, body still undecoded.
#[derive(Clone, Debug)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// A delivery whose body has been decoded as UTF-8 text.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: String,
}

impl Delivery {
    pub fn decode(raw: RawDelivery) -> std::result::Result<Self, (RawDelivery, std::string::FromUtf8Error)> {
        let RawDelivery {
            delivery_tag,
            routing_key,
            redelivered,
            properties,
            data,
        } = raw;

        match String::from_utf8(data) {
            Ok(body) => Ok(Delivery {
                delivery_tag,
                routing_key,
                redelivered,
                properties,
                body,
            }),
            Err(err) => {
                let data = err.as_bytes().to_vec();
                Err((
                    RawDelivery {
                        delivery_tag,
                        routing_key,
                        redelivered,
                        properties,
                        data,
                    },
                    err,
                ))
            }
        }
    }

    /// Parses the body as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// A message queued for publishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    /// Builds a persistent JSON message stamped with `app_id`.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        app_id: &str,
        payload: &T,
    ) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::text(exchange, routing_key, app_id, body))
    }

    pub fn text(exchange: &str, routing_key: &str, app_id: &str, body: impl Into<Vec<u8>>) -> Self {
        OutgoingMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.into(),
            properties: MessageProperties {
                app_id: Some(app_id.to_string()),
                content_type: Some(JSON_CONTENT_TYPE.to_string()),
                delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
                message_id: Some(Uuid::new_v4().to_string()),
                timestamp: Some(Utc::now().timestamp() as u64),
            },
        }
    }
}

/// Envelope the worker publishes for every processed task.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl WorkerMessage {
    /// Creates a new WorkerMessage with the current timestamp and a generated UUID.
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        WorkerMessage {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: kind.to_string(),
            payload,
        }
    }
}

/// A task is usable only if it is a non-empty JSON object.
pub fn parse_task(body: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str::<serde_json::Value>(body)? {
        serde_json::Value::Object(map) if !map.is_empty() => Ok(map),
        _ => Err(RabbitMQError::Unknown(
            "task is not a non-empty JSON object".to_string(),
        )),
    }
}
