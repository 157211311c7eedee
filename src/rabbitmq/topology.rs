// src/rabbitmq/topology.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl std::str::FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default = "default_durable")]
    pub durable: bool,
}

impl ExchangeDescriptor {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        ExchangeDescriptor {
            name: name.to_string(),
            kind,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    pub routing_key: String,
}

impl QueueDescriptor {
    pub fn new(name: &str, routing_key: &str) -> Self {
        QueueDescriptor {
            name: name.to_string(),
            durable: true,
            routing_key: routing_key.to_string(),
        }
    }
}

fn default_durable() -> bool {
    true
}

/// Exchange plus the queues bound to it; declared on every fresh channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub exchange: ExchangeDescriptor,
    #[serde(default)]
    pub queues: Vec<QueueDescriptor>,
}

impl Topology {
    pub fn new(exchange: ExchangeDescriptor) -> Self {
        Topology {
            exchange,
            queues: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: QueueDescriptor) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.name == name)
    }
}
