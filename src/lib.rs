// src/lib.rs
//! Reliable RabbitMQ client for worker processes: a self-healing connection that
//! consumes tasks from a competing-consumer queue and publishes results with
//! broker confirmations.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::{ConnectionSettings, TlsSettings};
pub use env::WorkerConfig;
pub use message::{Delivery, MessageProperties, OutgoingMessage, RawDelivery, WorkerMessage};
pub use rabbitmq::{
    Connection, ConnectionRegistry, ConnectionState, ConsumerConfig, HandlerFactory, HandlerSpec,
    PublisherConfig, RabbitMQError, Result, Topology,
};
