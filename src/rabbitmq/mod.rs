// src/rabbitmq/mod.rs
// Reliable RabbitMQ connection: state machine, channel setup, consumer and publisher roles

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod heartbeat;
pub mod lapin_client;
pub mod publisher;
pub mod registry;
pub mod state;
pub mod topology;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, AmqpConnection, Connector};
pub use channel_manager::{ChannelSetup, SetupStage};
pub use connection::Connection;
pub use consumer::{callback_fn, ChannelHandle, ConsumerConfig, ConsumerSession, DispatchOutcome, MessageCallback};
pub use errors::{RabbitMQError, Result};
pub use events::{Event, EventSender, TransportEvents};
pub use heartbeat::Ticker;
pub use lapin_client::LapinConnector;
pub use publisher::{ConfirmOutcome, ConfirmTracker, DeliveryRecord, PublishStats, Publisher, PublisherConfig};
pub use registry::{ConnectionRegistry, HandlerFactory, HandlerKind, HandlerSpec, MessageHandler};
pub use state::ConnectionState;
pub use topology::{ExchangeDescriptor, ExchangeKind, QueueDescriptor, Topology};
