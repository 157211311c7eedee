// src/rabbitmq/registry.rs

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::ConnectionSettings;

use super::amqp_client::Connector;
use super::connection::Connection;
use super::consumer::ConsumerConfig;
use super::errors::Result;
use super::lapin_client::LapinConnector;
use super::publisher::{Publisher, PublisherConfig};
use super::state::ConnectionState;
use super::topology::Topology;

/// Hands out the single connection of a process (or of a test). The same
/// connection is returned until it is torn down or has reached `Closed`.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<Arc<Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(LapinConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        ConnectionRegistry {
            connector,
            slot: Mutex::new(None),
        }
    }

    /// Returns the live connection, creating it from `settings` and `topology` on the
    /// first call. Arguments passed once a connection exists are ignored.
    pub fn get_or_init(
        &self,
        settings: ConnectionSettings,
        topology: Topology,
    ) -> Result<Arc<Connection>> {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = slot.as_ref() {
            if existing.state() != ConnectionState::Closed {
                if existing.settings() != &settings || existing.topology() != &topology {
                    debug!("Connection already exists, ignoring new parameters");
                }
                return Ok(existing.clone());
            }
            debug!("Previous connection is closed, creating a new one");
        }

        let connection = Connection::with_connector(settings, topology, self.connector.clone())?;
        info!(uri = %connection.settings().redacted_uri(), "Created process connection");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    pub fn get(&self) -> Option<Arc<Connection>> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stops and forgets the current connection.
    pub fn teardown(&self) {
        let connection = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(connection) = connection {
            info!("Tearing down process connection");
            connection.stop();
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection", &self.get())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Consumer,
    Publisher,
}

impl std::str::FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "consumer" => Ok(HandlerKind::Consumer),
            "publisher" => Ok(HandlerKind::Publisher),
            other => Err(format!("unknown handler kind `{}`", other)),
        }
    }
}

/// What to build.
#[derive(Debug, Clone)]
pub enum HandlerSpec {
    Consumer(ConsumerConfig),
    Publisher(PublisherConfig),
}

impl HandlerSpec {
    pub fn kind(&self) -> HandlerKind {
        match self {
            HandlerSpec::Consumer(_) => HandlerKind::Consumer,
            HandlerSpec::Publisher(_) => HandlerKind::Publisher,
        }
    }
}

/// What got built. Consumers have no handle of their own; they live inside the
/// connection's event loop.
#[derive(Debug, Clone)]
pub enum MessageHandler {
    Consumer { queue: String },
    Publisher(Publisher),
}

impl MessageHandler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            MessageHandler::Consumer { .. } => HandlerKind::Consumer,
            MessageHandler::Publisher(_) => HandlerKind::Publisher,
        }
    }

    pub fn into_publisher(self) -> Option<Publisher> {
        match self {
            MessageHandler::Publisher(publisher) => Some(publisher),
            MessageHandler::Consumer { .. } => None,
        }
    }
}

pub struct HandlerFactory;

impl HandlerFactory {
    /// Attaches the handler to `connection`. Must happen before the connection runs.
    pub fn create(connection: &Connection, handler: HandlerSpec) -> Result<MessageHandler> {
        debug!(kind = ?handler.kind(), "Creating handler");
        match handler {
            HandlerSpec::Consumer(config) => {
                let queue = config.queue.clone();
                connection.register_consumer(config)?;
                Ok(MessageHandler::Consumer { queue })
            }
            HandlerSpec::Publisher(config) => {
                let publisher = connection.register_publisher(config)?;
                Ok(MessageHandler::Publisher(publisher))
            }
        }
    }
}
