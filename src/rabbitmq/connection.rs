// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionSettings;
use crate::message::{OutgoingMessage, RawDelivery};

use super::amqp_client::{AmqpChannel, AmqpConnection, Connector};
use super::channel_manager::ChannelSetup;
use super::consumer::{ChannelHandle, ConsumerConfig, ConsumerSession};
use super::errors::{RabbitMQError, Result};
use super::events::{event_channel, Event, EventReceiver, EventSender};
use super::heartbeat::Ticker;
use super::lapin_client::LapinConnector;
use super::publisher::{
    ConfirmOutcome, ConfirmTracker, PublishGate, PublishStats, Publisher, PublisherConfig,
};
use super::state::ConnectionState;
use super::topology::{QueueDescriptor, Topology};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default)]
struct Roles {
    consumer: Option<ConsumerConfig>,
    publisher: Option<PublisherConfig>,
}

/// One logical broker connection. Cheap handle methods (`stop`, `state`, the
/// heartbeat toggles) may be called from anywhere; everything touching the
/// transport happens on the single task driving [`Connection::run`].
pub struct Connection {
    settings: ConnectionSettings,
    topology: Topology,
    connector: Arc<dyn Connector>,
    roles: Mutex<Roles>,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    events: EventSender,
    inbox: Mutex<Option<EventReceiver>>,
    stats: Mutex<PublishStats>,
    dropped: Arc<AtomicU64>,
    heartbeat: Ticker,
    sampler: Option<Ticker>,
    reconnects: AtomicU64,
}

impl Connection {
    /// Connection backed by lapin.
    pub fn new(settings: ConnectionSettings, topology: Topology) -> Result<Arc<Self>> {
        Self::with_connector(settings, topology, Arc::new(LapinConnector))
    }

    pub fn with_connector(
        settings: ConnectionSettings,
        topology: Topology,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let (events, inbox) = event_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let heartbeat = Ticker::heartbeat(settings.keep_alive_interval());
        let sampler = settings.queue_depth_interval().map(Ticker::queue_depth);

        debug!(uri = %settings.redacted_uri(), exchange = %topology.exchange.name, "Created connection");
        Ok(Arc::new(Connection {
            settings,
            topology,
            connector,
            roles: Mutex::new(Roles::default()),
            state,
            closing: AtomicBool::new(false),
            events,
            inbox: Mutex::new(Some(inbox)),
            stats: Mutex::new(PublishStats::default()),
            dropped: Arc::new(AtomicU64::new(0)),
            heartbeat,
            sampler,
            reconnects: AtomicU64::new(0),
        }))
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Waits until the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    pub fn publish_stats(&self) -> PublishStats {
        let mut stats = *lock(&self.stats);
        stats.dropped = self.dropped.load(Ordering::Acquire);
        stats
    }

    /// Reconnect attempts made after the initial connection was established.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    /// The thread-safe injection hook of the event loop.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn register_consumer(&self, config: ConsumerConfig) -> Result<()> {
        self.ensure_not_started()?;
        let mut roles = lock(&self.roles);
        if roles.consumer.is_some() {
            warn!(queue = %config.queue, "Replacing previously registered consumer");
        }
        info!(queue = %config.queue, prefetch = config.prefetch_count, "Registered consumer");
        roles.consumer = Some(config);
        Ok(())
    }

    pub fn register_publisher(&self, config: PublisherConfig) -> Result<Publisher> {
        self.ensure_not_started()?;
        info!(exchange = %config.exchange, routing_key = %config.routing_key, "Registered publisher");
        lock(&self.roles).publisher = Some(config.clone());
        Ok(Publisher::new(self.events.clone(), self.publish_gate(), config))
    }

    fn publish_gate(&self) -> PublishGate {
        PublishGate::new(self.state.subscribe(), self.dropped.clone())
    }

    pub fn start_heartbeat(&self) {
        self.heartbeat.start();
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.pause();
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.is_enabled()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Requests a graceful shutdown: cancel the consumer, close the channel, close the
    /// connection, end the loop. Further calls are no-ops.
    pub fn stop(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("Stop already requested");
            return;
        }
        info!(state = %self.state(), "Stopping connection");

        if lock(&self.inbox).is_some() {
            // run() was never called, there is no loop to drain.
            if let Err(e) = self.enter(ConnectionState::Closed) {
                warn!(error = %e, "Could not close idle connection");
            }
            return;
        }
        self.events.inject(Event::Stop);
    }

    /// Drives the connection until it is stopped. Returns an error when no handler
    /// was registered, or when the initial connection could not be established.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let inbox = lock(&self.inbox).take().ok_or(RabbitMQError::AlreadyRunning)?;

        if self.is_closing() {
            self.force_closed();
            return Ok(());
        }

        let roles = {
            let roles = lock(&self.roles);
            (roles.consumer.clone(), roles.publisher.clone())
        };
        let (consumer, publisher) = match roles {
            (None, None) => {
                let err = RabbitMQError::ConfigError(
                    "register a consumer or a publisher before running the connection".to_string(),
                );
                self.force_closed();
                return Err(err);
            }
            roles => roles,
        };

        self.heartbeat.spawn(self.events.clone());
        if let (Some(sampler), Some(_)) = (&self.sampler, &consumer) {
            sampler.spawn(self.events.clone());
            sampler.start();
        }

        let mut event_loop = EventLoop::new(self.clone(), inbox, consumer, publisher);
        let result = match event_loop.start().await {
            Ok(()) => {
                event_loop.process().await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Could not establish the initial connection");
                Err(e)
            }
        };

        self.shutdown_tickers();
        self.force_closed();
        result
    }

    fn ensure_not_started(&self) -> Result<()> {
        if lock(&self.inbox).is_none() {
            return Err(RabbitMQError::ConfigError(
                "handlers must be registered before the connection runs".to_string(),
            ));
        }
        Ok(())
    }

    /// Moves to `next` if the transition table allows it.
    fn enter(&self, next: ConnectionState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(RabbitMQError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_replace(next);
        info!(from = %current, to = %next, "Connection state changed");
        Ok(())
    }

    fn force_closed(&self) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(from = %previous, to = %ConnectionState::Closed, "Connection state changed");
        }
    }

    fn shutdown_tickers(&self) {
        self.heartbeat.shutdown();
        if let Some(sampler) = &self.sampler {
            sampler.shutdown();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.settings.redacted_uri())
            .field("state", &self.state())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum Wake {
    Event(Option<Event>),
    Reconnect,
}

/// Owns the transport, the channel and the roles. Only ever runs on one task.
struct EventLoop {
    shared: Arc<Connection>,
    inbox: EventReceiver,
    topology: Topology,
    consumer: Option<ConsumerConfig>,
    publisher: Option<PublisherConfig>,
    publisher_handle: Option<Publisher>,
    generation: u64,
    transport: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    session: Option<ConsumerSession>,
    handle: ChannelHandle,
    tracker: ConfirmTracker,
    abandoned: u64,
    backpressure_warnings: u64,
    reconnect_at: Option<Instant>,
}

impl EventLoop {
    fn new(
        shared: Arc<Connection>,
        inbox: EventReceiver,
        consumer: Option<ConsumerConfig>,
        publisher: Option<PublisherConfig>,
    ) -> Self {
        let mut topology = shared.topology.clone();
        if let Some(consumer) = &consumer {
            if topology.queue(&consumer.queue).is_none() {
                debug!(queue = %consumer.queue, "Adding consumer queue to the declared topology");
                topology
                    .queues
                    .push(QueueDescriptor::new(&consumer.queue, &consumer.queue));
            }
        }
        let publisher_handle = publisher
            .clone()
            .map(|config| Publisher::new(shared.events.clone(), shared.publish_gate(), config));

        EventLoop {
            shared,
            inbox,
            topology,
            consumer,
            publisher,
            handle: ChannelHandle::new(0, publisher_handle.clone()),
            publisher_handle,
            generation: 0,
            transport: None,
            channel: None,
            session: None,
            tracker: ConfirmTracker::new(),
            abandoned: 0,
            backpressure_warnings: 0,
            reconnect_at: None,
        }
    }

    /// Initial connection: `connection_attempts` tries spaced by the retry delay.
    async fn start(&mut self) -> Result<()> {
        let settings = &self.shared.settings;
        let attempts = settings.attempts();
        let retry_delay = settings.retry_delay();

        let mut attempt = 1;
        loop {
            if self.shared.is_closing() {
                return Ok(());
            }
            self.shared.enter(ConnectionState::Connecting)?;

            let err = match self.establish().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            self.enter_or_log(ConnectionState::Reconnecting);

            if self.shared.is_closing() {
                debug!(error = %err, "Stop requested, abandoning the initial connection");
                return Ok(());
            }
            if attempt >= attempts {
                self.shared.enter(ConnectionState::Closed)?;
                return Err(RabbitMQError::ConnectionError(format!(
                    "giving up after {} attempt(s): {}",
                    attempts, err
                )));
            }
            warn!(
                attempt,
                max_attempts = attempts,
                error = %err,
                "Failed to connect to RabbitMQ, retrying in {:?}",
                retry_delay
            );
            tokio::time::sleep(retry_delay).await;
            if self.shared.is_closing() {
                return Ok(());
            }
            attempt += 1;
        }
    }

    /// connect -> Open -> channel setup -> ChannelReady -> roles.
    async fn establish(&mut self) -> Result<()> {
        self.generation += 1;
        let events = self.shared.events.for_generation(self.generation);
        let connect = self.shared.connector.connect(&self.shared.settings, events);
        let transport = tokio::time::timeout(self.shared.settings.socket_timeout(), connect).await??;

        self.transport = Some(transport.clone());
        self.shared.enter(ConnectionState::Open)?;

        if let Err(e) = self.open_channel(transport.as_ref()).await {
            self.release_channel();
            self.close_transport("channel setup failed").await;
            return Err(e);
        }
        Ok(())
    }

    async fn open_channel(&mut self, transport: &dyn AmqpConnection) -> Result<()> {
        let channel = ChannelSetup::new(&self.topology).run(transport).await?;
        self.channel = Some(channel.clone());
        self.handle = ChannelHandle::new(channel.id(), self.publisher_handle.clone());
        self.shared.enter(ConnectionState::ChannelReady)?;

        if self.publisher.as_ref().is_some_and(|p| p.confirm_delivery) {
            channel.confirm_select().await?;
            debug!(channel_id = channel.id(), "Publisher confirms enabled");
        }
        if let Some(consumer) = &self.consumer {
            self.session = Some(ConsumerSession::subscribe(channel.as_ref(), consumer).await?);
        }
        self.sync_stats();
        Ok(())
    }

    async fn process(&mut self) {
        loop {
            let wake = match self.reconnect_at {
                Some(deadline) => tokio::select! {
                    event = self.inbox.recv() => Wake::Event(event),
                    _ = tokio::time::sleep_until(deadline) => Wake::Reconnect,
                },
                None => Wake::Event(self.inbox.recv().await),
            };

            let event = match wake {
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                    continue;
                }
                Wake::Event(Some(event)) => event,
                Wake::Event(None) => break,
            };

            if let Some(generation) = event.generation() {
                if generation != self.generation || self.transport.is_none() {
                    trace!(generation, current = self.generation, "Dropping event from a stale transport");
                    continue;
                }
            }

            let stop = matches!(event, Event::Stop);
            self.handle_event(event).await;
            self.sync_stats();
            if stop {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ConnectionClosed { reason, .. } => {
                warn!(reason = %reason, "Connection closed unexpectedly");
                self.on_transport_lost().await;
            }
            Event::ChannelClosed { reason, .. } => {
                let err = RabbitMQError::ChannelProtocolError(reason);
                warn!(error = %err, "Channel closed, closing the connection");
                self.release_channel();
                self.close_transport("channel closed").await;
                self.on_transport_lost().await;
            }
            Event::ConsumerCancelled { consumer_tag, .. } => {
                self.on_consumer_cancelled(consumer_tag).await;
            }
            Event::Delivery { delivery, .. } => self.on_delivery(delivery).await,
            Event::Confirmation {
                delivery_tag,
                multiple,
                outcome,
                ..
            } => self.on_confirmation(delivery_tag, multiple, outcome),
            Event::Publish(message) => self.publish(message).await,
            Event::KeepAlive => self.keep_alive().await,
            Event::SampleQueueDepth => self.sample_queue_depth().await,
            Event::Stop => self.shutdown().await,
        }
    }

    async fn on_consumer_cancelled(&mut self, consumer_tag: String) {
        if self.session.as_ref().map(|s| s.consumer_tag()) != Some(consumer_tag.as_str()) {
            debug!(consumer_tag = %consumer_tag, "Ignoring cancellation of an unknown consumer");
            return;
        }
        let err = RabbitMQError::ConsumerCancelled(consumer_tag);
        warn!(error = %err, "Consumer cancelled by broker, closing channel");

        self.session = None;
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close(REPLY_SUCCESS, "consumer cancelled").await {
                debug!(error = %e, "Channel was already closed");
            }
        }
        self.release_channel();
        self.close_transport("consumer cancelled").await;
        self.on_transport_lost().await;
    }

    async fn on_delivery(&mut self, delivery: RawDelivery) {
        let (Some(session), Some(channel)) = (&self.session, &self.channel) else {
            debug!(delivery_tag = delivery.delivery_tag, "Delivery without an active consumer, leaving it to the broker");
            return;
        };
        let outcome = session.dispatch(channel.as_ref(), &self.handle, delivery).await;
        trace!(?outcome, "Delivery dispatched");
    }

    fn on_confirmation(&mut self, delivery_tag: u64, multiple: bool, outcome: ConfirmOutcome) {
        match self.tracker.confirm(delivery_tag, multiple, outcome) {
            Ok(records) => {
                for record in &records {
                    match outcome {
                        ConfirmOutcome::Ack => {
                            debug!(message_number = record.message_number, "Publish confirmed")
                        }
                        ConfirmOutcome::Nack => {
                            warn!(message_number = record.message_number, "Publish rejected by broker")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, multiple, "Unexpected confirmation"),
        }
    }

    async fn publish(&mut self, message: OutgoingMessage) {
        let channel = match (&self.channel, self.shared.state()) {
            (Some(channel), ConnectionState::ChannelReady) => channel.clone(),
            (_, state) => {
                self.shared.dropped.fetch_add(1, Ordering::AcqRel);
                let err = RabbitMQError::PublishDropped(format!("connection is {}", state));
                warn!(error = %err, exchange = %message.exchange, routing_key = %message.routing_key, "Message not sent");
                return;
            }
        };

        let message_number = self.tracker.next_message_number();
        let confirming = self.publisher.as_ref().is_some_and(|p| p.confirm_delivery);
        if confirming {
            self.tracker.track(message_number);
        }

        match channel.basic_publish(&message, message_number).await {
            Ok(()) => debug!(message_number, routing_key = %message.routing_key, "Published message"),
            Err(e) if e.is_connection_level() => {
                warn!(message_number, error = %e, "Publish failed, connection lost");
                self.release_channel();
                self.close_transport("publish failed").await;
                self.on_transport_lost().await;
                return;
            }
            // Still tracked; it is counted as abandoned when the channel goes away.
            Err(e) => warn!(message_number, error = %e, "Publish failed"),
        }

        if let Some(threshold) = self.shared.settings.backpressure_threshold {
            let outstanding = self.tracker.outstanding_len();
            if outstanding > threshold {
                self.backpressure_warnings += 1;
                warn!(outstanding, threshold, "Publisher confirms are falling behind");
            }
        }
    }

    async fn keep_alive(&mut self) {
        let Some(transport) = self.transport.clone() else {
            trace!("No transport, skipping keep-alive");
            return;
        };
        match transport.keep_alive().await {
            Ok(()) => trace!("Keep-alive round trip completed"),
            Err(e) => {
                warn!(error = %e, "Keep-alive failed, reconnecting");
                self.release_channel();
                self.close_transport("keep-alive failed").await;
                self.on_transport_lost().await;
            }
        }
    }

    async fn sample_queue_depth(&mut self) {
        let (Some(channel), Some(consumer)) = (&self.channel, &self.consumer) else {
            return;
        };
        match channel.queue_declare_passive(&consumer.queue).await {
            Ok(messages) => info!(queue = %consumer.queue, messages, "Queue depth"),
            Err(e) => warn!(queue = %consumer.queue, error = %e, "Could not sample queue depth"),
        }
    }

    async fn reconnect(&mut self) {
        if self.shared.is_closing() {
            return;
        }
        let attempt = self.shared.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
        info!(attempt, "Reconnecting to RabbitMQ");

        if let Err(e) = self.shared.enter(ConnectionState::Connecting) {
            error!(error = %e, "Cannot reconnect");
            return;
        }
        match self.establish().await {
            Ok(()) => info!(attempt, "Reconnected to RabbitMQ"),
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect failed");
                self.transport = None;
                self.schedule_reconnect();
            }
        }
    }

    /// The transport is gone (or being torn down). Schedules a reconnect unless stopping.
    async fn on_transport_lost(&mut self) {
        self.release_channel();
        self.transport = None;
        if self.shared.is_closing() {
            debug!("Connection lost while stopping, not reconnecting");
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.enter_or_log(ConnectionState::Reconnecting);
        let delay = self.shared.settings.retry_delay();
        info!("Reconnecting in {:?}", delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Forgets the channel and everything bound to its lifetime.
    fn release_channel(&mut self) {
        self.session = None;
        self.channel = None;
        let abandoned = self.tracker.reset();
        if abandoned > 0 {
            warn!(abandoned, "Unconfirmed publishes lost with their channel");
            self.abandoned += abandoned as u64;
        }
    }

    async fn close_transport(&mut self, reason: &str) {
        if let Some(transport) = self.transport.take() {
            if transport.is_open() {
                if let Err(e) = transport.close(REPLY_SUCCESS, reason).await {
                    debug!(error = %e, "Error closing connection");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.shared.enter(ConnectionState::Closing) {
            debug!(error = %e, "Shutdown from a non-live state");
        }
        self.reconnect_at = None;
        self.shared.heartbeat.pause();

        if let (Some(session), Some(channel)) = (self.session.take(), &self.channel) {
            info!(consumer_tag = %session.consumer_tag(), "Cancelling consumer");
            if let Err(e) = channel.basic_cancel(session.consumer_tag()).await {
                warn!(error = %e, "Failed to cancel consumer");
            }
        }
        if let Some(channel) = self.channel.clone() {
            if channel.is_open() {
                if let Err(e) = channel.close(REPLY_SUCCESS, "Normal shutdown").await {
                    warn!(error = %e, "Failed to close channel");
                }
            }
        }
        self.release_channel();
        self.close_transport("Normal shutdown").await;

        self.shared.force_closed();
        info!("Connection stopped");
    }

    fn enter_or_log(&self, next: ConnectionState) {
        if let Err(e) = self.shared.enter(next) {
            warn!(error = %e, "Skipping state change");
        }
    }

    fn sync_stats(&self) {
        *lock(&self.shared.stats) = PublishStats {
            published: self.tracker.published(),
            acked: self.tracker.acked(),
            nacked: self.tracker.nacked(),
            outstanding: self.tracker.outstanding_len(),
            dropped: self.shared.dropped.load(Ordering::Acquire),
            abandoned: self.abandoned,
            backpressure_warnings: self.backpressure_warnings,
        };
    }
}
