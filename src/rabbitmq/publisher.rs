// src/rabbitmq/publisher.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::OutgoingMessage;

use super::errors::{RabbitMQError, Result};
use super::events::{Event, EventSender};
use super::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
}

/// One publish waiting for (or settled by) a broker confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub message_number: u64,
    /// In confirm mode the broker numbers publishes on a channel 1, 2, 3..., so the
    /// tag equals the message number for the lifetime of the channel.
    pub delivery_tag: u64,
    pub outcome: Option<ConfirmOutcome>,
}

/// Publisher counters, reset whenever a new channel is set up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub outstanding: usize,
    /// Publishes skipped because no channel was open.
    pub dropped: u64,
    /// Records still outstanding when their channel went away.
    pub abandoned: u64,
    /// Publishes that left more unconfirmed records than the backpressure threshold.
    pub backpressure_warnings: u64,
}

/// Tracks outstanding publishes for one channel lifetime.
#[derive(Debug, Default)]
pub struct ConfirmTracker {
    message_number: u64,
    outstanding: BTreeMap<u64, DeliveryRecord>,
    acked: u64,
    nacked: u64,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next sequential message number.
    pub fn next_message_number(&mut self) -> u64 {
        self.message_number += 1;
        self.message_number
    }

    pub fn track(&mut self, message_number: u64) {
        self.outstanding.insert(
            message_number,
            DeliveryRecord {
                message_number,
                delivery_tag: message_number,
                outcome: None,
            },
        );
    }

    /// Settles the record for `delivery_tag`, or every record up to and including it
    /// when `multiple` is set. Each record is returned exactly once.
    pub fn confirm(
        &mut self,
        delivery_tag: u64,
        multiple: bool,
        outcome: ConfirmOutcome,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut settled: Vec<DeliveryRecord> = if multiple {
            let remaining = match delivery_tag.checked_add(1) {
                Some(above) => self.outstanding.split_off(&above),
                None => BTreeMap::new(),
            };
            std::mem::replace(&mut self.outstanding, remaining)
                .into_values()
                .collect()
        } else {
            self.outstanding.remove(&delivery_tag).into_iter().collect()
        };

        if settled.is_empty() {
            return Err(RabbitMQError::ConfirmationMismatch(delivery_tag));
        }

        for record in settled.iter_mut() {
            record.outcome = Some(outcome);
            match outcome {
                ConfirmOutcome::Ack => self.acked += 1,
                ConfirmOutcome::Nack => self.nacked += 1,
            }
        }
        Ok(settled)
    }

    /// Forgets the current channel's records and restarts numbering. Returns how many
    /// records were abandoned unconfirmed.
    pub fn reset(&mut self) -> usize {
        let abandoned = self.outstanding.len();
        *self = Self::default();
        abandoned
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &DeliveryRecord> {
        self.outstanding.values()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn published(&self) -> u64 {
        self.message_number
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn nacked(&self) -> u64 {
        self.nacked
    }
}

/// Where and how the publisher role sends messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub exchange: String,
    pub routing_key: String,
    pub app_id: String,
    /// Enable publisher confirms on every channel.
    pub confirm_delivery: bool,
}

impl PublisherConfig {
    pub fn new(exchange: &str, routing_key: &str, app_id: &str) -> Self {
        PublisherConfig {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            app_id: app_id.to_string(),
            confirm_delivery: true,
        }
    }
}

/// The connection state as seen by publishers, plus the counter of publishes dropped
/// because no channel was ready.
#[derive(Debug, Clone)]
pub(crate) struct PublishGate {
    state: watch::Receiver<ConnectionState>,
    dropped: Arc<AtomicU64>,
}

impl PublishGate {
    pub(crate) fn new(state: watch::Receiver<ConnectionState>, dropped: Arc<AtomicU64>) -> Self {
        PublishGate { state, dropped }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }
}

/// Cloneable publishing handle. A message is handed to the event loop only if a
/// channel is ready when it is published; otherwise it is dropped on the spot.
#[derive(Debug, Clone)]
pub struct Publisher {
    events: EventSender,
    gate: PublishGate,
    config: PublisherConfig,
}

impl Publisher {
    pub(crate) fn new(events: EventSender, gate: PublishGate, config: PublisherConfig) -> Self {
        Publisher { events, gate, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes `payload` as JSON with the configured exchange and routing key.
    pub fn publish<T: Serialize>(&self, payload: &T) -> Result<()> {
        let message = OutgoingMessage::json(
            &self.config.exchange,
            &self.config.routing_key,
            &self.config.app_id,
            payload,
        )?;
        self.send(message)
    }

    pub fn publish_text(&self, body: &str) -> Result<()> {
        let message = OutgoingMessage::text(
            &self.config.exchange,
            &self.config.routing_key,
            &self.config.app_id,
            body,
        );
        self.send(message)
    }

    /// Sends `message` if the channel is ready, drops it with a warning if the
    /// connection is between channels. Fails once the connection is shutting down.
    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        let state = self.gate.state();
        if state.is_shutting_down() || self.events.is_closed() {
            return Err(RabbitMQError::PublishDropped(format!("connection is {}", state)));
        }
        if state != ConnectionState::ChannelReady {
            self.gate.record_drop();
            let err = RabbitMQError::PublishDropped(format!("connection is {}", state));
            warn!(error = %err, exchange = %message.exchange, routing_key = %message.routing_key, "Message not sent");
            return Ok(());
        }

        if self.events.inject(Event::Publish(message)) {
            Ok(())
        } else {
            Err(RabbitMQError::PublishDropped(
                "connection event loop has stopped".to_string(),
            ))
        }
    }

    /// Publishes whatever `next` produces every `interval` until it returns `None` or
    /// the connection goes away.
    pub fn publish_every<T, F>(&self, interval: Duration, mut next: F) -> JoinHandle<()>
    where
        T: Serialize + Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let publisher = self.clone();
        info!(interval_ms = interval.as_millis() as u64, "Scheduling periodic publishing");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(payload) = next() else {
                    debug!("Periodic publisher has nothing more to send");
                    return;
                };
                if let Err(e) = publisher.publish(&payload) {
                    warn!(error = %e, "Periodic publisher stopping");
                    return;
                }
            }
        })
    }
}
