// src/rabbitmq/events.rs
//
// Everything that reaches the connection event loop travels through one unbounded
// channel. Transport callbacks stamp their events with the generation of the
// connection that produced them so the loop can drop leftovers from a torn-down
// connection.

use tokio::sync::mpsc;
use tracing::trace;

use crate::message::{OutgoingMessage, RawDelivery};

use super::publisher::ConfirmOutcome;

#[derive(Debug)]
pub enum Event {
    ConnectionClosed { generation: u64, reason: String },
    ChannelClosed { generation: u64, reason: String },
    ConsumerCancelled { generation: u64, consumer_tag: String },
    Delivery { generation: u64, delivery: RawDelivery },
    Confirmation {
        generation: u64,
        delivery_tag: u64,
        multiple: bool,
        outcome: ConfirmOutcome,
    },
    Publish(OutgoingMessage),
    KeepAlive,
    SampleQueueDepth,
    Stop,
}

impl Event {
    /// Generation of the transport that raised the event, if it came from one.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Event::ConnectionClosed { generation, .. }
            | Event::ChannelClosed { generation, .. }
            | Event::ConsumerCancelled { generation, .. }
            | Event::Delivery { generation, .. }
            | Event::Confirmation { generation, .. } => Some(*generation),
            Event::Publish(_) | Event::KeepAlive | Event::SampleQueueDepth | Event::Stop => None,
        }
    }
}

/// Thread-safe injection hook into the event loop.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Returns `false` once the event loop has gone away.
    pub fn inject(&self, event: Event) -> bool {
        trace!(?event, "Injecting event");
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn for_generation(&self, generation: u64) -> TransportEvents {
        TransportEvents {
            generation,
            sender: self.clone(),
        }
    }
}

/// The event sink handed to one transport; stamps every event with its generation.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: u64,
    sender: EventSender,
}

impl TransportEvents {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_closed(&self, reason: impl Into<String>) {
        self.sender.inject(Event::ConnectionClosed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    pub fn channel_closed(&self, reason: impl Into<String>) {
        self.sender.inject(Event::ChannelClosed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    pub fn consumer_cancelled(&self, consumer_tag: impl Into<String>) {
        self.sender.inject(Event::ConsumerCancelled {
            generation: self.generation,
            consumer_tag: consumer_tag.into(),
        });
    }

    pub fn delivery(&self, delivery: RawDelivery) {
        self.sender.inject(Event::Delivery {
            generation: self.generation,
            delivery,
        });
    }

    pub fn confirmation(&self, delivery_tag: u64, multiple: bool, outcome: ConfirmOutcome) {
        self.sender.inject(Event::Confirmation {
            generation: self.generation,
            delivery_tag,
            multiple,
            outcome,
        });
    }
}
