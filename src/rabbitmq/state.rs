// src/rabbitmq/state.rs

use std::fmt;

/// Lifecycle of the broker connection owned by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    ChannelReady,
    /// Waiting out the retry delay before the next `Connecting`.
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Idle, Connecting) | (Idle, Closed) => true,
            (Connecting, Open) | (Connecting, Reconnecting) | (Connecting, Closed) => true,
            (Open, ChannelReady) | (Open, Reconnecting) | (Open, Closed) => true,
            (ChannelReady, Reconnecting) => true,
            (Reconnecting, Connecting) | (Reconnecting, Closed) => true,
            (Closing, Closed) => true,
            // stop() is accepted from every live state
            (from, Closing) => !matches!(from, Idle | Closing | Closed),
            _ => false,
        }
    }

    /// A user-initiated shutdown is in progress or finished.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::ChannelReady => "channel-ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
