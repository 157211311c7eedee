// src/rabbitmq/heartbeat.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::events::{Event, EventSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickKind {
    KeepAlive,
    QueueDepth,
}

impl TickKind {
    fn event(self) -> Event {
        match self {
            TickKind::KeepAlive => Event::KeepAlive,
            TickKind::QueueDepth => Event::SampleQueueDepth,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TickKind::KeepAlive => "heartbeat",
            TickKind::QueueDepth => "queue-depth",
        }
    }
}

#[derive(Debug, Default)]
struct TickerShared {
    enabled: AtomicBool,
    quit: AtomicBool,
    wake: Notify,
}

/// Background task that injects an event into the connection loop on a fixed interval
/// while enabled. It never touches the transport itself.
#[derive(Debug)]
pub struct Ticker {
    kind: TickKind,
    interval: Duration,
    shared: Arc<TickerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Keep-alive ticker; injects [`Event::KeepAlive`].
    pub fn heartbeat(interval: Duration) -> Self {
        Self::new(TickKind::KeepAlive, interval)
    }

    /// Queue-depth sampler; injects [`Event::SampleQueueDepth`].
    pub fn queue_depth(interval: Duration) -> Self {
        Self::new(TickKind::QueueDepth, interval)
    }

    fn new(kind: TickKind, interval: Duration) -> Self {
        Ticker {
            kind,
            interval,
            shared: Arc::new(TickerShared::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        debug!(ticker = self.kind.name(), "Ticker enabled");
        self.shared.enabled.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        debug!(ticker = self.kind.name(), "Ticker paused");
        self.shared.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Spawns the ticker task. Calling it again while a task is alive is a no-op.
    pub fn spawn(&self, events: EventSender) {
        let mut handle = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        self.shared.quit.store(false, Ordering::Release);
        let shared = self.shared.clone();
        let kind = self.kind;
        let interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            debug!(ticker = kind.name(), interval_ms = interval.as_millis() as u64, "Ticker started");
            loop {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if shared.quit.load(Ordering::Acquire) {
                    break;
                }
                if !shared.enabled.load(Ordering::Acquire) {
                    continue;
                }
                trace!(ticker = kind.name(), "Tick");
                if !events.inject(kind.event()) {
                    break;
                }
            }
            debug!(ticker = kind.name(), "Ticker stopped");
        }));
    }

    /// Stops the task for good and disables further ticks.
    pub fn shutdown(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
