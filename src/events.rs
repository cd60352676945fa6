//! Controller events and the sinks that receive them.

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Number of events retained by [`MemorySink`].
pub const MEMORY_SINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Door,
    Flood,
    Temp,
    Sensor,
    Manual,
    Strike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_ms: u64,
    pub event_type: EventType,
    pub severity: Severity,
    pub message: String,
    pub channel: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: wall_clock_ms(),
            event_type,
            severity,
            message: message.into(),
            channel: None,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Milliseconds since the Unix epoch; zero if the clock is before 1970.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Receives controller events. Called from the tick thread, so
/// implementations must not block for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let channel = event.channel.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info => {
                info!(event_type = ?event.event_type, channel, "{}", event.message);
            }
            Severity::Warning => {
                warn!(event_type = ?event.event_type, channel, "{}", event.message);
            }
            Severity::Critical => {
                error!(event_type = ?event.event_type, channel, "{}", event.message);
            }
        }
    }
}

/// Forwards events to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Keeps the most recent events in a fixed ring.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<HistoryBuffer<Event, MEMORY_SINK_CAPACITY>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        let buffer = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.oldest_ordered().cloned().collect()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear(&self) {
        let mut buffer = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        let mut buffer = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.write(event);
    }
}

/// Delivers each event to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
