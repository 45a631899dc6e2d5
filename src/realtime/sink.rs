//! Output sinks consuming room-scoped envelopes.

use parking_lot::Mutex as ParkingMutex;
use std::any::type_name;
use std::fs::File;
use std::io::{self, Result as IoResult, Write};
use std::path::Path;
use std::sync::Arc;

use super::bus::RoomScopedEvent;

/// Abstraction over an output target that consumes room-scoped envelopes.
pub trait EventSink: Send + Sync {
    /// Handle one fan-out unit (envelope plus the room it targets, if any).
    ///
    /// Implementations may perform blocking I/O; the bus runs each sink on
    /// its own worker task.
    fn handle(&mut self, event: &RoomScopedEvent) -> IoResult<()>;

    /// Stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<ParkingMutex<Vec<RoomScopedEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events; clones so callers never hold the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RoomScopedEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &RoomScopedEvent) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }
}

/// Channel sink streaming fan-out units to async consumers (SSE, sockets).
pub struct ChannelSink {
    tx: flume::Sender<RoomScopedEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<RoomScopedEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &RoomScopedEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}

/// JSON Lines sink for machine-readable structured logging.
///
/// Each fan-out unit serializes to one line:
/// `{"room": "flowchart_run:7", "envelope": {...}}`.
pub struct JsonLinesSink {
    handle: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(handle: Box<dyn Write + Send + Sync>) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, event: &RoomScopedEvent) -> IoResult<()> {
        let json = serde_json::json!({
            "room": event.room.clone(),
            "envelope": event.envelope.as_ref(),
        });
        writeln!(self.handle, "{json}")?;
        self.handle.flush()
    }

    fn name(&self) -> String {
        "JsonLinesSink".to_string()
    }
}
