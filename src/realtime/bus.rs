//! Broadcast hub, sink workers, and the room subscription protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task;
use tracing::warn;

use super::envelope::{EventSpec, build_event_envelope, validate_room_key};
use super::sink::EventSink;
use crate::contracts::{ContractError, SocketEventEnvelope, canonical_socket_event_type};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// One fan-out unit: an envelope delivered to a specific room, or to the
/// whole namespace when `room` is `None`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomScopedEvent {
    pub room: Option<String>,
    pub envelope: Arc<SocketEventEnvelope>,
}

/// Failures at the realtime boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum RealtimeError {
    #[error("room key rejected: {room}")]
    #[diagnostic(
        code(llmctl_engine::realtime::room_key),
        help("Join/leave is restricted to the whitelisted room prefixes.")
    )]
    InvalidRoomKey { room: String },

    #[error("realtime hub closed")]
    #[diagnostic(code(llmctl_engine::realtime::closed))]
    Closed,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Contract(#[from] ContractError),
}

/// Publish-subscribe layer over the realtime namespace.
///
/// Events emitted through [`emit_contract_event`](Self::emit_contract_event)
/// are broadcast once per deduplicated room key (or once namespace-wide when
/// no rooms were supplied). Sinks attach via worker tasks started by
/// [`listen_for_events`](Self::listen_for_events), mirroring the runner-owned
/// bus lifecycle.
pub struct RealtimeBus {
    sender: broadcast::Sender<RoomScopedEvent>,
    sinks: Mutex<Vec<SinkEntry>>,
    started: AtomicBool,
    dropped_events: Arc<AtomicUsize>,
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl RealtimeBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_capacity.max(1));
        Self {
            sender,
            sinks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            dropped_events: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        let bus = Self::default();
        bus.add_sink(sink);
        bus
    }

    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.add_boxed_sink(Box::new(sink));
    }

    pub fn add_boxed_sink(&self, sink: Box<dyn EventSink>) {
        let mut sinks = self.sinks.lock();
        let mut entry = SinkEntry::new(sink);
        if self.started.load(Ordering::SeqCst) {
            entry.spawn_worker(self.sender.subscribe());
        }
        sinks.push(entry);
    }

    /// Total events dropped by lagging subscribers.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Build, sequence, and fan out one contract event.
    ///
    /// The event type is canonicalized to `domain:entity:action`; the
    /// envelope is emitted once per deduplicated room key, or broadcast on
    /// the namespace when the spec carries no rooms. Returns the envelope so
    /// callers can persist or log it.
    pub fn emit_contract_event(
        &self,
        mut spec: EventSpec,
    ) -> Result<SocketEventEnvelope, RealtimeError> {
        spec.event_type = canonical_socket_event_type(&spec.event_type)?;
        let envelope = build_event_envelope(&spec);
        let shared = Arc::new(envelope.clone());
        if shared.room_keys.is_empty() {
            self.publish(RoomScopedEvent {
                room: None,
                envelope: Arc::clone(&shared),
            })?;
        } else {
            for room in &shared.room_keys {
                self.publish(RoomScopedEvent {
                    room: Some(room.clone()),
                    envelope: Arc::clone(&shared),
                })?;
            }
        }
        Ok(envelope)
    }

    fn publish(&self, event: RoomScopedEvent) -> Result<(), RealtimeError> {
        // A send error only means no subscribers are currently attached;
        // sinks may start later, so this is not a bus failure.
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Join the given rooms. Every key must carry a whitelisted prefix.
    pub fn subscribe(&self, rooms: &[String]) -> Result<RoomSubscription, RealtimeError> {
        let mut joined = FxHashSet::default();
        for room in rooms {
            if !validate_room_key(room) {
                return Err(RealtimeError::InvalidRoomKey { room: room.clone() });
            }
            joined.insert(room.clone());
        }
        Ok(RoomSubscription {
            receiver: self.sender.subscribe(),
            rooms: joined,
            dropped_events: Arc::clone(&self.dropped_events),
        })
    }

    /// Namespace-wide subscription (no room filter).
    #[must_use]
    pub fn subscribe_all(&self) -> RoomSubscription {
        RoomSubscription {
            receiver: self.sender.subscribe(),
            rooms: FxHashSet::default(),
            dropped_events: Arc::clone(&self.dropped_events),
        }
    }

    /// Start one worker task per registered sink. Idempotent.
    pub fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock();
        for entry in sinks.iter_mut() {
            entry.spawn_worker(self.sender.subscribe());
        }
    }

    /// Stop all sink workers, waiting for in-flight events to flush.
    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<SinkWorker> = {
            let mut sinks = self.sinks.lock();
            sinks.iter_mut().filter_map(SinkEntry::take_worker).collect()
        };
        for worker in workers {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }
}

fn record_lag(dropped_events: &AtomicUsize, missed: u64) {
    let increment = usize::try_from(missed).unwrap_or(usize::MAX);
    let total = dropped_events
        .fetch_add(increment, Ordering::Relaxed)
        .saturating_add(increment);
    warn!(
        target: "llmctl_engine::realtime",
        missed,
        total_dropped = total,
        "realtime stream lagged; dropped events"
    );
}

/// Filtered receiver bound to a set of joined rooms.
pub struct RoomSubscription {
    receiver: broadcast::Receiver<RoomScopedEvent>,
    rooms: FxHashSet<String>,
    dropped_events: Arc<AtomicUsize>,
}

impl RoomSubscription {
    /// Receive the next event visible to this subscription.
    ///
    /// Namespace broadcasts (no room) are always visible; room-scoped events
    /// only when the room was joined (or when subscribed namespace-wide).
    pub async fn recv(&mut self) -> Result<RoomScopedEvent, RealtimeError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    let visible = match &event.room {
                        None => true,
                        Some(room) => self.rooms.is_empty() || self.rooms.contains(room),
                    };
                    if visible {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    record_lag(&self.dropped_events, missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RealtimeError::Closed),
            }
        }
    }

    /// Join additional rooms on an existing subscription.
    pub fn join(&mut self, rooms: &[String]) -> Result<(), RealtimeError> {
        for room in rooms {
            if !validate_room_key(room) {
                return Err(RealtimeError::InvalidRoomKey { room: room.clone() });
            }
        }
        for room in rooms {
            self.rooms.insert(room.clone());
        }
        Ok(())
    }

    /// Leave rooms; unknown keys are ignored, invalid ones rejected.
    pub fn leave(&mut self, rooms: &[String]) -> Result<(), RealtimeError> {
        for room in rooms {
            if !validate_room_key(room) {
                return Err(RealtimeError::InvalidRoomKey { room: room.clone() });
            }
        }
        for room in rooms {
            self.rooms.remove(room);
        }
        Ok(())
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.iter().cloned().collect()
    }
}

struct SinkEntry {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    worker: Option<SinkWorker>,
}

impl SinkEntry {
    fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            worker: None,
        }
    }

    fn spawn_worker(&mut self, mut receiver: broadcast::Receiver<RoomScopedEvent>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = receiver.recv() => match event {
                        Ok(event) => {
                            let mut guard = sink.lock();
                            if let Err(err) = guard.handle(&event) {
                                warn!(
                                    target: "llmctl_engine::realtime",
                                    sink = %guard.name(),
                                    error = %err,
                                    "realtime sink error"
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
        self.worker = Some(SinkWorker {
            shutdown: shutdown_tx,
            handle,
        });
    }

    fn take_worker(&mut self) -> Option<SinkWorker> {
        self.worker.take()
    }
}

struct SinkWorker {
    shutdown: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Drop for RealtimeBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            let mut sinks = self.sinks.lock();
            for entry in sinks.iter_mut() {
                if let Some(worker) = entry.take_worker() {
                    let _ = worker.shutdown.send(());
                    worker.handle.abort();
                }
            }
        }
    }
}
