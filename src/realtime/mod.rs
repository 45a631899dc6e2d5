//! Realtime event bus: sequenced, idempotent envelopes fanned out to rooms.
//!
//! [`RealtimeBus`] owns a broadcast hub plus pluggable sinks; envelopes are
//! built by [`envelope`] with per-stream monotonic sequence numbers and a
//! UUID `event_id` that doubles as the idempotency key. Subscription is
//! restricted to room keys whose prefix appears in [`ROOM_KEY_PREFIXES`];
//! the same constant the room-key builders consume, so the validator and the
//! builders cannot drift.

pub mod bus;
pub mod envelope;
pub mod sink;

pub use bus::{RealtimeBus, RealtimeError, RoomScopedEvent, RoomSubscription};
pub use envelope::{
    EventSpec, ROOM_KEY_PREFIXES, build_event_envelope, clear_sequence_counters_for_tests,
    combine_room_keys, flowchart_scope_rooms, next_sequence, room_key, task_scope_rooms,
    validate_room_key,
};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink};
