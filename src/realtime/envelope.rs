//! Envelope construction, room-key helpers, and sequence counters.

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::contracts::{CONTRACT_VERSION, RunMetadata, SocketEventEnvelope};
use crate::utils::id_generator::IdGenerator;

/// Room-key prefixes accepted by both the subscribe validator and the
/// builders below. Extending the realtime surface means extending this list
/// exactly once.
pub const ROOM_KEY_PREFIXES: [&str; 7] = [
    "task",
    "run",
    "flowchart",
    "flowchart_run",
    "flowchart_node",
    "thread",
    "download_job",
];

/// Returns `true` when a room key carries a whitelisted prefix.
#[must_use]
pub fn validate_room_key(room: &str) -> bool {
    match room.split_once(':') {
        Some((prefix, suffix)) => {
            !suffix.trim().is_empty() && ROOM_KEY_PREFIXES.contains(&prefix)
        }
        None => false,
    }
}

/// Build a `prefix:id` room key; `None` for blank ids.
#[must_use]
pub fn room_key(prefix: &str, value: Option<&str>) -> Option<String> {
    let suffix = value?.trim();
    if suffix.is_empty() {
        None
    } else {
        Some(format!("{prefix}:{suffix}"))
    }
}

/// Deduplicate room keys across groups, preserving first-seen order.
#[must_use]
pub fn combine_room_keys(groups: &[&[Option<String>]]) -> Vec<String> {
    let mut unique = Vec::new();
    for group in groups {
        for room in group.iter().flatten() {
            let room = room.trim();
            if room.is_empty() || unique.iter().any(|seen: &String| seen == room) {
                continue;
            }
            unique.push(room.to_string());
        }
    }
    unique
}

/// Rooms scoped to a flowchart, its run, and the active node.
#[must_use]
pub fn flowchart_scope_rooms(
    flowchart_id: Option<i64>,
    flowchart_run_id: Option<i64>,
    flowchart_node_id: Option<i64>,
) -> Vec<String> {
    let rooms = [
        room_key("flowchart", flowchart_id.map(|id| id.to_string()).as_deref()),
        room_key(
            "flowchart_run",
            flowchart_run_id.map(|id| id.to_string()).as_deref(),
        ),
        room_key(
            "flowchart_node",
            flowchart_node_id.map(|id| id.to_string()).as_deref(),
        ),
    ];
    combine_room_keys(&[&rooms])
}

/// Rooms scoped to a task execution inside a flowchart run.
#[must_use]
pub fn task_scope_rooms(
    task_id: Option<i64>,
    run_id: Option<i64>,
    flowchart_id: Option<i64>,
    flowchart_run_id: Option<i64>,
    flowchart_node_id: Option<i64>,
) -> Vec<String> {
    let rooms = [
        room_key("task", task_id.map(|id| id.to_string()).as_deref()),
        room_key("run", run_id.map(|id| id.to_string()).as_deref()),
        room_key("flowchart", flowchart_id.map(|id| id.to_string()).as_deref()),
        room_key(
            "flowchart_run",
            flowchart_run_id.map(|id| id.to_string()).as_deref(),
        ),
        room_key(
            "flowchart_node",
            flowchart_node_id.map(|id| id.to_string()).as_deref(),
        ),
    ];
    combine_room_keys(&[&rooms])
}

// Sequence counters are the second (and last) sanctioned global; see
// `crate::idempotency` for the first.
static SEQUENCE_COUNTERS: OnceLock<Mutex<FxHashMap<String, u64>>> = OnceLock::new();

fn counters() -> &'static Mutex<FxHashMap<String, u64>> {
    SEQUENCE_COUNTERS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Next sequence number for a stream; strictly monotonic per process.
pub fn next_sequence(stream_key: &str) -> u64 {
    let mut guard = counters().lock();
    let entry = guard.entry(stream_key.to_string()).or_insert(0);
    *entry += 1;
    *entry
}

/// Reset all sequence streams. Test-only escape hatch.
pub fn clear_sequence_counters_for_tests() {
    counters().lock().clear();
}

/// Parameters for one contract event emission.
#[derive(Clone, Debug, Default)]
pub struct EventSpec {
    pub event_type: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub room_keys: Vec<String>,
    pub payload: Value,
    pub runtime: Option<RunMetadata>,
}

impl EventSpec {
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            room_keys: Vec::new(),
            payload: Value::Object(Map::new()),
            runtime: None,
        }
    }

    #[must_use]
    pub fn with_rooms(mut self, rooms: Vec<String>) -> Self {
        self.room_keys = rooms;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: RunMetadata) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

/// Build a sequenced envelope from an [`EventSpec`].
///
/// The stream key is `entity_kind:entity_id` when an entity id is present and
/// `event_type:global` otherwise; `event_id == idempotency_key` (a fresh
/// UUID).
#[must_use]
pub fn build_event_envelope(spec: &EventSpec) -> SocketEventEnvelope {
    let event_id = IdGenerator::new().generate_event_id();
    let entity_id = spec.entity_id.trim().to_string();
    let stream_key = if entity_id.is_empty() {
        format!("{}:global", spec.event_type)
    } else {
        format!("{}:{entity_id}", spec.entity_kind)
    };
    let sequence = next_sequence(&stream_key);
    let owned_rooms: Vec<Option<String>> =
        spec.room_keys.iter().map(|room| Some(room.clone())).collect();
    SocketEventEnvelope {
        contract_version: CONTRACT_VERSION.to_string(),
        event_id: event_id.clone(),
        idempotency_key: event_id,
        sequence,
        sequence_stream: stream_key,
        emitted_at: Utc::now(),
        event_type: spec.event_type.clone(),
        entity_kind: spec.entity_kind.clone(),
        entity_id,
        room_keys: combine_room_keys(&[&owned_rooms]),
        runtime: spec.runtime.clone(),
        payload: spec.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_keys_dedupe_across_groups() {
        let a = [room_key("flowchart", Some("1")), room_key("run", Some("2"))];
        let b = [room_key("flowchart", Some("1")), room_key("thread", Some("9"))];
        let combined = combine_room_keys(&[&a, &b]);
        assert_eq!(combined, vec!["flowchart:1", "run:2", "thread:9"]);
    }

    #[test]
    fn room_key_validation_checks_prefix_and_suffix() {
        assert!(validate_room_key("flowchart_run:12"));
        assert!(validate_room_key("download_job:abc"));
        assert!(!validate_room_key("flowchart_run:"));
        assert!(!validate_room_key("kitchen:12"));
        assert!(!validate_room_key("flowchart_run"));
    }
}
