use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use llmctl_engine::contracts::RunMetadata;
use llmctl_engine::realtime::{
    EventSpec, MemorySink, ROOM_KEY_PREFIXES, RealtimeBus, build_event_envelope, next_sequence,
    validate_room_key,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sequences_are_strictly_monotonic_without_gaps_under_concurrency() {
    let stream = "realtime-test:monotonic-stream";
    let mut handles = Vec::new();
    for _ in 0..8 {
        let stream = stream.to_string();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..50 {
                seen.push(next_sequence(&stream));
            }
            seen
        }));
    }
    let mut all: Vec<u64> = Vec::new();
    for handle in handles {
        let seen = handle.await.unwrap();
        // Per task, sequences are strictly increasing.
        for window in seen.windows(2) {
            assert!(window[0] < window[1]);
        }
        all.extend(seen);
    }
    // Across tasks, the union is exactly 1..=400 with no gaps or dupes.
    all.sort_unstable();
    let expected: Vec<u64> = (1..=400).collect();
    assert_eq!(all, expected);
}

#[test]
fn envelope_event_id_is_the_idempotency_key() {
    let envelope = build_event_envelope(
        &EventSpec::new("node:task:updated", "task", "42")
            .with_rooms(vec!["task:42".to_string()]),
    );
    assert_eq!(envelope.contract_version, "v1");
    assert_eq!(envelope.event_id, envelope.idempotency_key);
    assert_eq!(envelope.sequence_stream, "task:42");
    assert_eq!(envelope.entity_id, "42");
}

#[test]
fn envelopes_without_entity_use_a_global_stream() {
    let envelope = build_event_envelope(&EventSpec::new("config:model:created", "model", ""));
    assert_eq!(envelope.sequence_stream, "config:model:created:global");
}

#[tokio::test]
async fn emission_fans_out_once_per_deduplicated_room() {
    let sink = MemorySink::new();
    let bus = RealtimeBus::with_sink(sink.clone());
    bus.listen_for_events();

    let envelope = bus
        .emit_contract_event(
            EventSpec::new("flowchart.run.updated", "flowchart_run", "771")
                .with_rooms(vec![
                    "flowchart:9".to_string(),
                    "flowchart_run:771".to_string(),
                    "flowchart:9".to_string(),
                ])
                .with_payload(json!({"transition": "started"})),
        )
        .unwrap();

    assert_eq!(envelope.event_type, "flowchart:run:updated");
    assert_eq!(envelope.room_keys, vec!["flowchart:9", "flowchart_run:771"]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop_listener().await;

    let events = sink.snapshot();
    assert_eq!(events.len(), 2);
    let rooms: HashSet<String> = events
        .iter()
        .filter_map(|event| event.room.clone())
        .collect();
    assert!(rooms.contains("flowchart:9"));
    assert!(rooms.contains("flowchart_run:771"));
    // Both fan-out units share one envelope (one sequence, one event id).
    assert_eq!(events[0].envelope.event_id, events[1].envelope.event_id);
}

#[tokio::test]
async fn events_without_rooms_broadcast_on_the_namespace() {
    let sink = MemorySink::new();
    let bus = RealtimeBus::with_sink(sink.clone());
    bus.listen_for_events();

    bus.emit_contract_event(EventSpec::new("config.model.created", "model", "5"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop_listener().await;

    let events = sink.snapshot();
    assert_eq!(events.len(), 1);
    assert!(events[0].room.is_none());
    assert_eq!(events[0].envelope.event_type, "config:model:created");
}

#[test]
fn subscribe_rejects_rooms_outside_the_prefix_whitelist() {
    let bus = RealtimeBus::new();
    assert!(bus.subscribe(&["flowchart_run:1".to_string()]).is_ok());
    assert!(bus.subscribe(&["task:9".to_string(), "thread:2".to_string()]).is_ok());
    assert!(bus.subscribe(&["kitchen:1".to_string()]).is_err());
    assert!(bus.subscribe(&["flowchart_run:".to_string()]).is_err());
    assert!(bus.subscribe(&["flowchart_run".to_string()]).is_err());

    for prefix in ROOM_KEY_PREFIXES {
        assert!(validate_room_key(&format!("{prefix}:1")));
    }
}

#[tokio::test]
async fn subscriptions_filter_by_joined_rooms() {
    let bus = Arc::new(RealtimeBus::new());
    let mut subscription = bus.subscribe(&["flowchart_run:800".to_string()]).unwrap();

    bus.emit_contract_event(
        EventSpec::new("flowchart.run.updated", "flowchart_run", "800")
            .with_rooms(vec!["flowchart_run:800".to_string(), "flowchart:1".to_string()]),
    )
    .unwrap();
    bus.emit_contract_event(
        EventSpec::new("flowchart.run.updated", "flowchart_run", "801")
            .with_rooms(vec!["flowchart_run:801".to_string()]),
    )
    .unwrap();

    // Only the fan-out unit for the joined room arrives.
    let event = subscription.recv().await.unwrap();
    assert_eq!(event.room.as_deref(), Some("flowchart_run:800"));
    assert_eq!(event.envelope.entity_id, "800");

    // Leaving the room stops delivery; join/leave revalidate prefixes.
    assert!(subscription.leave(&["flowchart_run:800".to_string()]).is_ok());
    assert!(subscription.join(&["bogus:1".to_string()]).is_err());
}

#[tokio::test]
async fn runtime_metadata_rides_the_envelope_with_all_keys() {
    let sink = MemorySink::new();
    let bus = RealtimeBus::with_sink(sink.clone());
    bus.listen_for_events();

    let runtime = RunMetadata {
        selected_provider: Some("kubernetes".to_string()),
        final_provider: Some("kubernetes".to_string()),
        ..RunMetadata::default()
    };
    bus.emit_contract_event(
        EventSpec::new("node.task.updated", "flowchart_node", "31")
            .with_rooms(vec!["flowchart_node:31".to_string()])
            .with_runtime(runtime),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop_listener().await;

    let events = sink.snapshot();
    let serialized = serde_json::to_value(events[0].envelope.as_ref()).unwrap();
    let runtime = serialized["runtime"].as_object().unwrap();
    assert_eq!(runtime.len(), 11);
    assert_eq!(runtime["selected_provider"], "kubernetes");
    assert!(runtime["fallback_reason"].is_null());
}
