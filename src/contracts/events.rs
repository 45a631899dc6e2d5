//! Socket event envelope and canonical event-type normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CONTRACT_VERSION;
use super::envelopes::{ContractError, RunMetadata};

/// Sequenced, idempotent envelope fanned out to subscribed rooms.
///
/// `event_id` doubles as the idempotency key; `sequence` is strictly
/// monotonic within `sequence_stream` for the lifetime of the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketEventEnvelope {
    pub contract_version: String,
    pub event_id: String,
    pub idempotency_key: String,
    pub sequence: u64,
    pub sequence_stream: String,
    pub emitted_at: DateTime<Utc>,
    pub event_type: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub room_keys: Vec<String>,
    pub runtime: Option<RunMetadata>,
    pub payload: Value,
}

impl SocketEventEnvelope {
    /// Contract version check helper, mostly for boundary assertions.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.contract_version == CONTRACT_VERSION
    }
}

fn normalize_segment(part: &str) -> String {
    let mut cleaned = String::with_capacity(part.len());
    let mut last_was_sep = false;
    for ch in part.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            cleaned.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            cleaned.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize an event type into its canonical `domain:entity:action` form.
///
/// Splits on `:` (or `.` when no colon is present), requires at least three
/// segments, lowercases each, collapses any non-`[a-z0-9_]` run into a single
/// `_`, strips leading/trailing underscores, and folds extra segments into
/// the action with `_`.
///
/// ```rust
/// use llmctl_engine::contracts::canonical_socket_event_type;
///
/// let canonical = canonical_socket_event_type("Node.Task.Progress.Updated").unwrap();
/// assert_eq!(canonical, "node:task:progress_updated");
/// ```
pub fn canonical_socket_event_type(event_type: &str) -> Result<String, ContractError> {
    let raw = event_type.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return Err(ContractError::EventType {
            raw: event_type.to_string(),
        });
    }
    let delimiter = if raw.contains(':') { ':' } else { '.' };
    let parts: Vec<&str> = raw
        .split(delimiter)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() < 3 {
        return Err(ContractError::EventType {
            raw: event_type.to_string(),
        });
    }

    let domain = normalize_segment(parts[0]);
    let entity = normalize_segment(parts[1]);
    let action = normalize_segment(&parts[2..].join("_"));

    let canonical = format!("{domain}:{entity}:{action}");
    let well_formed = canonical.split(':').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
    });
    if !well_formed {
        return Err(ContractError::EventType {
            raw: event_type.to_string(),
        });
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_dot_separated_mixed_case() {
        assert_eq!(
            canonical_socket_event_type("Node.Task.Progress.Updated").unwrap(),
            "node:task:progress_updated"
        );
    }

    #[test]
    fn collapses_symbol_runs_into_single_underscore() {
        assert_eq!(
            canonical_socket_event_type("flowchart:run!!:big--update").unwrap(),
            "flowchart:run:big_update"
        );
    }

    #[test]
    fn rejects_fewer_than_three_segments() {
        assert!(canonical_socket_event_type("node:task").is_err());
        assert!(canonical_socket_event_type("").is_err());
    }
}
