//! Request, correlation, and run identifier generation.

use uuid::Uuid;

/// Generates the identifier strings stamped on runtime events and traces.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Fresh request id with a stable prefix, e.g. `req-<uuid>`.
    #[must_use]
    pub fn generate_request_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    /// Fresh event/idempotency id (bare UUID string).
    #[must_use]
    pub fn generate_event_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Default request/correlation id pair for a flowchart run event.
///
/// Run-scoped events default both ids to `flowchart-run-<id>`; the request id
/// gets a unique suffix so repeated emissions stay distinguishable.
#[must_use]
pub fn flowchart_run_ids(run_id: i64) -> (String, String) {
    let correlation_id = format!("flowchart-run-{run_id}");
    let request_id = format!("{correlation_id}-{}", Uuid::new_v4().simple());
    (request_id, correlation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_share_the_correlation_prefix() {
        let (request_id, correlation_id) = flowchart_run_ids(99);
        assert_eq!(correlation_id, "flowchart-run-99");
        assert!(request_id.starts_with("flowchart-run-99"));
        assert_ne!(request_id, correlation_id);
    }
}
