//! Process-wide idempotency registry for dispatch and replay keys.
//!
//! A single mutex-guarded set shared by the whole deployment process.
//! First-write-wins: [`register_dispatch_key`] returns `true` only for the
//! first caller to present a key. There is no TTL; callers that need expiry
//! encode it into the key, and the set clears only at process restart (or via
//! [`clear_dispatch_registry`] in tests).
//!
//! This is one of exactly two sanctioned globals in the engine; the other is
//! the realtime sequence counter map in [`crate::realtime`].

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::OnceLock;

static DISPATCH_REGISTRY: OnceLock<Mutex<FxHashSet<String>>> = OnceLock::new();

fn registry() -> &'static Mutex<FxHashSet<String>> {
    DISPATCH_REGISTRY.get_or_init(|| Mutex::new(FxHashSet::default()))
}

/// Register a dispatch key.
///
/// Returns `true` iff the key was not previously present; the corresponding
/// dispatch must occur exactly once, on the caller that observed `true`.
pub fn register_dispatch_key(key: &str) -> bool {
    registry().lock().insert(key.to_string())
}

/// Returns `true` if the key has already been registered.
#[must_use]
pub fn dispatch_key_seen(key: &str) -> bool {
    registry().lock().contains(key)
}

/// Number of registered keys. Diagnostic only.
#[must_use]
pub fn dispatch_registry_len() -> usize {
    registry().lock().len()
}

/// Clear the registry. Test-only escape hatch; production deployments rely on
/// process restart.
pub fn clear_dispatch_registry() {
    registry().lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins() {
        clear_dispatch_registry();
        assert!(register_dispatch_key("k1"));
        assert!(!register_dispatch_key("k1"));
        assert!(dispatch_key_seen("k1"));
        assert!(!dispatch_key_seen("k2"));
    }

    #[test]
    fn clear_resets_the_set() {
        clear_dispatch_registry();
        assert!(register_dispatch_key("transient"));
        clear_dispatch_registry();
        assert!(register_dispatch_key("transient"));
    }
}
