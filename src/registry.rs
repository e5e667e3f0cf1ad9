//! Process-wide fallback/trace registry (C11).
//!
//! Every invocation of the compatibility shim increments a counter keyed by
//! a structured reason tag (`unsupported-operator:$name`, `advanced-lookup`,
//! `megamorphic-expr`). Registry state is global by design; tests reset it
//! at case boundaries.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::Serialize;

static REGISTRY: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

fn store() -> &'static Mutex<HashMap<String, u64>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Clears all recorded fallback counts. Call at test boundaries.
pub fn reset() {
    store().lock().clear();
}

/// Records one occurrence of `reason`.
pub fn record(reason: &str) {
    let mut guard = store().lock();
    *guard.entry(reason.to_string()).or_insert(0) += 1;
    tracing::debug!(reason, "fallback recorded");
}

/// Total number of recorded fallbacks across all reasons.
pub fn count() -> u64 {
    store().lock().values().sum()
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackAnalysis {
    pub total_fallbacks: u64,
    pub by_reason: HashMap<String, u64>,
}

/// Snapshot of the registry's current state.
pub fn analysis() -> FallbackAnalysis {
    let guard = store().lock();
    FallbackAnalysis {
        total_fallbacks: guard.values().sum(),
        by_reason: guard.clone(),
    }
}

/// Reason tag for an unsupported top-level operator.
pub fn unsupported_operator_reason(name: &str) -> String {
    format!("unsupported-operator:{name}")
}

pub const ADVANCED_LOOKUP_REASON: &str = "advanced-lookup";
pub const MEGAMORPHIC_EXPR_REASON: &str = "megamorphic-expr";

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test_helper::serialized;

    #[test]
    fn record_and_analysis() {
        serialized(|| {
            reset();
            record(&unsupported_operator_reason("$function"));
            record(&unsupported_operator_reason("$function"));
            record(ADVANCED_LOOKUP_REASON);

            let a = analysis();
            assert_eq!(a.total_fallbacks, 3);
            assert_eq!(a.by_reason[&unsupported_operator_reason("$function")], 2);
            assert_eq!(count(), 3);
            reset();
            assert_eq!(count(), 0);
        });
    }
}

/// Tiny in-crate helper to serialize tests against the global registry
/// without pulling in an external crate just for a process-wide mutex.
#[cfg(test)]
mod serial_test_helper {
    use parking_lot::Mutex;
    static LOCK: Mutex<()> = Mutex::new(());

    pub fn serialized<F: FnOnce()>(f: F) {
        let _guard = LOCK.lock();
        f();
    }
}
