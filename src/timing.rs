//! Time source and the few time constants shared across modules.
//!
//! Execution cycles are caller-driven, so there is no scheduler cadence here;
//! only the clock and outcall budgets.

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MS: u64 = 1_000_000;

/// Wall-clock budget for one decision-engine outcall. Exceeding it turns a
/// late response into an engine failure.
pub const INFERENCE_OUTCALL_TIMEOUT_MS: u64 = 45_000;
pub const INFERENCE_OUTCALL_TIMEOUT_NS: u64 = INFERENCE_OUTCALL_TIMEOUT_MS * NANOS_PER_MS;

/// Host-safe nanosecond time source.
///
/// - `wasm32`: IC replicated time via `ic_cdk::api::time()`
/// - non-`wasm32`: wall clock fallback for native/unit tests
pub fn current_time_ns() -> u64 {
    #[cfg(target_arch = "wasm32")]
    return ic_cdk::api::time();

    #[cfg(all(not(target_arch = "wasm32"), test))]
    if let Some(override_ns) = TEST_TIME_OVERRIDE_NS.with(|slot| slot.get()) {
        return override_ns;
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_nanos().try_into().unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

pub fn current_time_secs() -> u64 {
    current_time_ns() / NANOS_PER_SEC
}

pub fn elapsed_ms(started_at_ns: u64, finished_at_ns: u64) -> u64 {
    finished_at_ns.saturating_sub(started_at_ns) / NANOS_PER_MS
}

#[cfg(all(not(target_arch = "wasm32"), test))]
thread_local! {
    static TEST_TIME_OVERRIDE_NS: std::cell::Cell<Option<u64>> = const { std::cell::Cell::new(None) };
}

#[cfg(all(not(target_arch = "wasm32"), test))]
pub fn set_test_time_ns(now_ns: u64) {
    TEST_TIME_OVERRIDE_NS.with(|slot| slot.set(Some(now_ns)));
}

#[cfg(all(not(target_arch = "wasm32"), test))]
pub fn clear_test_time_ns() {
    TEST_TIME_OVERRIDE_NS.with(|slot| slot.set(None));
}

const _: () = assert!(INFERENCE_OUTCALL_TIMEOUT_NS > NANOS_PER_SEC);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_pins_clock_until_cleared() {
        set_test_time_ns(42 * NANOS_PER_SEC);
        assert_eq!(current_time_ns(), 42 * NANOS_PER_SEC);
        assert_eq!(current_time_secs(), 42);
        clear_test_time_ns();
        assert!(current_time_secs() > 1_600_000_000);
    }

    #[test]
    fn elapsed_ms_saturates_on_clock_skew() {
        assert_eq!(elapsed_ms(5 * NANOS_PER_MS, 2 * NANOS_PER_MS), 0);
        assert_eq!(elapsed_ms(0, 1_500 * NANOS_PER_MS), 1_500);
    }
}
