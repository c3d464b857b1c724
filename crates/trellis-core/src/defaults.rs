//! Centralized default constants for the trellis engine.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// EVENT BUS
// =============================================================================

/// Listener count above which the event bus logs a one-time leak warning.
///
/// Forgotten unsubscribes are the usual cause; the warning re-arms once the
/// count drops back under the threshold so it fires at most once per excursion.
pub const EVENT_BUS_LEAK_THRESHOLD: usize = 50;

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Default mutation debounce window in milliseconds (0 = process inline).
pub const SUBSCRIPTION_DEBOUNCE_MS: u64 = 0;

// =============================================================================
// AUTOMATIONS
// =============================================================================

/// Maximum automation execution chain depth before the engine aborts a firing.
pub const MAX_EXECUTION_DEPTH: usize = 10;

/// Reserved `SetProperty` value substituted with the current instant.
pub const NOW_MARKER: &str = "$now";

/// System node key for the `automation` supertag.
pub const SYS_AUTOMATION_TAG: &str = "automation";

/// System node key for the field holding the JSON-encoded definition.
pub const SYS_FIELD_AUTOMATION_DEFINITION: &str = "automation.definition";

/// System node key for the field holding the JSON-encoded runtime state.
pub const SYS_FIELD_AUTOMATION_STATE: &str = "automation.state";

/// System node key for the field holding the last-fired timestamp.
pub const SYS_FIELD_AUTOMATION_LAST_FIRED: &str = "automation.last_fired";

// =============================================================================
// WEBHOOKS
// =============================================================================

/// Default maximum delivery attempts per webhook job.
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 3;

/// Base retry delay in milliseconds (doubles per attempt).
pub const WEBHOOK_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on the retry delay in milliseconds.
pub const WEBHOOK_MAX_DELAY_MS: u64 = 30_000;

/// Multiplicative jitter range applied to the backoff delay: [0, 0.3).
pub const WEBHOOK_JITTER_FACTOR: f64 = 0.3;

/// Default interval between background queue passes in milliseconds.
pub const WEBHOOK_PROCESS_INTERVAL_MS: u64 = 100;

/// Default webhook HTTP request timeout in seconds.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// How long terminal (completed/failed) jobs are retained before purging.
pub const WEBHOOK_JOB_RETENTION_SECS: i64 = 3_600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_bounds_are_consistent() {
        const {
            assert!(WEBHOOK_BASE_DELAY_MS < WEBHOOK_MAX_DELAY_MS);
            assert!(WEBHOOK_MAX_ATTEMPTS >= 1);
        }
    }

    #[test]
    fn jitter_factor_is_fractional() {
        assert!(WEBHOOK_JITTER_FACTOR > 0.0 && WEBHOOK_JITTER_FACTOR < 1.0);
    }

    #[test]
    fn system_keys_are_distinct() {
        let keys = [
            SYS_AUTOMATION_TAG,
            SYS_FIELD_AUTOMATION_DEFINITION,
            SYS_FIELD_AUTOMATION_STATE,
            SYS_FIELD_AUTOMATION_LAST_FIRED,
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
