//! Application-wide constants for sublink.
//!
//! This module centralizes timing defaults and the fixed strings that make
//! up the outbound event vocabulary. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Timing**: Debounce, liveness and reconnect defaults
//! - **Endpoint**: Default broker address
//! - **Events**: Event kind, channel sentinel and status strings

use std::time::Duration;

// ============================================================================
// Timing
// ============================================================================

/// Delay before a CONNECT or DISCONNECT command takes effect.
///
/// A newer command arriving inside this window replaces the pending one,
/// so a burst of toggles collapses to the last request.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Delay between a confirmed subscription and the first liveness probe.
pub const LIVENESS_START_DELAY: Duration = Duration::from_secs(1);

/// Interval between liveness probes while subscribed.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Fixed delay before a failure-triggered reconnect attempt.
///
/// Attempts repeat at this interval with no growth and no cap until a
/// subscription succeeds or the caller disconnects.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound on opening a single transport connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Endpoint
// ============================================================================

/// Broker host used for publishes before any CONNECT has been received.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Broker port used for publishes before any CONNECT has been received.
pub const DEFAULT_PORT: u16 = 6379;

// ============================================================================
// Events
// ============================================================================

/// Kind tag carried by every outbound event.
pub const EVENT_KIND: &str = "REDIS";

/// Channel name for events not tied to a specific subscription.
pub const UNKNOWN_CHANNEL: &str = "UNKNOWN";

/// Payload substituted when a SEND command arrives without data.
pub const NO_DATA_PLACEHOLDER: &str = "no data to send";

/// Status emitted when opening or holding a subscription fails.
pub const STATUS_FAIL_TO_CONNECT: &str = "fail to connect";

/// Status emitted when the liveness probe fails.
pub const STATUS_FAIL_TO_RECONNECT: &str = "fail to reconnect";

/// Status emitted whenever a reconnect has been scheduled.
pub const STATUS_TRY_TO_RECONNECT: &str = "try to reconnect";

/// Status emitted when a one-shot publish fails.
pub const STATUS_FAIL_TO_SEND: &str = "fail to send";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_values_are_ordered() {
        // Debounce must settle well before the first probe, and probes must
        // run more often than reconnects so loss is noticed before retrying.
        assert!(DEFAULT_DEBOUNCE < LIVENESS_START_DELAY);
        assert!(LIVENESS_START_DELAY < DEFAULT_LIVENESS_INTERVAL);
        assert!(DEFAULT_LIVENESS_INTERVAL < RECONNECT_BACKOFF);
    }

    #[test]
    fn test_connect_timeout_is_shorter_than_backoff() {
        assert!(CONNECT_TIMEOUT < RECONNECT_BACKOFF);
    }

    #[test]
    fn test_event_vocabulary() {
        assert_eq!(EVENT_KIND, "REDIS");
        assert_eq!(UNKNOWN_CHANNEL, "UNKNOWN");
        assert!(!NO_DATA_PLACEHOLDER.is_empty());
    }
}
