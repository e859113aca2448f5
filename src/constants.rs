//! Application-wide constants for fiscgate.
//!
//! This module centralizes the protocol and tuning constants so that the
//! client, server and codec agree on defaults. Constants are grouped by
//! domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timers**: connect/read/idle/heartbeat defaults
//! - **Reconnect**: retry policy defaults
//! - **Framing**: length-prefix bounds
//! - **Protocol**: MTI and field-70 discriminators the core interprets

use std::time::Duration;

// ============================================================================
// Timers
// ============================================================================

/// TCP connect timeout for a single endpoint attempt.
///
/// Applies per endpoint: a dual-channel connect with a backup configured may
/// spend up to four of these before reporting failure.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a `send_and_receive` waiting on the switch.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write-idle interval on the send socket.
///
/// The receive socket is considered dead after twice this long without
/// inbound bytes; the heartbeat scheduler fires at this cadence.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat echo interval while signed on.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a heartbeat echo response.
///
/// Deliberately shorter than the normal read timeout: a slow echo should
/// warn long before real traffic would give up.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnect policy
// ============================================================================

/// Fixed delay between reconnect attempts for a failed side.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Reconnect attempts per failure before the side is left DISCONNECTED.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;

/// Jitter added to each reconnect delay, in milliseconds.
///
/// Keeps a fleet of FEPs from hammering the switch in lockstep after an
/// outage.
pub const RECONNECT_JITTER_MS: u64 = 500;

// ============================================================================
// Framing
// ============================================================================

/// Largest frame body the decoder will accept before resyncing.
pub const DEFAULT_MAX_FRAME: usize = 8192;

/// Smallest plausible frame body: a 4-byte ASCII MTI plus an 8-byte primary
/// bitmap. Anything shorter cannot be an ISO 8583 message.
pub const DEFAULT_MIN_FRAME: usize = 12;

// ============================================================================
// Server queues
// ============================================================================

/// Bounded response-queue capacity between handlers and the dispatcher.
pub const DEFAULT_RESPONSE_QUEUE_CAPACITY: usize = 1024;

/// Bounded inspection-queue capacity for received-request records.
pub const DEFAULT_INSPECTION_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// Protocol discriminators
// ============================================================================

/// Network-management code (field 70) for sign-on.
pub const NETMGMT_SIGN_ON: &str = "001";

/// Network-management code (field 70) for sign-off.
pub const NETMGMT_SIGN_OFF: &str = "002";

/// Network-management code (field 70) for echo test.
pub const NETMGMT_ECHO: &str = "301";

/// Response code (field 39) for approval.
pub const RESPONSE_APPROVED: &str = "00";

/// Response code for an invalid transaction (no handler registered).
pub const RESPONSE_INVALID_TRANSACTION: &str = "12";

/// Default response code when the validation callback rejects a request.
pub const RESPONSE_VALIDATION_ERROR: &str = "30";

/// Response code when a handler fails.
pub const RESPONSE_SYSTEM_MALFUNCTION: &str = "96";

/// STAN space: field 11 is six decimal digits.
pub const STAN_MODULUS: u32 = 1_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_values_are_reasonable() {
        // Heartbeat must answer faster than normal traffic gives up
        assert!(DEFAULT_HEARTBEAT_TIMEOUT < DEFAULT_READ_TIMEOUT);
        // Connect attempts should not starve the retry loop
        assert!(DEFAULT_CONNECT_TIMEOUT <= DEFAULT_RETRY_DELAY * 2);
    }

    #[test]
    fn test_frame_bounds_ordered() {
        assert!(DEFAULT_MIN_FRAME < DEFAULT_MAX_FRAME);
    }
}
