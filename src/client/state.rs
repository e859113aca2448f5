//! Client state machines.
//!
//! Each socket is either up or down; the aggregate below is what callers
//! and the event layer observe. Only `SignedOn` permits normal traffic.
//!
//! ```text
//! Disconnected → Connecting → (SendOnly | ReceiveOnly) → BothConnected → SignedOn
//!      ↑              ↓                                       ↓             ↓
//!      └───── Reconnecting ←──────────────────────────────────┴─────────────┘
//!                   ↓
//!                 Failed                    Closing → Closed (terminal)
//! ```
//!
//! Unified mode collapses the two-socket product: a connected unified
//! socket reports `UnifiedConnected` instead of `BothConnected`.

/// Aggregate client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No socket is open.
    Disconnected,
    /// `connect()` is in progress.
    Connecting,
    /// Dual mode: only the send socket is up.
    SendOnly,
    /// Dual mode: only the receive socket is up.
    ReceiveOnly,
    /// Dual mode: both sockets are up, sign-on not yet accepted.
    BothConnected,
    /// Unified mode: the socket is up, sign-on not yet accepted.
    UnifiedConnected,
    /// Sign-on accepted with response code "00"; normal traffic allowed.
    SignedOn,
    /// At least one side is being re-established.
    Reconnecting,
    /// `close()` in progress.
    Closing,
    /// Closed for good; the client cannot be reused.
    Closed,
    /// A failure the configured strategy does not tolerate, or reconnect
    /// exhaustion with nothing left up.
    Failed,
}

impl ClientState {
    /// Whether normal traffic (`send_and_receive`, `send`) is permitted.
    pub fn allows_traffic(&self) -> bool {
        matches!(self, Self::SignedOn)
    }

    /// Whether sign-on may be issued from this state.
    pub fn allows_sign_on(&self) -> bool {
        matches!(self, Self::BothConnected | Self::UnifiedConnected | Self::SignedOn)
    }

    /// Whether `connect()` may be issued from this state. `Closed` is
    /// excluded: the pending table refuses registrations after close, so
    /// a reopened socket could never carry traffic again.
    pub fn allows_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// States with no way forward.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::SendOnly => "send-only",
            Self::ReceiveOnly => "receive-only",
            Self::BothConnected => "both-connected",
            Self::UnifiedConnected => "unified-connected",
            Self::SignedOn => "signed-on",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_signed_on_allows_traffic() {
        assert!(ClientState::SignedOn.allows_traffic());
        assert!(!ClientState::BothConnected.allows_traffic());
        assert!(!ClientState::SendOnly.allows_traffic());
    }

    #[test]
    fn test_sign_on_preconditions() {
        assert!(ClientState::BothConnected.allows_sign_on());
        assert!(ClientState::UnifiedConnected.allows_sign_on());
        assert!(ClientState::SignedOn.allows_sign_on());
        assert!(!ClientState::Connecting.allows_sign_on());
        assert!(!ClientState::ReceiveOnly.allows_sign_on());
    }

    #[test]
    fn test_connect_preconditions() {
        assert!(ClientState::Disconnected.allows_connect());
        assert!(ClientState::Failed.allows_connect());
        assert!(!ClientState::SignedOn.allows_connect());
    }
}
