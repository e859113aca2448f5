//! Error taxonomy for the FEP core.
//!
//! Everything that can go wrong between a caller and the switch is one of
//! these kinds. Errors local to a single request (timeout, send failure)
//! reach only that request's waiter; errors that invalidate every in-flight
//! request (channel loss, close) are fanned out through the pending table's
//! `cancel_all`.

use std::io;

/// Which socket of a dual-channel pair an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// The outbound-only request socket.
    Send,
    /// The inbound-only response socket.
    Receive,
    /// The single socket of unified mode.
    Unified,
}

impl ChannelSide {
    /// Human-readable label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Unified => "unified",
        }
    }
}

impl std::fmt::Display for ChannelSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors surfaced by the client, server, codec and pending manager.
#[derive(Debug)]
pub enum FepError {
    /// TCP connect refused or timed out on both primary and backup.
    ConnectFailed(String),
    /// The socket required for the operation is not active.
    ChannelClosed(ChannelSide),
    /// Transport write failed; wraps the transport cause.
    SendFailed(io::Error),
    /// Pending entry deadline reached with no matching response.
    Timeout,
    /// Inbound bytes could not be parsed as a frame or ISO 8583 message.
    Malformed(String),
    /// Sign-on response carried a response code other than "00".
    SignOnRejected(String),
    /// Caller supplied a STAN already present in the pending table.
    DuplicateStan(String),
    /// The pending manager refused a registration after close.
    ManagerClosed,
    /// Server-side validation callback rejected the request.
    ValidationRejected(String),
    /// The operation is not valid in the client's current state.
    InvalidState(String),
}

impl FepError {
    /// Short machine-friendly kind tag, used in events and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "connect_failed",
            Self::ChannelClosed(_) => "channel_closed",
            Self::SendFailed(_) => "send_failed",
            Self::Timeout => "timeout",
            Self::Malformed(_) => "malformed",
            Self::SignOnRejected(_) => "sign_on_rejected",
            Self::DuplicateStan(_) => "duplicate_stan",
            Self::ManagerClosed => "manager_closed",
            Self::ValidationRejected(_) => "validation_rejected",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

impl std::fmt::Display for FepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed(detail) => write!(f, "connect failed: {detail}"),
            Self::ChannelClosed(side) => write!(f, "{side} channel is not active"),
            Self::SendFailed(cause) => write!(f, "transport write failed: {cause}"),
            Self::Timeout => write!(f, "no response before deadline"),
            Self::Malformed(detail) => write!(f, "malformed message: {detail}"),
            Self::SignOnRejected(code) => write!(f, "sign-on rejected with response code {code}"),
            Self::DuplicateStan(stan) => write!(f, "STAN {stan} already in flight"),
            Self::ManagerClosed => write!(f, "pending manager is closed"),
            Self::ValidationRejected(reason) => write!(f, "request rejected: {reason}"),
            Self::InvalidState(detail) => write!(f, "invalid state: {detail}"),
        }
    }
}

impl std::error::Error for FepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SendFailed(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Errors that fan out to every waiter must be cloneable; `io::Error` is
/// not, so fan-out copies carry the rendered cause instead.
impl Clone for FepError {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectFailed(d) => Self::ConnectFailed(d.clone()),
            Self::ChannelClosed(s) => Self::ChannelClosed(*s),
            Self::SendFailed(e) => Self::SendFailed(io::Error::new(e.kind(), e.to_string())),
            Self::Timeout => Self::Timeout,
            Self::Malformed(d) => Self::Malformed(d.clone()),
            Self::SignOnRejected(c) => Self::SignOnRejected(c.clone()),
            Self::DuplicateStan(s) => Self::DuplicateStan(s.clone()),
            Self::ManagerClosed => Self::ManagerClosed,
            Self::ValidationRejected(r) => Self::ValidationRejected(r.clone()),
            Self::InvalidState(d) => Self::InvalidState(d.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_side() {
        let err = FepError::ChannelClosed(ChannelSide::Receive);
        assert!(err.to_string().contains("receive"));
    }

    #[test]
    fn test_send_failed_preserves_source() {
        let err = FepError::SendFailed(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        use std::error::Error;
        assert!(err.source().is_some());
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = FepError::SendFailed(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.clone() {
            FepError::SendFailed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected SendFailed, got: {other:?}"),
        }
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(FepError::Timeout.kind(), "timeout");
        assert_eq!(FepError::ManagerClosed.kind(), "manager_closed");
    }
}
