//! Domain-specific error types for the remote-play session runtime.
//!
//! Two layers:
//! - [`SessionError`] is what the public facade returns.
//! - [`TransportError`] is what a [`Transport`](crate::transport::Transport)
//!   reports; the driver maps it to a [`QuitReason`] instead of surfacing it.

use std::time::Duration;
use thiserror::Error;

use crate::event::QuitReason;

/// The canonical error type returned by [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    // ── Local, immediate ─────────────────────────────────────────
    /// Host or credential missing or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation needs a `Streaming` session.
    #[error("session is not connected")]
    NotConnected,

    /// `start()` (or `initialize()`) on a session that already left `Idle`.
    #[error("session already started")]
    AlreadyStarted,

    // ── Terminal session outcomes (reported by `join`) ───────────
    /// The host rejected the registration credential.
    #[error("credential rejected by host")]
    AuthRejected,

    /// The session ended with an error reason.
    #[error("connection failed: {}", .0.as_str())]
    Connection(QuitReason),

    // ── Setup ────────────────────────────────────────────────────
    /// The internal runtime or a delivery thread could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// A configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl SessionError {
    /// Map the reason of a failed session to the error `join` reports.
    pub fn from_quit(reason: QuitReason) -> Self {
        match reason {
            QuitReason::AuthRejected => SessionError::AuthRejected,
            other => SessionError::Connection(other),
        }
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(e: toml::de::Error) -> Self {
        SessionError::Config(e.to_string())
    }
}

// ── TransportError ────────────────────────────────────────────────

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket layer reported an error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host refused the registration credential.
    #[error("credential rejected")]
    AuthRejected,

    /// The host refused the session request for a specific reason.
    #[error("session refused: {}", .0.as_str())]
    SessionRefused(QuitReason),

    /// The remote end closed the connection.
    #[error("remote disconnected")]
    Disconnected,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Encoding or decoding of a control message failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl TransportError {
    /// Quit reason for a failure while establishing the control connection.
    pub fn connect_reason(&self) -> QuitReason {
        match self {
            TransportError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                QuitReason::CtrlConnectionRefused
            }
            TransportError::Timeout(_) => QuitReason::Timeout,
            TransportError::AuthRejected => QuitReason::AuthRejected,
            TransportError::SessionRefused(reason) => *reason,
            _ => QuitReason::CtrlConnectFailed,
        }
    }

    /// Quit reason for a failure during login.
    pub fn login_reason(&self) -> QuitReason {
        match self {
            TransportError::AuthRejected => QuitReason::AuthRejected,
            TransportError::SessionRefused(reason) => *reason,
            TransportError::Timeout(_) => QuitReason::Timeout,
            TransportError::Disconnected => QuitReason::SessionRequestConnectionRefused,
            _ => QuitReason::SessionRequestUnknown,
        }
    }

    /// Quit reason for a failure once streaming.
    pub fn stream_reason(&self) -> QuitReason {
        match self {
            TransportError::Disconnected => QuitReason::StreamConnectionRemoteDisconnected,
            TransportError::Timeout(_) => QuitReason::Timeout,
            _ => QuitReason::StreamConnectionUnknown,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TransportError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TransportError::Disconnected
    }
}

impl From<Box<bincode::ErrorKind>> for TransportError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TransportError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SessionError::InvalidConfig("empty host".into());
        assert!(e.to_string().contains("empty host"));

        let e = SessionError::Connection(QuitReason::CtrlConnectFailed);
        assert!(e.to_string().contains("connection failed"));
    }

    #[test]
    fn from_quit_maps_auth() {
        assert!(matches!(
            SessionError::from_quit(QuitReason::AuthRejected),
            SessionError::AuthRejected
        ));
        assert!(matches!(
            SessionError::from_quit(QuitReason::Timeout),
            SessionError::Connection(QuitReason::Timeout)
        ));
    }

    #[test]
    fn refused_connect_maps_to_ctrl_refused() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: TransportError = io_err.into();
        assert_eq!(e.connect_reason(), QuitReason::CtrlConnectionRefused);
        assert_eq!(
            TransportError::Disconnected.stream_reason(),
            QuitReason::StreamConnectionRemoteDisconnected
        );
    }

    #[test]
    fn login_reason_keeps_refusal() {
        let e = TransportError::SessionRefused(QuitReason::SessionRequestRpInUse);
        assert_eq!(e.login_reason(), QuitReason::SessionRequestRpInUse);
        assert_eq!(TransportError::AuthRejected.login_reason(), QuitReason::AuthRejected);
    }
}
