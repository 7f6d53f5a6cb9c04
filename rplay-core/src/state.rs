//! Session lifecycle state machine.
//!
//! ```text
//!  Idle ──► Connecting ──► LoggingIn ──► Streaming ──► Stopping ──► Stopped
//!              │    │           │  │          │  │
//!              │    └───────────┼──┴──────────┼──┴──► Stopping
//!              └────────────────┴─────────────┴─────► Failed
//! ```
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::Instant;

use crate::error::SessionError;

/// Lifecycle state of a [`Session`](crate::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not started yet.
    #[default]
    Idle,
    /// Establishing the control connection.
    Connecting,
    /// Control connection up; session request and login in flight.
    LoggingIn,
    /// Video and input are flowing.
    Streaming {
        /// When streaming began.
        since: Instant,
    },
    /// `stop()` is tearing the session down.
    Stopping,
    /// Ended cleanly.
    Stopped,
    /// Ended with an error.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::LoggingIn => write!(f, "LoggingIn"),
            Self::Streaming { .. } => write!(f, "Streaming"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// `Stopped` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Between `start()` and a terminal state.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }

    /// How long the session has been streaming, `None` otherwise.
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Streaming { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(SessionError::AlreadyStarted),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_login(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Connecting => {
                *self = Self::LoggingIn;
                Ok(())
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Valid from: `LoggingIn`.
    pub fn begin_streaming(&mut self) -> Result<(), SessionError> {
        match self {
            Self::LoggingIn => {
                *self = Self::Streaming {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Valid from: `Connecting`, `LoggingIn`, `Streaming`.
    pub fn begin_stop(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Connecting | Self::LoggingIn | Self::Streaming { .. } => {
                *self = Self::Stopping;
                Ok(())
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Valid from any non-terminal state except `Idle`.
    pub fn finish(&mut self, failed: bool) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotConnected);
        }
        *self = if failed { Self::Failed } else { Self::Stopped };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = SessionState::default();
        s.begin_connect().unwrap();
        s.begin_login().unwrap();
        s.begin_streaming().unwrap();
        assert!(s.is_streaming());
        assert!(s.streaming_duration().is_some());
        s.begin_stop().unwrap();
        s.finish(false).unwrap();
        assert_eq!(s, SessionState::Stopped);
        assert!(s.is_terminal());
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut s = SessionState::Connecting;
        assert!(matches!(s.begin_connect(), Err(SessionError::AlreadyStarted)));
        assert_eq!(s, SessionState::Connecting);
    }

    #[test]
    fn failure_from_any_active_state() {
        for mut s in [
            SessionState::Connecting,
            SessionState::LoggingIn,
            SessionState::Streaming { since: Instant::now() },
            SessionState::Stopping,
        ] {
            s.finish(true).unwrap();
            assert_eq!(s, SessionState::Failed);
        }
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut s = SessionState::Failed;
        assert!(s.finish(false).is_err());
        assert!(s.begin_stop().is_err());
        assert_eq!(s, SessionState::Failed);

        let mut s = SessionState::Idle;
        assert!(s.finish(true).is_err());
    }

    #[test]
    fn stopping_blocks_streaming() {
        let mut s = SessionState::Stopping;
        assert!(s.begin_streaming().is_err());
        assert_eq!(s.to_string(), "Stopping");
    }
}
