//! Lifecycle notifications and their delivery path.
//!
//! Events travel through a depth-1 channel to a dedicated OS thread that
//! invokes the registered callback. The emitter awaits while one event is
//! already pending, so ordering is preserved without unbounded buffering,
//! and a slow video consumer never delays a `Quit`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::profile::VideoProfile;

// ── QuitReason ───────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QuitReason {
    #[default]
    None,
    /// `stop()` was called.
    UserRequested,
    AuthRejected,
    Timeout,
    SessionRequestUnknown,
    SessionRequestConnectionRefused,
    SessionRequestRpInUse,
    SessionRequestRpCrash,
    SessionRequestRpVersionMismatch,
    CtrlUnknown,
    CtrlConnectFailed,
    CtrlConnectionRefused,
    StreamConnectionUnknown,
    StreamConnectionRemoteDisconnected,
    StreamConnectionRemoteShutdown,
    PsnRegistFailed,
}

impl QuitReason {
    /// Human-readable description.
    pub fn as_str(self) -> &'static str {
        match self {
            QuitReason::None => "None",
            QuitReason::UserRequested => "Stopped",
            QuitReason::AuthRejected => "Registration key rejected by host",
            QuitReason::Timeout => "Timed out",
            QuitReason::SessionRequestUnknown => "Unknown Session Request Error",
            QuitReason::SessionRequestConnectionRefused => "Connection Refused",
            QuitReason::SessionRequestRpInUse => "Remote Play on Console is already in use",
            QuitReason::SessionRequestRpCrash => "Remote Play on Console has crashed",
            QuitReason::SessionRequestRpVersionMismatch => {
                "RP-Version mismatch between client and console"
            }
            QuitReason::CtrlUnknown => "Unknown Ctrl Error",
            QuitReason::CtrlConnectFailed => "Ctrl failed to connect",
            QuitReason::CtrlConnectionRefused => "Ctrl connection refused",
            QuitReason::StreamConnectionUnknown => "Unknown Error in Stream Connection",
            QuitReason::StreamConnectionRemoteDisconnected => {
                "Remote has disconnected from Stream Connection"
            }
            QuitReason::StreamConnectionRemoteShutdown => {
                "Remote has disconnected from Stream Connection the because Server shut down"
            }
            QuitReason::PsnRegistFailed => "The Console Registration using PSN has failed",
        }
    }

    /// Whether this reason denotes a failure rather than a normal end.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            QuitReason::None | QuitReason::UserRequested | QuitReason::StreamConnectionRemoteShutdown
        )
    }

    /// Refusals the host reports as a failed login, distinct from a
    /// rejected credential.
    pub fn is_login_refusal(self) -> bool {
        matches!(
            self,
            QuitReason::SessionRequestUnknown
                | QuitReason::SessionRequestConnectionRefused
                | QuitReason::SessionRequestRpInUse
                | QuitReason::SessionRequestRpCrash
                | QuitReason::SessionRequestRpVersionMismatch
        )
    }
}

impl std::fmt::Display for QuitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Event ────────────────────────────────────────────────────────

/// Discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    LoginFailed,
    LoginPinRequest,
    NicknameReceived,
    KeyboardOpen,
    KeyboardTextChange,
    KeyboardRemoteClose,
    Rumble,
    TriggerEffects,
    MotionReset,
    LedColor,
    PlayerIndex,
    HapticIntensity,
    TriggerIntensity,
    Quit,
}

/// A lifecycle notification delivered to the event callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Login succeeded; video is about to flow.
    Connected { profile: VideoProfile },
    /// The host refused the session request. Always followed by `Quit`.
    LoginFailed { reason: QuitReason },
    LoginPinRequest { pin_incorrect: bool },
    NicknameReceived { nickname: String },
    KeyboardOpen,
    KeyboardTextChange { text: String },
    KeyboardRemoteClose,
    Rumble { left: u8, right: u8 },
    TriggerEffects { type_left: u8, type_right: u8, left: [u8; 10], right: [u8; 10] },
    MotionReset { reset: bool },
    LedColor { rgb: [u8; 3] },
    PlayerIndex { index: u8 },
    HapticIntensity { intensity: u8 },
    TriggerIntensity { intensity: u8 },
    /// The session is over. Emitted exactly once per started session.
    Quit {
        reason: QuitReason,
        reason_str: Option<String>,
        error: bool,
    },
}

impl Event {
    /// Build the terminal event for `reason`.
    pub fn quit(reason: QuitReason, reason_str: Option<String>) -> Self {
        Event::Quit {
            reason,
            reason_str,
            error: reason.is_error(),
        }
    }

    pub fn kind(&self) -> EventType {
        match self {
            Event::Connected { .. } => EventType::Connected,
            Event::LoginFailed { .. } => EventType::LoginFailed,
            Event::LoginPinRequest { .. } => EventType::LoginPinRequest,
            Event::NicknameReceived { .. } => EventType::NicknameReceived,
            Event::KeyboardOpen => EventType::KeyboardOpen,
            Event::KeyboardTextChange { .. } => EventType::KeyboardTextChange,
            Event::KeyboardRemoteClose => EventType::KeyboardRemoteClose,
            Event::Rumble { .. } => EventType::Rumble,
            Event::TriggerEffects { .. } => EventType::TriggerEffects,
            Event::MotionReset { .. } => EventType::MotionReset,
            Event::LedColor { .. } => EventType::LedColor,
            Event::PlayerIndex { .. } => EventType::PlayerIndex,
            Event::HapticIntensity { .. } => EventType::HapticIntensity,
            Event::TriggerIntensity { .. } => EventType::TriggerIntensity,
            Event::Quit { .. } => EventType::Quit,
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

/// Callback invoked for each event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Shared registration slot, read on every delivery so a callback
/// registered after `start()` still takes effect.
pub(crate) type EventSlot = Arc<Mutex<Option<EventCallback>>>;

/// Producer side of the event channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<Event>,
}

impl EventEmitter {
    /// Queue `event`, waiting while a previous one is still pending.
    ///
    /// Returns `false` once the delivery thread is gone.
    pub async fn emit(&self, event: Event) -> bool {
        trace!(kind = ?event.kind(), "emit event");
        self.tx.send(event).await.is_ok()
    }
}

/// Start the event delivery thread.
///
/// The thread exits once every [`EventEmitter`] is dropped and the last
/// event has been delivered. `keepalive` is held until then.
pub(crate) fn spawn_event_thread<K: Send + 'static>(
    slot: EventSlot,
    keepalive: K,
) -> std::io::Result<(EventEmitter, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<Event>(1);
    let handle = thread::Builder::new()
        .name("rplay-event".into())
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                let callback = slot.lock().clone();
                match callback {
                    Some(cb) => cb(event),
                    None => debug!(kind = ?event.kind(), "no event callback registered"),
                }
            }
            drop(keepalive);
        })?;
    Ok((EventEmitter { tx }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(!QuitReason::UserRequested.is_error());
        assert!(!QuitReason::StreamConnectionRemoteShutdown.is_error());
        assert!(QuitReason::AuthRejected.is_error());
        assert!(QuitReason::StreamConnectionRemoteDisconnected.is_error());
    }

    #[test]
    fn quit_event_carries_error_flag() {
        let ev = Event::quit(QuitReason::AuthRejected, None);
        assert_eq!(ev.kind(), EventType::Quit);
        assert!(matches!(ev, Event::Quit { error: true, .. }));
        let ev = Event::quit(QuitReason::UserRequested, None);
        assert!(matches!(ev, Event::Quit { error: false, .. }));
    }

    #[test]
    fn delivery_thread_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot: EventSlot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        *slot.lock() = Some(Arc::new(move |ev: Event| sink.lock().push(ev)));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (emitter, handle) = spawn_event_thread(slot, ()).unwrap();
        rt.block_on(async {
            assert!(emitter.emit(Event::KeyboardOpen).await);
            assert!(emitter.emit(Event::PlayerIndex { index: 2 }).await);
            assert!(emitter.emit(Event::quit(QuitReason::UserRequested, None)).await);
        });
        drop(emitter);
        handle.join().unwrap();

        let kinds: Vec<_> = seen.lock().iter().map(Event::kind).collect();
        assert_eq!(
            kinds,
            vec![EventType::KeyboardOpen, EventType::PlayerIndex, EventType::Quit]
        );
    }
}
