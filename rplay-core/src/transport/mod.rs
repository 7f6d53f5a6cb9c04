//! Transport boundary.
//!
//! The session runtime does not speak the host's wire protocol itself. A
//! [`Connector`] opens a [`Transport`], which the driver then uses for
//! login, video fragments, host notifications, and the uplink.
//!
//! | Module     | Purpose                                                 |
//! |------------|---------------------------------------------------------|
//! | `loopback` | In-memory transport driven by a [`SimulatedHost`]       |
//! | `net`      | TCP control + UDP video transport                       |
//! | `wire`     | Wire formats used by `net`                              |
//!
//! All methods take `&self`: the video, control and uplink tasks call into
//! one shared transport concurrently.

pub mod loopback;
pub mod net;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ConnectTarget;
use crate::controller::ControllerState;
use crate::error::TransportError;
use crate::event::{Event, QuitReason};
use crate::profile::{Target, VideoProfile};

pub use loopback::{LoginBehavior, LoopbackConnector, SimulatedHost};
pub use net::{NetConnector, NetTransport};

// ── Messages ─────────────────────────────────────────────────────

/// A network-level piece of one encoded video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFragment {
    pub frame_index: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload: Bytes,
}

/// Upstream request for a decodable reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryRequest {
    /// Frames `first..=last` never reached the consumer.
    FramesLost { first: u32, last: u32 },
    /// The consumer could not use this frame.
    Rejected { frame_index: u32 },
}

/// Notifications the host sends once the session is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMessage {
    LoginPinRequest { pin_incorrect: bool },
    Nickname(String),
    KeyboardOpen,
    KeyboardTextChange(String),
    KeyboardRemoteClose,
    Rumble { left: u8, right: u8 },
    TriggerEffects { type_left: u8, type_right: u8, left: [u8; 10], right: [u8; 10] },
    MotionReset { reset: bool },
    LedColor([u8; 3]),
    PlayerIndex(u8),
    HapticIntensity(u8),
    TriggerIntensity(u8),
    /// The host is ending the session.
    Quit { reason: QuitReason, reason_str: Option<String> },
}

impl HostMessage {
    /// The event to relay, or `None` for `Quit`, which ends the session
    /// instead.
    pub fn into_event(self) -> Option<Event> {
        Some(match self {
            HostMessage::LoginPinRequest { pin_incorrect } => Event::LoginPinRequest { pin_incorrect },
            HostMessage::Nickname(nickname) => Event::NicknameReceived { nickname },
            HostMessage::KeyboardOpen => Event::KeyboardOpen,
            HostMessage::KeyboardTextChange(text) => Event::KeyboardTextChange { text },
            HostMessage::KeyboardRemoteClose => Event::KeyboardRemoteClose,
            HostMessage::Rumble { left, right } => Event::Rumble { left, right },
            HostMessage::TriggerEffects {
                type_left,
                type_right,
                left,
                right,
            } => Event::TriggerEffects {
                type_left,
                type_right,
                left,
                right,
            },
            HostMessage::MotionReset { reset } => Event::MotionReset { reset },
            HostMessage::LedColor(rgb) => Event::LedColor { rgb },
            HostMessage::PlayerIndex(index) => Event::PlayerIndex { index },
            HostMessage::HapticIntensity(intensity) => Event::HapticIntensity { intensity },
            HostMessage::TriggerIntensity(intensity) => Event::TriggerIntensity { intensity },
            HostMessage::Quit { .. } => return None,
        })
    }
}

/// What the client asks for when logging in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub credential: [u8; 16],
    pub target: Target,
    pub profile: VideoProfile,
}

// ── Traits ───────────────────────────────────────────────────────

/// Opens a transport to a host.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish the control connection. No login yet.
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Transport>, TransportError>;
}

/// An established connection to one host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Run the session request and authenticate. Returns the profile the
    /// host agreed to.
    async fn login(&self, request: &LoginRequest) -> Result<VideoProfile, TransportError>;

    /// Next video fragment.
    async fn recv_fragment(&self) -> Result<VideoFragment, TransportError>;

    /// Next host notification.
    async fn recv_host_message(&self) -> Result<HostMessage, TransportError>;

    /// Send one controller sample.
    async fn send_controller_state(&self, state: &ControllerState) -> Result<(), TransportError>;

    /// Ask the host for a recovery frame.
    async fn request_recovery(&self, request: RecoveryRequest) -> Result<(), TransportError>;

    /// Say goodbye and release sockets. Called once, at teardown.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_quit_is_not_relayed() {
        let quit = HostMessage::Quit {
            reason: QuitReason::StreamConnectionRemoteShutdown,
            reason_str: None,
        };
        assert!(quit.into_event().is_none());
    }

    #[test]
    fn host_messages_map_to_events() {
        assert_eq!(
            HostMessage::Rumble { left: 1, right: 2 }.into_event(),
            Some(Event::Rumble { left: 1, right: 2 })
        );
        assert_eq!(
            HostMessage::Nickname("PS5-123".into()).into_event(),
            Some(Event::NicknameReceived {
                nickname: "PS5-123".into()
            })
        );
    }
}
