//! # rplay-core
//!
//! Session runtime for streaming games from a console host.
//!
//! This crate contains:
//! - **Session**: `Session` facade, lifecycle state machine and driver
//! - **Controller**: `ControllerState` snapshots and the latest-wins uplink
//! - **Video**: fragment reassembly, pooled padded frames, loss accounting
//! - **Events**: `Event` / `QuitReason` delivered on a dedicated thread
//! - **Transport**: `Connector` / `Transport` traits with loopback and
//!   TCP+UDP implementations
//! - **Config**: `SessionConfig` loaded from TOML
//! - **Error**: `SessionError` and `TransportError`, `thiserror`-based

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
mod input;
pub mod profile;
pub mod session;
pub mod state;
pub mod transport;
pub mod video;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{CREDENTIAL_SIZE, ConnectTarget, DEFAULT_CONTROL_PORT, SessionConfig};
pub use controller::{ControllerButton, ControllerState, ControllerTouch, TOUCH_POINTS};
pub use error::{SessionError, TransportError};
pub use event::{Event, EventCallback, EventType, QuitReason};
pub use profile::{Codec, FpsPreset, ResolutionPreset, Target, VideoProfile};
pub use session::{Session, SessionHandle};
pub use state::SessionState;
pub use transport::{
    Connector, HostMessage, LoginBehavior, LoginRequest, LoopbackConnector, NetConnector, NetTransport,
    RecoveryRequest, SimulatedHost, Transport, VideoFragment,
};
pub use video::{
    RECOMMENDED_CALLBACK_BUDGET, VIDEO_BUFFER_PADDING_SIZE, VideoCallback, VideoFrame, VideoStats,
};
