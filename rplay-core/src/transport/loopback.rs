//! In-memory transport.
//!
//! A [`SimulatedHost`] plays the console: it decides how login goes,
//! injects video fragments and host notifications, and records everything
//! the client sends upstream. Its [`LoopbackConnector`] plugs into a
//! [`Session`](crate::Session) in place of the network transport, which is
//! how automation scripts are exercised offline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConnectTarget;
use crate::controller::ControllerState;
use crate::error::TransportError;
use crate::event::QuitReason;
use crate::profile::VideoProfile;
use crate::transport::{
    Connector, HostMessage, LoginRequest, RecoveryRequest, Transport, VideoFragment,
};

/// How the simulated host answers a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginBehavior {
    /// Accept; `None` echoes the requested profile.
    Accept(Option<VideoProfile>),
    RejectCredential,
    Refuse(QuitReason),
    /// Never answer.
    Hang,
}

#[derive(Debug)]
struct HostShared {
    login: Mutex<LoginBehavior>,
    connect_failure: Mutex<Option<std::io::ErrorKind>>,
    send_delay: Mutex<Duration>,

    fragment_tx: mpsc::UnboundedSender<VideoFragment>,
    fragment_rx: Mutex<Option<mpsc::UnboundedReceiver<VideoFragment>>>,
    message_tx: mpsc::UnboundedSender<HostMessage>,
    message_rx: Mutex<Option<mpsc::UnboundedReceiver<HostMessage>>>,
    remote_closed: CancellationToken,

    logins: Mutex<Vec<LoginRequest>>,
    sent_states: Mutex<Vec<ControllerState>>,
    recoveries: Mutex<Vec<RecoveryRequest>>,
    connects: AtomicUsize,
    closed: AtomicBool,
}

// ── SimulatedHost ────────────────────────────────────────────────

/// Host-side handle of a loopback connection.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    shared: Arc<HostShared>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// A host that accepts any login.
    pub fn new() -> Self {
        let (fragment_tx, fragment_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(HostShared {
                login: Mutex::new(LoginBehavior::Accept(None)),
                connect_failure: Mutex::new(None),
                send_delay: Mutex::new(Duration::ZERO),
                fragment_tx,
                fragment_rx: Mutex::new(Some(fragment_rx)),
                message_tx,
                message_rx: Mutex::new(Some(message_rx)),
                remote_closed: CancellationToken::new(),
                logins: Mutex::new(Vec::new()),
                sent_states: Mutex::new(Vec::new()),
                recoveries: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connector handing out transports bound to this host.
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    // ── Scripting ────────────────────────────────────────────────

    pub fn set_login(&self, behavior: LoginBehavior) {
        *self.shared.login.lock() = behavior;
    }

    /// Make the next `connect` fail with an I/O error of `kind`.
    pub fn fail_connect(&self, kind: std::io::ErrorKind) {
        *self.shared.connect_failure.lock() = Some(kind);
    }

    /// Delay applied to every controller send, to model a saturated link.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.shared.send_delay.lock() = delay;
    }

    pub fn push_fragment(&self, fragment: VideoFragment) {
        let _ = self.shared.fragment_tx.send(fragment);
    }

    /// Fragment `data` by `mtu` and push every piece in order.
    pub fn push_frame(&self, frame_index: u32, data: &[u8], mtu: usize) -> Result<(), TransportError> {
        for fragment in VideoFragment::split(frame_index, data, mtu)? {
            self.push_fragment(fragment);
        }
        Ok(())
    }

    pub fn send_host_message(&self, message: HostMessage) {
        let _ = self.shared.message_tx.send(message);
    }

    /// Drop the connection from the host side.
    pub fn disconnect(&self) {
        self.shared.remote_closed.cancel();
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn login_requests(&self) -> Vec<LoginRequest> {
        self.shared.logins.lock().clone()
    }

    pub fn sent_states(&self) -> Vec<ControllerState> {
        self.shared.sent_states.lock().clone()
    }

    pub fn recovery_requests(&self) -> Vec<RecoveryRequest> {
        self.shared.recoveries.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// `true` once the client closed its transport.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    pub fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&SimulatedHost) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

// ── LoopbackConnector ────────────────────────────────────────────

/// [`Connector`] for a [`SimulatedHost`]. Each host accepts one connection.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    shared: Arc<HostShared>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Transport>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.shared.connect_failure.lock().take() {
            return Err(std::io::Error::new(kind, "simulated connect failure").into());
        }
        let fragments = self.shared.fragment_rx.lock().take();
        let messages = self.shared.message_rx.lock().take();
        let (Some(fragments), Some(messages)) = (fragments, messages) else {
            return Err(TransportError::Protocol(
                "simulated host already has a client".into(),
            ));
        };
        debug!(address = %target.address(), "loopback connected");
        Ok(Arc::new(LoopbackTransport {
            shared: Arc::clone(&self.shared),
            fragments: tokio::sync::Mutex::new(fragments),
            messages: tokio::sync::Mutex::new(messages),
        }))
    }
}

// ── LoopbackTransport ────────────────────────────────────────────

struct LoopbackTransport {
    shared: Arc<HostShared>,
    fragments: tokio::sync::Mutex<mpsc::UnboundedReceiver<VideoFragment>>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<HostMessage>>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.remote_closed.is_cancelled() || self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn login(&self, request: &LoginRequest) -> Result<VideoProfile, TransportError> {
        self.ensure_open()?;
        self.shared.logins.lock().push(request.clone());
        let behavior = *self.shared.login.lock();
        match behavior {
            LoginBehavior::Accept(profile) => Ok(profile.unwrap_or(request.profile)),
            LoginBehavior::RejectCredential => Err(TransportError::AuthRejected),
            LoginBehavior::Refuse(reason) => Err(TransportError::SessionRefused(reason)),
            LoginBehavior::Hang => {
                self.shared.remote_closed.cancelled().await;
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn recv_fragment(&self) -> Result<VideoFragment, TransportError> {
        let mut rx = self.fragments.lock().await;
        tokio::select! {
            _ = self.shared.remote_closed.cancelled() => Err(TransportError::Disconnected),
            fragment = rx.recv() => fragment.ok_or(TransportError::Disconnected),
        }
    }

    async fn recv_host_message(&self) -> Result<HostMessage, TransportError> {
        let mut rx = self.messages.lock().await;
        tokio::select! {
            _ = self.shared.remote_closed.cancelled() => Err(TransportError::Disconnected),
            message = rx.recv() => message.ok_or(TransportError::Disconnected),
        }
    }

    async fn send_controller_state(&self, state: &ControllerState) -> Result<(), TransportError> {
        self.ensure_open()?;
        let delay = *self.shared.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.shared.sent_states.lock().push(*state);
        Ok(())
    }

    async fn request_recovery(&self, request: RecoveryRequest) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared.recoveries.lock().push(request);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
