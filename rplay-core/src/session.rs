//! The [`Session`] facade and the driver task behind it.
//!
//! ```text
//!  caller thread                runtime (tokio)                      OS threads
//!  ─────────────                ───────────────                      ──────────
//!  start() ───────────────────► driver ── connect ─ login ─┐
//!                                  │                        ├─► video loop ──► rplay-video ─► video callback
//!                                  │                        ├─► control loop ─┐
//!  submit_controller_state ─watch─►│                        └─► uplink        ├► rplay-event ─► event callback
//!                                  └── teardown: Quit ─ close ────────────────┘
//!  stop() ── cancel ──────────────►
//! ```
//!
//! Lifecycle calls are synchronous. They must not be made from inside an
//! async runtime, since `stop()` and `join()` block on the session's own
//! runtime. `stop()` may be called from either callback.

use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectTarget, SessionConfig};
use crate::controller::ControllerState;
use crate::error::{SessionError, TransportError};
use crate::event::{Event, EventCallback, EventEmitter, EventSlot, QuitReason, spawn_event_thread};
use crate::input::{RECOVERY_QUEUE_DEPTH, Uplink, controller_channel};
use crate::profile::VideoProfile;
use crate::state::SessionState;
use crate::transport::{Connector, HostMessage, LoginRequest, NetConnector, Transport};
use crate::video::frame::{FramePool, VideoFrame};
use crate::video::pipeline::{
    VideoCallback, VideoCounters, VideoPipeline, VideoSlot, VideoStats, spawn_video_thread,
};

/// How long teardown waits for the stream loops and `Transport::close`.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Shared state ─────────────────────────────────────────────────

/// State read by the facade and written by the driver.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<SessionState>,
    negotiated: Mutex<Option<VideoProfile>>,
    quit_reason: Mutex<Option<QuitReason>>,
    counters: Arc<VideoCounters>,
    /// Cancelled once the driver task is gone, teardown included.
    finished: CancellationToken,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::channel(SessionState::Idle).0,
            negotiated: Mutex::new(None),
            quit_reason: Mutex::new(None),
            counters: Arc::new(VideoCounters::default()),
            finished: CancellationToken::new(),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Apply a validated transition; observers are woken only on success.
    fn transition<F>(&self, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionState) -> Result<(), SessionError>,
    {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            result = apply(state);
            result.is_ok()
        });
        result
    }
}

/// Handles reaped by `stop()`.
struct Workers {
    driver: tokio::task::JoinHandle<()>,
    video: JoinHandle<()>,
    event: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    target: Mutex<Option<ConnectTarget>>,
    requested: Mutex<VideoProfile>,
    shared: Arc<Shared>,
    video_slot: VideoSlot,
    event_slot: EventSlot,
    controller: watch::Sender<ControllerState>,
    cancel: CancellationToken,
    runtime: Mutex<Option<Arc<Runtime>>>,
    workers: Mutex<Option<Workers>>,
    /// `(video, event)` delivery thread ids of the running session.
    callback_threads: Mutex<Option<(ThreadId, ThreadId)>>,
}

// ── Session ──────────────────────────────────────────────────────

/// One remote-play engagement with one host.
///
/// ```no_run
/// use rplay_core::{Event, Session};
///
/// let session = Session::new();
/// session.initialize("192.168.1.100", &[0u8; 16])?;
/// session.register_video_callback(|frame| {
///     // hand frame.padded() to a decoder
///     !frame.is_empty()
/// });
/// session.register_event_callback(|event| {
///     if let Event::Quit { reason, .. } = event {
///         println!("session ended: {reason}");
///     }
/// });
/// session.start()?;
/// session.join()?;
/// # Ok::<(), rplay_core::SessionError>(())
/// ```
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.inner.shared.state())
            .field("target", &*self.inner.target.lock())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with default settings over the network transport.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// A session over the network transport. Only `config.target.console`
    /// is used from the target section; the host and credential come from
    /// [`initialize`](Self::initialize), or use
    /// [`from_config`](Self::from_config) to apply them all.
    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_connector(config, Arc::new(NetConnector))
    }

    /// A session whose transport comes from `connector`.
    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (controller, _) = controller_channel();
        let requested = config.video_profile();
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                target: Mutex::new(None),
                requested: Mutex::new(requested),
                shared: Arc::new(Shared::new()),
                video_slot: Arc::new(Mutex::new(None)),
                event_slot: Arc::new(Mutex::new(None)),
                controller,
                cancel: CancellationToken::new(),
                runtime: Mutex::new(None),
                workers: Mutex::new(None),
                callback_threads: Mutex::new(None),
            }),
        }
    }

    /// A session initialized from `config.target`.
    pub fn from_config(config: SessionConfig) -> Result<Self, SessionError> {
        let target = config
            .connect_target()?
            .ok_or_else(|| SessionError::InvalidConfig("no host configured".into()))?;
        let session = Self::with_config(config);
        *session.inner.target.lock() = Some(target);
        Ok(session)
    }

    /// A weak handle for use inside callbacks.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Set the host and 16-byte registration credential.
    pub fn initialize(&self, host: &str, credential: &[u8]) -> Result<(), SessionError> {
        if self.inner.shared.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        let console = self.inner.config.target.console;
        let target = ConnectTarget::new(host, credential)?.with_console(console);
        debug!(address = %target.address(), fingerprint = %target.fingerprint(), "session initialized");
        *self.inner.target.lock() = Some(target);
        Ok(())
    }

    /// Use `target` as is, e.g. with a non-default port or console.
    pub fn initialize_target(&self, target: ConnectTarget) -> Result<(), SessionError> {
        if self.inner.shared.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        *self.inner.target.lock() = Some(target);
        Ok(())
    }

    /// Override the requested stream parameters before `start()`.
    pub fn set_video_profile(&self, profile: VideoProfile) -> Result<(), SessionError> {
        if self.inner.shared.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        *self.inner.requested.lock() = profile;
        Ok(())
    }

    /// Begin connecting. Returns once the connection attempt is under way;
    /// the outcome arrives as `Connected` or `Quit`.
    pub fn start(&self) -> Result<(), SessionError> {
        self.inner.start()
    }

    /// End the session. Returns after the `Quit` event has been delivered,
    /// except when called from the event callback.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.inner.stop()
    }

    /// Block until the session ends and teardown has closed the transport.
    /// `Ok` for a clean end, otherwise the failure that ended it. Must not
    /// be called from a callback.
    pub fn join(&self) -> Result<(), SessionError> {
        self.inner.join()
    }

    // ── Input ────────────────────────────────────────────────────

    /// Replace the pending controller state. Only the newest unsent state
    /// reaches the host.
    pub fn submit_controller_state(&self, state: ControllerState) -> Result<(), SessionError> {
        self.inner.submit_controller_state(state)
    }

    // ── Callbacks ────────────────────────────────────────────────

    /// Receive assembled frames. Return `false` to request a recovery frame.
    /// Replaces any earlier registration, also while running.
    pub fn register_video_callback<F>(&self, callback: F)
    where
        F: Fn(&VideoFrame) -> bool + Send + Sync + 'static,
    {
        let callback: VideoCallback = Arc::new(callback);
        *self.inner.video_slot.lock() = Some(callback);
    }

    /// Receive lifecycle events.
    pub fn register_event_callback<F>(&self, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        *self.inner.event_slot.lock() = Some(callback);
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.inner.shared.state()
    }

    /// Negotiated profile once connected, the requested one before.
    pub fn video_profile(&self) -> VideoProfile {
        let negotiated = *self.inner.shared.negotiated.lock();
        negotiated.unwrap_or_else(|| *self.inner.requested.lock())
    }

    /// Why the session ended, once it has.
    pub fn quit_reason(&self) -> Option<QuitReason> {
        *self.inner.shared.quit_reason.lock()
    }

    pub fn video_stats(&self) -> VideoStats {
        self.inner.shared.counters.snapshot()
    }

    pub fn target(&self) -> Option<ConnectTarget> {
        self.inner.target.lock().clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.inner.stop() {
            warn!(error = %e, "stop on drop failed");
        }
        // The delivery thread may still hold a reference while a stop
        // issued from the event callback completes.
        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime.and_then(|rt| Arc::try_unwrap(rt).ok()) {
            runtime.shutdown_background();
        }
    }
}

// ── SessionHandle ────────────────────────────────────────────────

/// Non-owning access to a [`Session`], safe to capture in its callbacks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Weak<Inner>,
}

impl SessionHandle {
    /// See [`Session::stop`]. `Ok` if the session is gone.
    pub fn stop(&self) -> Result<(), SessionError> {
        match self.inner.upgrade() {
            Some(inner) => inner.stop(),
            None => Ok(()),
        }
    }

    pub fn submit_controller_state(&self, state: ControllerState) -> Result<(), SessionError> {
        match self.inner.upgrade() {
            Some(inner) => inner.submit_controller_state(state),
            None => Err(SessionError::NotConnected),
        }
    }

    /// `None` once the session is dropped.
    pub fn state(&self) -> Option<SessionState> {
        self.inner.upgrade().map(|inner| inner.shared.state())
    }
}

// ── Inner ────────────────────────────────────────────────────────

impl Inner {
    fn runtime(&self) -> Result<Arc<Runtime>, SessionError> {
        let mut slot = self.runtime.lock();
        if let Some(rt) = slot.as_ref() {
            return Ok(Arc::clone(rt));
        }
        let rt = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.config.runtime.worker_threads.max(1))
                .thread_name("rplay-runtime")
                .enable_all()
                .build()?,
        );
        *slot = Some(Arc::clone(&rt));
        Ok(rt)
    }

    fn start(&self) -> Result<(), SessionError> {
        let target = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| SessionError::InvalidConfig("initialize() was not called".into()))?;
        if self.shared.state() != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        let runtime = self.runtime()?;
        self.shared.transition(SessionState::begin_connect)?;

        match self.spawn_workers(&runtime, target) {
            Ok(workers) => {
                *self.workers.lock() = Some(workers);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to start session workers");
                *self.shared.quit_reason.lock() = Some(QuitReason::CtrlUnknown);
                let _ = self.shared.transition(|s| s.finish(true));
                self.shared.finished.cancel();
                Err(e.into())
            }
        }
    }

    fn spawn_workers(
        &self,
        runtime: &Arc<Runtime>,
        target: ConnectTarget,
    ) -> std::io::Result<Workers> {
        let pool = FramePool::new(self.config.video.frame_pool);
        let (frames_tx, frames_rx) = mpsc::channel(pool.capacity());
        let (recovery_tx, recovery_rx) = mpsc::channel(RECOVERY_QUEUE_DEPTH);
        let counters = Arc::clone(&self.shared.counters);

        let video = spawn_video_thread(
            Arc::clone(&self.video_slot),
            frames_rx,
            pool.clone(),
            recovery_tx.clone(),
            Arc::clone(&counters),
        )?;
        let (emitter, event) = spawn_event_thread(Arc::clone(&self.event_slot), Arc::clone(runtime))?;

        let requested = *self.requested.lock();
        let driver = Driver {
            connector: Arc::clone(&self.connector),
            login: LoginRequest {
                credential: *target.credential(),
                target: target.console(),
                profile: requested,
            },
            target,
            connect_timeout: self.config.connect_timeout(),
            login_timeout: self.config.login_timeout(),
            shared: Arc::clone(&self.shared),
            emitter,
            cancel: self.cancel.clone(),
        };
        let streams = Streams {
            pipeline: VideoPipeline::new(pool, frames_tx, recovery_tx, counters),
            uplink: Uplink::new(self.controller.subscribe(), recovery_rx),
        };
        // Callbacks may call stop() as soon as the driver runs.
        *self.callback_threads.lock() = Some((video.thread().id(), event.thread().id()));
        let finished = self.shared.finished.clone().drop_guard();
        let driver = runtime.spawn(async move {
            let _finished = finished;
            driver.run(streams).await;
        });
        Ok(Workers {
            driver,
            video,
            event,
        })
    }

    fn stop(&self) -> Result<(), SessionError> {
        let state = self.shared.state();
        if state == SessionState::Idle {
            return Ok(());
        }
        if self.shared.transition(SessionState::begin_stop).is_ok() {
            info!(from = %state, "stop requested");
        }
        self.cancel.cancel();

        let current = std::thread::current().id();
        let (on_video, on_event) = match *self.callback_threads.lock() {
            Some((video, event)) => (video == current, event == current),
            None => (false, false),
        };
        if on_event {
            // Teardown continues once this callback returns; a later
            // stop() or drop reaps the workers.
            return Ok(());
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(SessionError::Runtime(std::io::Error::other(
                "stop() called from inside an async runtime",
            )));
        }

        let workers = self.workers.lock().take();
        let runtime = self.runtime.lock().clone();
        let (Some(workers), Some(runtime)) = (workers, runtime) else {
            // Another caller is reaping; wait for it to finish.
            return self.wait_terminal().map(|_| ());
        };

        if let Err(e) = runtime.block_on(workers.driver) {
            warn!(error = %e, "driver task failed");
        }
        if workers.event.join().is_err() {
            warn!("event delivery thread panicked");
        }
        if !on_video && workers.video.join().is_err() {
            warn!("video delivery thread panicked");
        }
        Ok(())
    }

    /// Wait until the driver has finished its teardown, then report the
    /// final state.
    fn wait_terminal(&self) -> Result<SessionState, SessionError> {
        let state = self.shared.state();
        if state == SessionState::Idle || self.shared.finished.is_cancelled() {
            return Ok(state);
        }
        let Some(runtime) = self.runtime.lock().clone() else {
            return Ok(state);
        };
        let finished = self.shared.finished.clone();
        runtime.block_on(async move { finished.cancelled().await });
        Ok(self.shared.state())
    }

    fn join(&self) -> Result<(), SessionError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(SessionError::Runtime(std::io::Error::other(
                "join() called from inside an async runtime",
            )));
        }
        match self.wait_terminal()? {
            SessionState::Stopped => Ok(()),
            SessionState::Failed => {
                let reason = self
                    .shared
                    .quit_reason
                    .lock()
                    .unwrap_or(QuitReason::StreamConnectionUnknown);
                Err(SessionError::from_quit(reason))
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    fn submit_controller_state(&self, state: ControllerState) -> Result<(), SessionError> {
        if !self.shared.state().is_streaming() {
            return Err(SessionError::NotConnected);
        }
        self.controller.send_replace(state);
        Ok(())
    }
}

// ── Driver ───────────────────────────────────────────────────────

/// How a session ended.
#[derive(Debug)]
struct Ending {
    reason: QuitReason,
    detail: Option<String>,
    login_refused: bool,
}

impl Ending {
    fn user() -> Self {
        Self {
            reason: QuitReason::UserRequested,
            detail: None,
            login_refused: false,
        }
    }

    fn new(reason: QuitReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
            login_refused: false,
        }
    }

    fn stream(err: TransportError) -> Self {
        Self::new(err.stream_reason(), err.to_string())
    }
}

/// Loops that only run while streaming.
struct Streams {
    pipeline: VideoPipeline,
    uplink: Uplink,
}

struct Driver {
    connector: Arc<dyn Connector>,
    target: ConnectTarget,
    login: LoginRequest,
    connect_timeout: Duration,
    login_timeout: Duration,
    shared: Arc<Shared>,
    emitter: EventEmitter,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self, streams: Streams) {
        let mut transport = None;
        let ending = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ending::user(),
            ending = self.establish(&mut transport) => match ending {
                Ok((connected, profile)) => self.stream(connected, profile, streams).await,
                Err(ending) => ending,
            },
        };
        self.teardown(ending, transport).await;
    }

    /// Connect and log in. The transport is stored in `slot` as soon as it
    /// exists so teardown can close it.
    async fn establish(
        &self,
        slot: &mut Option<Arc<dyn Transport>>,
    ) -> Result<(Arc<dyn Transport>, VideoProfile), Ending> {
        info!(
            address = %self.target.address(),
            fingerprint = %self.target.fingerprint(),
            console = ?self.target.console(),
            "connecting"
        );
        let transport = match tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(&self.target),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(error = %e, "connect failed");
                return Err(Ending::new(e.connect_reason(), e.to_string()));
            }
            Err(_) => {
                let e = TransportError::Timeout(self.connect_timeout);
                warn!(error = %e, "connect timed out");
                return Err(Ending::new(QuitReason::Timeout, e.to_string()));
            }
        };
        *slot = Some(Arc::clone(&transport));

        if self.shared.transition(SessionState::begin_login).is_err() {
            return Err(Ending::user());
        }
        debug!(profile = %self.login.profile, "logging in");
        let profile = match tokio::time::timeout(self.login_timeout, transport.login(&self.login)).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                let reason = e.login_reason();
                warn!(error = %e, %reason, "login failed");
                return Err(Ending {
                    login_refused: reason.is_login_refusal(),
                    ..Ending::new(reason, e.to_string())
                });
            }
            Err(_) => {
                let e = TransportError::Timeout(self.login_timeout);
                warn!(error = %e, "login timed out");
                return Err(Ending::new(QuitReason::Timeout, e.to_string()));
            }
        };

        *self.shared.negotiated.lock() = Some(profile);
        if self.shared.transition(SessionState::begin_streaming).is_err() {
            return Err(Ending::user());
        }
        info!(%profile, "streaming");
        self.emitter.emit(Event::Connected { profile }).await;
        Ok((transport, profile))
    }

    /// Run the stream loops until one of them ends or the session is
    /// cancelled.
    async fn stream(
        &self,
        transport: Arc<dyn Transport>,
        profile: VideoProfile,
        streams: Streams,
    ) -> Ending {
        let Streams { pipeline, uplink } = streams;
        let pipeline = pipeline.with_profile(&profile);
        let loops_cancel = self.cancel.child_token();
        let mut loops = JoinSet::new();

        let (t, c) = (Arc::clone(&transport), loops_cancel.clone());
        loops.spawn(async move { pipeline.run(t, c).await.err().map(Ending::stream) });

        let (t, c, emitter) = (Arc::clone(&transport), loops_cancel.clone(), self.emitter.clone());
        loops.spawn(async move {
            match relay_host_messages(t, emitter, c).await {
                Ok(ending) => ending,
                Err(e) => Some(Ending::stream(e)),
            }
        });

        let (t, c) = (Arc::clone(&transport), loops_cancel.clone());
        loops.spawn(async move { uplink.run(t, c).await.err().map(Ending::stream) });

        let first = loops.join_next().await;
        loops_cancel.cancel();
        let drained = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
            while loops.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("aborting stream loops");
            loops.shutdown().await;
        }

        if self.cancel.is_cancelled() {
            return Ending::user();
        }
        match first {
            Some(Ok(Some(ending))) => ending,
            Some(Ok(None)) | None => Ending::user(),
            Some(Err(e)) => Ending::new(QuitReason::StreamConnectionUnknown, e.to_string()),
        }
    }

    async fn teardown(self, ending: Ending, transport: Option<Arc<dyn Transport>>) {
        let Ending {
            reason,
            detail,
            login_refused,
        } = ending;
        let user_stop = reason == QuitReason::UserRequested;
        *self.shared.quit_reason.lock() = Some(reason);

        // Anything but a user stop is terminal before Quit goes out, so
        // input is refused from then on.
        if !user_stop {
            let _ = self.shared.transition(|s| s.finish(reason.is_error()));
        }
        info!(%reason, error = reason.is_error(), "session ended");

        if login_refused {
            self.emitter.emit(Event::LoginFailed { reason }).await;
        }
        self.emitter.emit(Event::quit(reason, detail)).await;

        if let Some(transport) = transport {
            match tokio::time::timeout(TEARDOWN_TIMEOUT, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "transport close failed"),
                Err(_) => debug!("transport close timed out"),
            }
        }
        if user_stop {
            let _ = self.shared.transition(|s| s.finish(false));
        }
    }
}

/// Relay host notifications as events until the host quits.
async fn relay_host_messages(
    transport: Arc<dyn Transport>,
    emitter: EventEmitter,
    cancel: CancellationToken,
) -> Result<Option<Ending>, TransportError> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            message = transport.recv_host_message() => message?,
        };
        if let HostMessage::Quit { reason, reason_str } = message {
            info!(%reason, "host ended the session");
            return Ok(Some(Ending {
                reason,
                detail: reason_str,
                login_refused: false,
            }));
        }
        if let Some(event) = message.into_event() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = emitter.emit(event) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::event::EventType;
    use crate::transport::SimulatedHost;
    use crate::transport::loopback::LoginBehavior;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(host: &SimulatedHost) -> Session {
        let _ = tracing_subscriber::fmt::try_init();
        let session = Session::with_connector(SessionConfig::default(), Arc::new(host.connector()));
        session.initialize("10.0.0.5", &[0u8; 16]).unwrap();
        session
    }

    fn record_events(session: &Session) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session.register_event_callback(move |ev| sink.lock().push(ev));
        events
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn kinds(events: &Mutex<Vec<Event>>) -> Vec<EventType> {
        events.lock().iter().map(Event::kind).collect()
    }

    #[test]
    fn start_requires_initialize() {
        let host = SimulatedHost::new();
        let session = Session::with_connector(SessionConfig::default(), Arc::new(host.connector()));
        assert!(matches!(session.start(), Err(SessionError::InvalidConfig(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.stop().is_ok());
        assert!(matches!(
            session.submit_controller_state(ControllerState::new()),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn initialize_keeps_configured_console() {
        use crate::profile::Target;

        let mut config = SessionConfig::default();
        config.target.host = "10.0.0.9".into();
        config.target.console = Target::Ps4_10;
        let session = Session::with_config(config);
        assert!(session.target().is_none());

        session.initialize("10.0.0.5", &[1u8; 16]).unwrap();
        let target = session.target().unwrap();
        assert!(target.address().starts_with("10.0.0.5"));
        assert_eq!(target.console(), Target::Ps4_10);
    }

    #[test]
    fn user_stop_delivers_quit_before_returning() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(kinds(&events), vec![EventType::Connected, EventType::Quit]);
        assert!(matches!(
            events.lock().last(),
            Some(Event::Quit {
                reason: QuitReason::UserRequested,
                error: false,
                ..
            })
        ));
        assert!(host.is_closed());
        assert!(session.join().is_ok());
        assert!(matches!(session.initialize("10.0.0.6", &[0u8; 16]), Err(SessionError::AlreadyStarted)));
    }

    #[test]
    fn stop_from_event_callback() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (sink, handle) = (Arc::clone(&events), session.handle());
        session.register_event_callback(move |ev: Event| {
            let connected = ev.kind() == EventType::Connected;
            sink.lock().push(ev);
            if connected {
                handle.stop().unwrap();
            }
        });
        session.start().unwrap();

        assert!(session.join().is_ok());
        assert!(wait_for(|| kinds(&events).len() == 2));
        assert_eq!(kinds(&events), vec![EventType::Connected, EventType::Quit]);
        assert_eq!(session.quit_reason(), Some(QuitReason::UserRequested));
    }

    #[test]
    fn stop_from_video_callback() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = record_events(&session);
        let handle = session.handle();
        session.register_video_callback(move |_| {
            handle.stop().unwrap();
            true
        });
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));

        host.push_frame(1, b"frame", 1400).unwrap();
        assert!(wait_for(|| session.state().is_terminal()));
        assert!(session.join().is_ok());
        assert!(wait_for(|| kinds(&events).last() == Some(&EventType::Quit)));
        assert_eq!(session.video_stats().frames_delivered, 1);
    }

    #[test]
    fn login_refusal_precedes_quit() {
        let host = SimulatedHost::new();
        host.set_login(LoginBehavior::Refuse(QuitReason::SessionRequestRpInUse));
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();

        assert!(matches!(
            session.join(),
            Err(SessionError::Connection(QuitReason::SessionRequestRpInUse))
        ));
        assert!(wait_for(|| kinds(&events).len() == 2));
        assert_eq!(
            events.lock()[0],
            Event::LoginFailed {
                reason: QuitReason::SessionRequestRpInUse
            }
        );
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn login_timeout_fails_session() {
        let host = SimulatedHost::new();
        host.set_login(LoginBehavior::Hang);
        let mut config = SessionConfig::default();
        config.timeouts.login_ms = 50;
        let session = Session::with_connector(config, Arc::new(host.connector()));
        session.initialize("10.0.0.5", &[0u8; 16]).unwrap();
        let events = record_events(&session);
        session.start().unwrap();

        assert!(matches!(
            session.join(),
            Err(SessionError::Connection(QuitReason::Timeout))
        ));
        // join() returns only after teardown closed the transport.
        assert!(host.is_closed());
        assert!(wait_for(|| !events.lock().is_empty()));
        assert!(matches!(
            events.lock()[..],
            [Event::Quit {
                reason: QuitReason::Timeout,
                error: true,
                ..
            }]
        ));
    }

    #[test]
    fn stop_while_logging_in() {
        let host = SimulatedHost::new();
        host.set_login(LoginBehavior::Hang);
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();
        assert!(wait_for(|| session.state() == SessionState::LoggingIn));

        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            events.lock()[..],
            [Event::Quit {
                reason: QuitReason::UserRequested,
                error: false,
                ..
            }]
        ));
        assert!(host.is_closed());
        assert!(session.join().is_ok());
    }

    #[test]
    fn stop_right_after_start() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();
        session.stop().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.quit_reason(), Some(QuitReason::UserRequested));
        let kinds = kinds(&events);
        assert_eq!(kinds.iter().filter(|k| **k == EventType::Quit).count(), 1);
        assert_eq!(kinds.last(), Some(&EventType::Quit));
    }

    #[test]
    fn stop_from_event_callback_with_host_events_queued() {
        let host = SimulatedHost::new();
        for index in 0..4 {
            host.send_host_message(HostMessage::PlayerIndex(index));
        }
        let session = session(&host);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (sink, handle) = (Arc::clone(&events), session.handle());
        session.register_event_callback(move |ev: Event| {
            let connected = ev.kind() == EventType::Connected;
            sink.lock().push(ev);
            if connected {
                handle.stop().unwrap();
            }
        });
        session.start().unwrap();

        assert!(session.join().is_ok());
        assert!(host.is_closed());
        assert!(wait_for(|| kinds(&events).last() == Some(&EventType::Quit)));
        std::thread::sleep(Duration::from_millis(20));
        let kinds = kinds(&events);
        assert_eq!(kinds.first(), Some(&EventType::Connected));
        assert_eq!(kinds.iter().filter(|k| **k == EventType::Quit).count(), 1);
        assert_eq!(kinds.last(), Some(&EventType::Quit));
    }

    #[test]
    fn remote_shutdown_is_clean_stop() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));

        host.send_host_message(HostMessage::Rumble { left: 9, right: 0 });
        host.send_host_message(HostMessage::Quit {
            reason: QuitReason::StreamConnectionRemoteShutdown,
            reason_str: Some("server shutdown".into()),
        });
        assert!(session.join().is_ok());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(wait_for(|| kinds(&events).len() == 3));
        assert_eq!(
            kinds(&events),
            vec![EventType::Connected, EventType::Rumble, EventType::Quit]
        );
        assert!(matches!(
            &events.lock()[2],
            Event::Quit { error: false, reason_str: Some(s), .. } if s == "server shutdown"
        ));
    }

    #[test]
    fn remote_disconnect_fails_session() {
        let host = SimulatedHost::new();
        let session = session(&host);
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));

        host.disconnect();
        assert!(matches!(
            session.join(),
            Err(SessionError::Connection(
                QuitReason::StreamConnectionRemoteDisconnected
            ))
        ));
        assert!(matches!(
            session.submit_controller_state(ControllerState::new()),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn negotiated_profile_is_reported() {
        use crate::profile::{Codec, FpsPreset, ResolutionPreset};

        let host = SimulatedHost::new();
        let granted = VideoProfile::preset(ResolutionPreset::P720, FpsPreset::Fps30, Codec::H264);
        let requested = VideoProfile::default();
        host.set_login(LoginBehavior::Accept(Some(granted)));
        let session = session(&host);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sizes);
        session.register_video_callback(move |frame| {
            sink.lock().push((frame.width(), frame.height()));
            true
        });
        session.set_video_profile(requested).unwrap();
        assert_eq!(session.video_profile(), requested);
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));

        assert_eq!(session.video_profile(), granted);
        assert_eq!(host.login_requests()[0].profile, requested);

        host.push_frame(1, b"idr", 1400).unwrap();
        assert!(wait_for(|| !sizes.lock().is_empty()));
        assert_eq!(sizes.lock()[0], (granted.width, granted.height));
    }

    #[test]
    fn drop_stops_running_session() {
        let host = SimulatedHost::new();
        let session = session(&host);
        let events = record_events(&session);
        session.start().unwrap();
        assert!(wait_for(|| session.state().is_streaming()));
        drop(session);
        assert!(host.is_closed());
        assert_eq!(kinds(&events).last(), Some(&EventType::Quit));
    }
}
