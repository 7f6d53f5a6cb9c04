//! Video delivery: fragments in, padded frames out to the callback.
//!
//! ```text
//! Transport::recv_fragment ─► FrameAssembler ─► FramePool ─► [depth N] ─► rplay-video thread ─► callback
//!        (tokio task)                            │                               │
//!                                                └──────── recycle ◄─────────────┘
//! ```
//!
//! The receive task never waits on the consumer. When every pool buffer is
//! still held by the delivery thread the assembled frame is skipped, and
//! the gap shows up as `frames_lost` on the next delivered frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::profile::VideoProfile;
use crate::transport::{RecoveryRequest, Transport, VideoFragment};
use crate::video::assembler::{CompletedFrame, FrameAssembler};
use crate::video::frame::{FramePool, VideoFrame};

/// Callbacks should return within this budget to keep delivery real-time.
/// Slower calls are logged but never interrupted.
pub const RECOMMENDED_CALLBACK_BUDGET: Duration = Duration::from_millis(5);

/// Video callback: return `false` to ask the host for a recovery frame.
pub type VideoCallback = Arc<dyn Fn(&VideoFrame) -> bool + Send + Sync + 'static>;

pub(crate) type VideoSlot = Arc<Mutex<Option<VideoCallback>>>;

// ── Stats ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct VideoCounters {
    fragments: AtomicU64,
    bytes: AtomicU64,
    delivered: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
    recovery_requests: AtomicU64,
}

impl VideoCounters {
    pub(crate) fn snapshot(&self) -> VideoStats {
        VideoStats {
            fragments_received: self.fragments.load(Ordering::Relaxed),
            bytes_received: self.bytes.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_skipped: self.skipped.load(Ordering::Relaxed),
            frames_discarded: self.discarded.load(Ordering::Relaxed),
            frames_rejected: self.rejected.load(Ordering::Relaxed),
            recovery_requests: self.recovery_requests.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of video pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoStats {
    pub fragments_received: u64,
    pub bytes_received: u64,
    /// Frames handed to the delivery thread.
    pub frames_delivered: u64,
    /// Complete frames dropped because no pool buffer was free.
    pub frames_skipped: u64,
    /// Incomplete frames discarded by the assembler.
    pub frames_discarded: u64,
    /// Frames the callback answered `false` for.
    pub frames_rejected: u64,
    pub recovery_requests: u64,
}

// ── LossTracker ──────────────────────────────────────────────────

/// Computes loss metadata at hand-off time.
///
/// `frames_lost` is the index gap to the previously delivered frame, so
/// it covers frames the assembler discarded, frames that never arrived and
/// frames skipped for lack of a buffer alike.
#[derive(Debug, Default)]
pub struct LossTracker {
    last_delivered: Option<u32>,
}

impl LossTracker {
    /// Record `sequence` as delivered; returns `(frames_lost, recovered)`.
    pub fn admit(&mut self, sequence: u32) -> (u32, bool) {
        let lost = match self.last_delivered {
            Some(last) => sequence.saturating_sub(last).saturating_sub(1),
            None => 0,
        };
        self.last_delivered = Some(sequence);
        (lost, lost > 0)
    }
}

// ── Receive side ─────────────────────────────────────────────────

pub(crate) struct VideoPipeline {
    assembler: FrameAssembler,
    tracker: LossTracker,
    pool: FramePool,
    frames: mpsc::Sender<VideoFrame>,
    recovery: mpsc::Sender<RecoveryRequest>,
    counters: Arc<VideoCounters>,
    dimensions: (u32, u32),
}

impl VideoPipeline {
    pub(crate) fn new(
        pool: FramePool,
        frames: mpsc::Sender<VideoFrame>,
        recovery: mpsc::Sender<RecoveryRequest>,
        counters: Arc<VideoCounters>,
    ) -> Self {
        Self {
            assembler: FrameAssembler::new(),
            tracker: LossTracker::default(),
            pool,
            frames,
            recovery,
            counters,
            dimensions: (0, 0),
        }
    }

    /// Stamp delivered frames with `profile`'s resolution.
    pub(crate) fn with_profile(mut self, profile: &VideoProfile) -> Self {
        self.dimensions = (profile.width, profile.height);
        self
    }

    /// Receive fragments until cancelled or the transport fails.
    pub(crate) async fn run(
        mut self,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        loop {
            let fragment = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = transport.recv_fragment() => r?,
            };
            self.handle_fragment(fragment);
        }
    }

    pub(crate) fn handle_fragment(&mut self, fragment: VideoFragment) {
        self.counters.fragments.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(fragment.payload.len() as u64, Ordering::Relaxed);

        let completed = self.assembler.push(fragment);
        self.counters
            .discarded
            .store(self.assembler.stats().discarded_frames, Ordering::Relaxed);

        if let Some(frame) = completed {
            self.hand_off(frame);
        }
    }

    fn hand_off(&mut self, done: CompletedFrame) {
        let permit = match self.frames.try_reserve() {
            Ok(permit) => permit,
            Err(_) => {
                self.skip(done.frame_index);
                return;
            }
        };
        let Some(buf) = self.pool.acquire() else {
            self.skip(done.frame_index);
            return;
        };

        let sequence = done.frame_index;
        let (lost, recovered) = self.tracker.admit(sequence);
        if lost > 0 {
            debug!(sequence, lost, "frames lost before delivery");
            self.request_recovery(RecoveryRequest::FramesLost {
                first: sequence - lost,
                last: sequence - 1,
            });
        }

        let (width, height) = self.dimensions;
        permit.send(
            VideoFrame::assemble(buf, done.parts(), sequence, lost, recovered)
                .with_dimensions(width, height),
        );
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn skip(&self, frame_index: u32) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        trace!(frame = frame_index, "consumer busy, skipping frame");
    }

    fn request_recovery(&self, request: RecoveryRequest) {
        send_recovery(&self.recovery, &self.counters, request);
    }
}

fn send_recovery(
    tx: &mpsc::Sender<RecoveryRequest>,
    counters: &VideoCounters,
    request: RecoveryRequest,
) {
    // A pending request already asks for a fresh reference frame.
    if tx.try_send(request).is_ok() {
        counters.recovery_requests.fetch_add(1, Ordering::Relaxed);
    } else {
        trace!(?request, "recovery request coalesced");
    }
}

// ── Delivery side ────────────────────────────────────────────────

/// Start the video delivery thread. It exits when the frame channel closes.
pub(crate) fn spawn_video_thread(
    slot: VideoSlot,
    mut frames: mpsc::Receiver<VideoFrame>,
    pool: FramePool,
    recovery: mpsc::Sender<RecoveryRequest>,
    counters: Arc<VideoCounters>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rplay-video".into())
        .spawn(move || {
            while let Some(frame) = frames.blocking_recv() {
                let callback = slot.lock().clone();
                let accepted = match callback {
                    Some(cb) => {
                        let started = Instant::now();
                        let accepted = cb(&frame);
                        let elapsed = started.elapsed();
                        if elapsed > RECOMMENDED_CALLBACK_BUDGET {
                            warn!(sequence = frame.sequence(), ?elapsed, "slow video callback");
                        }
                        accepted
                    }
                    None => true,
                };
                if !accepted {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    send_recovery(
                        &recovery,
                        &counters,
                        RecoveryRequest::Rejected {
                            frame_index: frame.sequence(),
                        },
                    );
                }
                pool.recycle(frame);
            }
        })
}
