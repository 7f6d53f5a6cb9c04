//! Controller uplink.
//!
//! Submissions land in a single-slot `watch` channel: a newer state
//! overwrites one the uplink task has not sent yet, so a saturated link
//! delays input but never queues it. The same task forwards recovery
//! requests from the video path.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::controller::ControllerState;
use crate::error::TransportError;
use crate::transport::{RecoveryRequest, Transport};

/// Depth of the recovery request queue. Requests beyond it are coalesced.
pub(crate) const RECOVERY_QUEUE_DEPTH: usize = 4;

/// Latest-wins controller slot, seeded with an idle state.
pub(crate) fn controller_channel() -> (watch::Sender<ControllerState>, watch::Receiver<ControllerState>) {
    watch::channel(ControllerState::new())
}

pub(crate) struct Uplink {
    states: watch::Receiver<ControllerState>,
    recovery: mpsc::Receiver<RecoveryRequest>,
}

impl Uplink {
    pub(crate) fn new(
        states: watch::Receiver<ControllerState>,
        recovery: mpsc::Receiver<RecoveryRequest>,
    ) -> Self {
        Self { states, recovery }
    }

    /// Send until cancelled or the transport fails.
    pub(crate) async fn run(
        mut self,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut recovery_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                changed = self.states.changed() => {
                    if changed.is_err() {
                        // Session dropped its sender.
                        return Ok(());
                    }
                    let state = *self.states.borrow_and_update();
                    trace!(buttons = state.buttons.bits(), "controller state out");
                    transport.send_controller_state(&state).await?;
                }
                request = self.recovery.recv(), if recovery_open => match request {
                    Some(request) => {
                        trace!(?request, "recovery request out");
                        transport.request_recovery(request).await?;
                    }
                    None => recovery_open = false,
                },
            }
        }
    }
}
