//! Connection framer: one task owning one accepted connection.
//!
//! The framer drives the `Accepted -> Identified -> Framing -> Closed`
//! lifecycle. It identifies the device before reading any payload, seeds the
//! per-connection frame context, then repeatedly runs the shared chunk plan
//! to consume one frame at a time, handing each finished batch downstream.
//!
//! The hand-off is a blocking send: a stalled sink backpressures this
//! connection's frame loop (and, through the idle deadline, eventually times
//! it out) instead of dropping data or buffering without bound. Every error
//! is contained to this connection; siblings never notice.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{ChunkPlan, FrameContext};
use crate::types::{FrameAssembler, PointBatch};

use super::identity::IdentityTable;

/// Lifecycle of one connection, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    Accepted,
    Identified,
    Framing,
    Closed,
}

/// Owns one accepted connection for its whole lifetime.
pub struct ConnectionFramer {
    peer: SocketAddr,
    plan: Arc<ChunkPlan>,
    identity: Arc<IdentityTable>,
    idle_timeout: Duration,
    batches: mpsc::Sender<PointBatch>,
    cancel: CancellationToken,
}

impl ConnectionFramer {
    pub fn new(
        peer: SocketAddr,
        plan: Arc<ChunkPlan>,
        identity: Arc<IdentityTable>,
        idle_timeout: Duration,
        batches: mpsc::Sender<PointBatch>,
        cancel: CancellationToken,
    ) -> Self {
        Self { peer, plan, identity, idle_timeout, batches, cancel }
    }

    /// Drive the connection until EOF, timeout, shutdown or a fatal decode
    /// error. Consumes the stream; the socket closes exactly once, when the
    /// framer returns.
    pub async fn run(self, stream: TcpStream) {
        let peer = self.peer;
        let mut state = FramerState::Accepted;
        trace!(peer = %peer, state = ?state, "connection accepted");

        // Accepted -> Identified: whitelist decision before any payload read.
        let device_id = match self.identity.identify(peer) {
            Ok(id) => id,
            Err(err) => {
                state = FramerState::Closed;
                warn!(peer = %peer, error = %err, state = ?state, "connection rejected");
                return;
            }
        };
        state = FramerState::Identified;
        info!(peer = %peer, device = %device_id, state = ?state, "device identified");

        // Identified -> Framing: the context lives as long as the connection
        // and is never reset between frames.
        let mut ctx = FrameContext::seeded(&device_id);
        let mut reader = BufReader::new(stream);
        let mut frame_id = 0u64;
        state = FramerState::Framing;
        trace!(peer = %peer, state = ?state, "entering frame loop");

        loop {
            if self.cancel.is_cancelled() {
                debug!(peer = %peer, device = %device_id, "shutdown between frames");
                break;
            }

            // Only the per-frame state resets; the idle deadline re-arms here.
            let mut frame = FrameAssembler::new(frame_id);
            let decode = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(peer = %peer, device = %device_id, "shutdown during frame, partial frame discarded");
                    break;
                }
                decoded = tokio::time::timeout(
                    self.idle_timeout,
                    self.plan.run_frame(&mut reader, &mut ctx, &mut frame),
                ) => decoded,
            };

            match decode {
                Err(_elapsed) => {
                    warn!(
                        peer = %peer,
                        device = %device_id,
                        timeout = ?self.idle_timeout,
                        "idle read deadline expired, closing connection"
                    );
                    break;
                }
                Ok(Err(err)) if err.is_disconnect() => {
                    info!(peer = %peer, device = %device_id, frames = frame_id, "peer disconnected");
                    break;
                }
                Ok(Err(err)) => {
                    error!(
                        peer = %peer,
                        device = %device_id,
                        frame = frame_id,
                        raw = %frame.raw_hex(),
                        error = %err,
                        "frame decode failed, closing connection"
                    );
                    break;
                }
                Ok(Ok(())) => {
                    let batch = frame.into_batch();
                    trace!(peer = %peer, frame = frame_id, points = batch.points.len(), "frame decoded");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            debug!(peer = %peer, device = %device_id, "shutdown during hand-off, batch discarded");
                            break;
                        }
                        sent = self.batches.send(batch) => {
                            if sent.is_err() {
                                debug!(peer = %peer, device = %device_id, "emission channel closed");
                                break;
                            }
                        }
                    }
                    frame_id += 1;
                }
            }
        }

        state = FramerState::Closed;
        debug!(peer = %peer, device = %device_id, frames = frame_id, state = ?state, "connection closed");
    }
}
