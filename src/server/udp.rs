//! UDP ingest: one datagram, one frame.
//!
//! Datagram devices get the same decode path as stream devices: the source
//! address is identified against the same table, and each device keeps one
//! long-lived frame context, so cross-frame constants behave identically to
//! the TCP path. A datagram that fails to decode is dropped and logged;
//! there is no connection to close.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::{ChunkPlan, FrameContext};
use crate::types::{FrameAssembler, PointBatch};

use super::identity::IdentityTable;

/// Largest datagram the ingest will accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagram-side ingest sharing the gateway's plan and identity table.
pub struct UdpIngest {
    plan: Arc<ChunkPlan>,
    identity: Arc<IdentityTable>,
    batches: mpsc::Sender<PointBatch>,
    cancel: CancellationToken,
}

impl UdpIngest {
    pub fn new(
        plan: Arc<ChunkPlan>,
        identity: Arc<IdentityTable>,
        batches: mpsc::Sender<PointBatch>,
        cancel: CancellationToken,
    ) -> Self {
        Self { plan, identity, batches, cancel }
    }

    /// Receive and decode datagrams until shutdown.
    pub async fn run(&self, socket: UdpSocket) -> Result<()> {
        let local = socket
            .local_addr()
            .map_err(|err| GatewayError::io("udp socket address", err))?;
        info!(addr = %local, "udp ingest listening");

        let mut contexts: HashMap<String, FrameContext> = HashMap::new();
        let mut frame_id = 0u64;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown signal, udp ingest closing");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "udp receive failed, retrying");
                        continue;
                    }
                }
            };
            if len == 0 {
                trace!(peer = %peer, "empty datagram ignored");
                continue;
            }

            let device_id = match self.identity.identify(peer) {
                Ok(id) => id,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "datagram dropped");
                    continue;
                }
            };
            let ctx = contexts
                .entry(device_id.clone())
                .or_insert_with(|| FrameContext::seeded(&device_id));

            let mut frame = FrameAssembler::new(frame_id);
            let mut reader: &[u8] = &buf[..len];
            match self.plan.run_frame(&mut reader, ctx, &mut frame).await {
                Ok(()) => {
                    if !reader.is_empty() {
                        trace!(peer = %peer, leftover = reader.len(), "trailing bytes in datagram");
                    }
                    let batch = frame.into_batch();
                    if self.batches.send(batch).await.is_err() {
                        debug!("emission channel closed, udp ingest stopping");
                        return Ok(());
                    }
                    frame_id += 1;
                }
                Err(err) => {
                    warn!(
                        peer = %peer,
                        device = %device_id,
                        raw = %frame.raw_hex(),
                        error = %err,
                        "datagram decode failed, dropped"
                    );
                }
            }
        }
    }
}
