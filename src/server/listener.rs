//! Gateway listener: accept loop and connection lifecycle.
//!
//! One task runs the accept loop; every accepted connection gets its own
//! [`ConnectionFramer`] task. The compiled plan and identity table are shared
//! read-only across all of them; nothing else is shared between connections.
//!
//! Transient accept errors are logged and retried; only an explicit
//! shutdown stops the listener. Shutdown cancels the token, which stops new
//! accepts, lets every framer finish (or discard) its in-flight frame, and
//! then waits for all connection tasks to drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::ChunkPlan;
use crate::types::PointBatch;

use super::framer::ConnectionFramer;
use super::identity::IdentityTable;

/// Pause after a failed accept, so a hot error loop cannot spin the CPU.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The telemetry gateway: listener configuration plus the shared immutable
/// decode state.
pub struct Gateway {
    config: GatewayConfig,
    plan: Arc<ChunkPlan>,
    identity: Arc<IdentityTable>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig, plan: ChunkPlan) -> Self {
        let identity = Arc::new(config.identity_table());
        Self { config, plan: Arc::new(plan), identity, cancel: CancellationToken::new() }
    }

    /// Token observed by the accept loop and every connection task. Cancel
    /// it to shut the gateway down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared compiled plan, for wiring auxiliary ingest paths.
    pub fn plan(&self) -> Arc<ChunkPlan> {
        Arc::clone(&self.plan)
    }

    /// Shared identity table.
    pub fn identity(&self) -> Arc<IdentityTable> {
        Arc::clone(&self.identity)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self, batches: mpsc::Sender<PointBatch>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|err| GatewayError::io("listener bind", err))?;
        self.serve(listener, batches).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve(
        &self,
        listener: TcpListener,
        batches: mpsc::Sender<PointBatch>,
    ) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|err| GatewayError::io("listener address", err))?;
        info!(addr = %local, "telemetry gateway listening");

        let mut connections = JoinSet::new();
        loop {
            // Reap finished framers so the cap counts live connections only.
            while connections.try_join_next().is_some() {}

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown signal, listener closing");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Some(cap) = self.config.max_connections {
                            if connections.len() >= cap {
                                warn!(peer = %peer, cap, "connection cap reached, rejecting");
                                drop(stream);
                                continue;
                            }
                        }
                        debug!(peer = %peer, "connection accepted");
                        let framer = ConnectionFramer::new(
                            peer,
                            Arc::clone(&self.plan),
                            Arc::clone(&self.identity),
                            self.config.idle_timeout(),
                            batches.clone(),
                            self.cancel.child_token(),
                        );
                        connections.spawn(framer.run(stream));
                    }
                    Err(err) => {
                        // Transient accept failures must not take the
                        // listener down; only shutdown does.
                        warn!(error = %err, "accept failed, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("all connections drained");
        Ok(())
    }
}
