//! Node admin listener.
//!
//! Bound to the node's entry in `cluster_addresses`. Drives the node's
//! shutdown orchestrator one step at a time so a cluster-wide shutdown can
//! move every node through the same phase before starting the next.

use crate::cluster::types::{NodeId, ShardId};
use crate::cluster::wire;
use crate::node::gate::DrainOutcome;
use crate::shutdown::{NodeShutdownReport, Phase, ShardReport, ShutdownOrchestrator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Stop ingestion and drain queries; `graceful = false` cancels the drain
    Quiesce { graceful: bool },
    /// Flush every owned shard
    Flush,
    /// Release leadership, deregister and stop background tasks
    Stop,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponse {
    Quiesced { drain: DrainOutcome },
    Flushed { shards: Vec<ShardReport> },
    Stopped { report: NodeShutdownReport },
    Status {
        node_id: NodeId,
        phase: Phase,
        owned_shards: Vec<ShardId>,
    },
    Error { message: String },
}

pub(crate) async fn serve(
    listener: TcpListener,
    orchestrator: Arc<ShutdownOrchestrator>,
    cancel: CancellationToken,
) {
    let node_id = orchestrator.node_id();
    if let Ok(addr) = listener.local_addr() {
        info!(node_id, %addr, "admin listener started");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, orchestrator).await {
                            debug!(node_id, %peer, error = %e, "admin connection closed");
                        }
                    });
                }
                Err(e) => warn!(node_id, error = %e, "admin accept failed"),
            }
        }
    }
    // Dropping the listener refuses further connections.
    info!(node_id, "admin listener stopped");
}

async fn handle_connection(stream: TcpStream, orchestrator: Arc<ShutdownOrchestrator>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let mut conn = wire::framed(stream);
    while let Some(request) = wire::recv::<AdminRequest>(&mut conn).await? {
        debug!(node_id = orchestrator.node_id(), ?request, "admin request");
        let response = handle_request(&orchestrator, request).await;
        wire::send(&mut conn, &response).await?;
    }
    Ok(())
}

pub(crate) async fn handle_request(
    orchestrator: &Arc<ShutdownOrchestrator>,
    request: AdminRequest,
) -> AdminResponse {
    let result = match request {
        AdminRequest::Quiesce { graceful } => {
            orchestrator.arm_stop_watchdog();
            orchestrator
                .quiesce(graceful)
                .await
                .map(|drain| AdminResponse::Quiesced { drain })
        }
        AdminRequest::Flush => orchestrator
            .flush()
            .await
            .map(|shards| AdminResponse::Flushed { shards }),
        AdminRequest::Stop => orchestrator
            .stop()
            .await
            .map(|report| AdminResponse::Stopped { report }),
        AdminRequest::Status => Ok(AdminResponse::Status {
            node_id: orchestrator.node_id(),
            phase: orchestrator.phase(),
            owned_shards: orchestrator.owned_shards(),
        }),
    };
    result.unwrap_or_else(|e| AdminResponse::Error {
        message: e.to_string(),
    })
}
