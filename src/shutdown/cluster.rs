//! Shutdown across nodes.
//!
//! `perform_shutdown` drives every node named in `cluster_addresses`
//! through the admin protocol in lockstep: all nodes quiesce, then all
//! flush, then all stop. Nodes within a phase run in parallel. Quiesce and
//! flush are bounded by `shutdown_phase_timeout`; a node that misses one is
//! not written off but still sent the stop request, bounded by
//! `shutdown_stop_timeout`, which waits out its flush and returns its report.
//! Only a node that cannot answer the stop request is unreachable.
//!
//! A node whose listener refuses the first connection is already stopped.

use crate::cluster::types::{NodeId, ShardId};
use crate::cluster::wire;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::admin::{AdminRequest, AdminResponse};
use crate::shutdown::orchestrator::NodeShutdownReport;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownScope {
    Node(NodeId),
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOutcome {
    Stopped(NodeShutdownReport),
    AlreadyStopped,
    Unreachable { error: String },
    /// The node answered with an error
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub address: String,
    pub outcome: NodeOutcome,
}

impl NodeResult {
    fn is_success(&self) -> bool {
        match &self.outcome {
            NodeOutcome::Stopped(report) => report.is_success(),
            NodeOutcome::AlreadyStopped => true,
            NodeOutcome::Unreachable { .. } | NodeOutcome::Failed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterShutdownReport {
    pub scope: ShutdownScope,
    pub graceful: bool,
    /// Sorted by node id
    pub nodes: Vec<NodeResult>,
}

impl ClusterShutdownReport {
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(NodeResult::is_success)
    }

    /// Every shard that could not be flushed, with the node that owned it
    pub fn failed_shards(&self) -> Vec<(NodeId, ShardId)> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.outcome {
                NodeOutcome::Stopped(report) => Some(report),
                _ => None,
            })
            .flat_map(|report| {
                report
                    .failed_shards()
                    .into_iter()
                    .map(move |shard| (report.node_id, shard))
            })
            .collect()
    }

    pub fn flushed_segments(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match &n.outcome {
                NodeOutcome::Stopped(report) => report.flushed_segments(),
                _ => 0,
            })
            .sum()
    }
}

impl std::fmt::Display for ClusterShutdownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} node(s)", self.nodes.len())?;
        for node in &self.nodes {
            match &node.outcome {
                NodeOutcome::Stopped(report) => write!(f, "; {}", report)?,
                NodeOutcome::AlreadyStopped => write!(f, "; node {} already stopped", node.node_id)?,
                NodeOutcome::Unreachable { error } => {
                    write!(f, "; node {} ({}) unreachable: {}", node.node_id, node.address, error)?
                }
                NodeOutcome::Failed { error } => write!(f, "; node {} failed: {}", node.node_id, error)?,
            }
        }
        Ok(())
    }
}

/// Shut down every node of the cluster described by `config`.
///
/// Returns once every node is stopped or accounted for. Failed shards and
/// unreachable nodes are itemized in `Error::ShutdownIncomplete`.
pub async fn perform_shutdown(config: &Config, graceful: bool) -> Result<ClusterShutdownReport> {
    perform_shutdown_scoped(config, ShutdownScope::Cluster, graceful).await
}

pub async fn perform_shutdown_scoped(
    config: &Config,
    scope: ShutdownScope,
    graceful: bool,
) -> Result<ClusterShutdownReport> {
    let targets: Vec<(NodeId, String)> = match scope {
        ShutdownScope::Cluster => config
            .cluster_addresses
            .iter()
            .enumerate()
            .map(|(id, addr)| (id as NodeId, addr.clone()))
            .collect(),
        ShutdownScope::Node(id) => {
            let addr = config.cluster_addresses.get(id as usize).ok_or_else(|| {
                Error::Config(format!("node {} has no entry in cluster_addresses", id))
            })?;
            vec![(id, addr.clone())]
        }
    };
    if targets.is_empty() {
        return Err(Error::Config("cluster_addresses is empty".to_string()));
    }
    info!(?scope, graceful, nodes = targets.len(), "shutdown requested");

    let mut outcomes: BTreeMap<NodeId, NodeOutcome> = BTreeMap::new();
    // Nodes that missed an earlier step, with what went wrong
    let mut lagging: BTreeMap<NodeId, String> = BTreeMap::new();
    let steps = [
        AdminRequest::Quiesce { graceful },
        AdminRequest::Flush,
        AdminRequest::Stop,
    ];

    for step in steps {
        let active: Vec<&(NodeId, String)> = targets
            .iter()
            .filter(|(id, _)| !outcomes.contains_key(id))
            .collect();
        if active.is_empty() {
            break;
        }
        let timeout = match step {
            AdminRequest::Stop => config.shutdown_stop_timeout,
            _ => config.shutdown_phase_timeout,
        };
        let replies = join_all(active.into_iter().map(|(id, addr)| async move {
            let reply = wire::request::<_, AdminResponse>(addr, &step, timeout).await;
            (*id, addr.as_str(), reply)
        }))
        .await;

        for (id, addr, reply) in replies {
            let outcome = match reply {
                Ok(AdminResponse::Stopped { report }) => Some(NodeOutcome::Stopped(report)),
                Ok(AdminResponse::Error { message }) => {
                    warn!(node_id = id, ?step, error = %message, "node reported an error");
                    Some(NodeOutcome::Failed { error: message })
                }
                Ok(other) if step == AdminRequest::Stop => Some(NodeOutcome::Failed {
                    error: format!("unexpected reply to stop: {:?}", other),
                }),
                Ok(_) => None,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused && matches!(step, AdminRequest::Quiesce { .. }) => {
                    info!(node_id = id, %addr, "node already stopped");
                    Some(NodeOutcome::AlreadyStopped)
                }
                Err(e) if step == AdminRequest::Stop => {
                    warn!(node_id = id, %addr, error = %e, "node unreachable");
                    let mut error = lagging.remove(&id).map(|earlier| earlier + "; ").unwrap_or_default();
                    error.push_str(&format!("{:?}: {}", step, e));
                    Some(NodeOutcome::Unreachable { error })
                }
                Err(e) => {
                    warn!(node_id = id, %addr, ?step, error = %e, "node missed step, will still be stopped");
                    lagging.entry(id).or_insert_with(|| format!("{:?}: {}", step, e));
                    None
                }
            };
            if let Some(outcome) = outcome {
                outcomes.insert(id, outcome);
            }
        }
    }

    let report = ClusterShutdownReport {
        scope,
        graceful,
        nodes: targets
            .into_iter()
            .map(|(node_id, address)| NodeResult {
                outcome: outcomes.remove(&node_id).unwrap_or(NodeOutcome::Failed {
                    error: "no result".to_string(),
                }),
                node_id,
                address,
            })
            .collect(),
    };

    if report.is_success() {
        info!(flushed = report.flushed_segments(), "shutdown complete");
        Ok(report)
    } else {
        for (node, shard) in report.failed_shards() {
            error!(node_id = node, shard, "shard not flushed");
        }
        Err(Error::ShutdownIncomplete(Box::new(report)))
    }
}
