//! Coordinated shutdown: the per-node state machine and the cluster-wide
//! driver built on the admin protocol.

pub mod cluster;
pub mod orchestrator;

pub use cluster::{
    perform_shutdown, perform_shutdown_scoped, ClusterShutdownReport, NodeOutcome, NodeResult,
    ShutdownScope,
};
pub use orchestrator::{NodeShutdownReport, Phase, ShardOutcome, ShardReport, ShutdownOrchestrator};
