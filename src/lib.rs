//! streamvault: cluster-coordinated durable shutdown and recovery for a
//! sharded streaming engine.
//!
//! Records are buffered per shard in memory, flushed as immutable segments to
//! an object store, and made durable by publishing a new version of the
//! shard's level manifest. Membership and shard leadership live in an
//! external linearizable store reached through the coordination client.
//!
//! ```text
//! ingest → WriteBufferManager → Segment → ObjectStore
//!                  ↓
//!          ManifestStore (conditional publish, v-N → v-N+1)
//!                  ↑
//! ShutdownOrchestrator: quiesce → flush → deregister → stop
//! ```

pub mod buggify;
pub mod cluster;
pub mod config;
pub mod error;
pub mod io;
pub mod node;
pub mod observability;
pub mod shutdown;
pub mod streaming;

#[cfg(test)]
mod model;

pub use cluster::{ClusterState, CoordinationClient, NodeDescriptor, NodeId, ShardId};
pub use config::Config;
pub use error::{Error, Result};
pub use node::{Node, NodeDeps};
pub use shutdown::{
    perform_shutdown, perform_shutdown_scoped, ClusterShutdownReport, NodeShutdownReport, Phase,
    ShutdownScope,
};
