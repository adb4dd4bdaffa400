//! Cluster membership and shard leadership.
//!
//! - `types`: `ClusterState` snapshots and node descriptors
//! - `coordinator`: the linearizable store capability (in-process impl)
//! - `client`: registration, leases, leadership, state refresh
//! - `remote`: the coordination store served over TCP
//! - `wire`: length-prefixed JSON frames

pub mod client;
pub mod coordinator;
pub mod remote;
pub mod types;
pub mod wire;

pub use client::CoordinationClient;
pub use coordinator::{CoordError, CoordRequest, CoordResponse, Coordinator, InMemoryCoordinator};
pub use remote::{CoordinationServer, RemoteCoordinator};
pub use types::{ClusterState, LeaderInfo, NodeDescriptor, NodeId, Role, ShardId};
