//! Membership and leadership snapshot types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster-unique small integer, also the index into `cluster_addresses`
pub type NodeId = u32;

pub type ShardId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Follower,
    /// Leads at least one shard
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub cluster_address: String,
    pub api_address: Option<String>,
    pub role: Role,
    /// Whether the node takes shard leadership
    pub processing: bool,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, cluster_address: &str) -> Self {
        NodeDescriptor {
            node_id,
            cluster_address: cluster_address.to_string(),
            api_address: None,
            role: Role::Follower,
            processing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub node_id: NodeId,
    /// Coordination revision at which leadership was acquired. Strictly
    /// increases across successive leaders of a shard.
    pub epoch: u64,
}

/// Immutable snapshot of membership and shard leadership.
///
/// Produced by the coordination client's refresh task and handed to readers
/// by value; nothing mutates a published snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Coordination revision the snapshot was read at
    pub version: u64,
    pub members: BTreeMap<NodeId, NodeDescriptor>,
    pub leaders: BTreeMap<ShardId, LeaderInfo>,
}

impl ClusterState {
    pub fn leader_of(&self, shard: ShardId) -> Option<LeaderInfo> {
        self.leaders.get(&shard).copied()
    }

    pub fn shards_led_by(&self, node: NodeId) -> Vec<ShardId> {
        self.leaders
            .iter()
            .filter(|(_, l)| l.node_id == node)
            .map(|(shard, _)| *shard)
            .collect()
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    /// Deterministic placement: processing members sorted by id, round-robin
    /// over shards.
    pub fn preferred_owner(&self, shard: ShardId) -> Option<NodeId> {
        let candidates: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| m.processing)
            .map(|m| m.node_id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[shard as usize % candidates.len()])
    }

    /// Mark members that lead a shard as `Role::Leader`.
    pub(crate) fn derive_roles(&mut self) {
        for member in self.members.values_mut() {
            member.role = Role::Follower;
        }
        for leader in self.leaders.values() {
            if let Some(member) = self.members.get_mut(&leader.node_id) {
                member.role = Role::Leader;
            }
        }
    }
}
