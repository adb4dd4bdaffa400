//! Coordination Client
//!
//! Membership and shard leadership on top of a `Coordinator`:
//!
//! ```text
//! /{cluster}/members/00002          → NodeDescriptor  (bound to node lease)
//! /{cluster}/leaders/shard-00007    → {"node_id": 2}  (bound to node lease)
//! ```
//!
//! A leader key's mod revision is the shard's leader epoch. Because every
//! write bumps the store revision, a later leader always has a larger epoch.
//!
//! Readers get `ClusterState` snapshots from a watch channel fed by a single
//! refresh task; the published version never goes backwards.

use crate::cluster::coordinator::{CoordRequest, CoordResponse, Coordinator, KeyValue, LeaseId};
use crate::cluster::types::{ClusterState, LeaderInfo, NodeDescriptor, NodeId, ShardId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::streaming::retry::RetryPolicy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct LeaderValue {
    node_id: NodeId,
}

pub struct CoordinationClient {
    coordinator: Arc<dyn Coordinator>,
    cluster: String,
    node: NodeDescriptor,
    lease_ttl: Duration,
    retry: RetryPolicy,
    lease: Mutex<Option<LeaseId>>,
    /// Epoch of each leader key this node holds
    leaderships: Mutex<HashMap<ShardId, u64>>,
    state_tx: watch::Sender<ClusterState>,
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("cluster", &self.cluster)
            .field("node_id", &self.node.node_id)
            .field("lease", &*self.lease.lock())
            .finish()
    }
}

impl CoordinationClient {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: &Config, node: NodeDescriptor) -> Self {
        let (state_tx, _) = watch::channel(ClusterState::default());
        CoordinationClient {
            coordinator,
            cluster: config.cluster_name.clone(),
            node,
            lease_ttl: config.lease_ttl,
            retry: config.retry_policy(),
            lease: Mutex::new(None),
            leaderships: Mutex::new(HashMap::new()),
            state_tx,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn lease(&self) -> Option<LeaseId> {
        *self.lease.lock()
    }

    fn prefix(&self) -> String {
        format!("/{}/", self.cluster)
    }

    fn member_key(&self, node: NodeId) -> String {
        format!("/{}/members/{:05}", self.cluster, node)
    }

    fn leader_key(&self, shard: ShardId) -> String {
        format!("/{}/leaders/shard-{:05}", self.cluster, shard)
    }

    /// One request, retried with backoff while the store is unreachable.
    async fn call(&self, operation: &'static str, request: CoordRequest) -> Result<CoordResponse> {
        let mut attempt = 1;
        loop {
            match self.coordinator.execute(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(operation, attempt, ?delay, error = %e, "coordination retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(operation, attempts = attempt, error = %e, "coordination unavailable");
                    return Err(Error::CoordinationUnavailable {
                        operation,
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    fn unexpected(operation: &str, response: CoordResponse) -> Error {
        Error::Protocol(format!("unexpected response to {}: {:?}", operation, response))
    }

    /// Join the cluster: grant a lease and write the member key under it.
    pub async fn register(&self) -> Result<LeaseId> {
        let ttl_ms = self.lease_ttl.as_millis() as u64;
        let lease = match self.call("grant_lease", CoordRequest::GrantLease { ttl_ms }).await? {
            CoordResponse::Lease { id, .. } => id,
            other => return Err(Self::unexpected("grant_lease", other)),
        };
        let value = serde_json::to_string(&self.node)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let put = CoordRequest::Put {
            key: self.member_key(self.node.node_id),
            value,
            lease: Some(lease),
        };
        match self.call("register", put).await? {
            CoordResponse::Written { revision } => {
                *self.lease.lock() = Some(lease);
                self.leaderships.lock().clear();
                info!(node_id = self.node.node_id, lease, revision, "registered");
                Ok(lease)
            }
            other => Err(Self::unexpected("register", other)),
        }
    }

    /// Leave the cluster. Revoking the lease removes the member key and any
    /// leader keys still attached to it. No-op when not registered.
    pub async fn deregister(&self) -> Result<()> {
        let Some(lease) = *self.lease.lock() else {
            return Ok(());
        };
        self.call("revoke", CoordRequest::Revoke { lease }).await?;
        *self.lease.lock() = None;
        self.leaderships.lock().clear();
        info!(node_id = self.node.node_id, lease, "deregistered");
        Ok(())
    }

    /// Remove only the member key. Leader keys stay until the lease expires.
    pub async fn remove_member(&self) -> Result<()> {
        let delete = CoordRequest::DeleteIf {
            key: self.member_key(self.node.node_id),
            expected: None,
        };
        self.call("remove_member", delete).await?;
        info!(node_id = self.node.node_id, "member key removed, lease left to expire");
        Ok(())
    }

    /// Renew the lease. `Ok(false)` means the lease is gone and with it this
    /// node's membership and leaderships.
    pub async fn keep_alive(&self) -> Result<bool> {
        let Some(lease) = *self.lease.lock() else {
            return Ok(false);
        };
        match self.call("keep_alive", CoordRequest::KeepAlive { lease }).await? {
            CoordResponse::Lease { .. } => Ok(true),
            CoordResponse::LeaseExpired { .. } => {
                warn!(node_id = self.node.node_id, lease, "lease expired");
                *self.lease.lock() = None;
                self.leaderships.lock().clear();
                Ok(false)
            }
            other => Err(Self::unexpected("keep_alive", other)),
        }
    }

    /// Renew the lease at a third of its TTL, re-registering if it was lost.
    pub fn spawn_keepalive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let period = (self.lease_ttl / 3).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                match client.keep_alive().await {
                    Ok(true) => {}
                    Ok(false) if !cancel.is_cancelled() => {
                        if let Err(e) = client.register().await {
                            warn!(node_id = client.node_id(), error = %e, "re-register failed");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(node_id = client.node_id(), error = %e, "keep-alive failed"),
                }
            }
        })
    }

    /// Conditionally acquire leadership of `shard`. Returns the leader epoch
    /// on success, `None` if another node holds it.
    pub async fn try_become_leader(&self, shard: ShardId) -> Result<Option<u64>> {
        let Some(lease) = *self.lease.lock() else {
            return Ok(None);
        };
        let value = serde_json::to_string(&LeaderValue {
            node_id: self.node.node_id,
        })
        .map_err(|e| Error::Protocol(e.to_string()))?;
        let cas = CoordRequest::CompareAndSwap {
            key: self.leader_key(shard),
            expected: None,
            value,
            lease: Some(lease),
        };
        let epoch = match self.call("try_become_leader", cas).await? {
            CoordResponse::Written { revision } => revision,
            // A retried acquire whose first response was lost
            CoordResponse::CasFailed { current: Some(kv) }
                if Self::leader_node(&kv) == Some(self.node.node_id) && kv.lease == Some(lease) =>
            {
                kv.mod_revision
            }
            CoordResponse::CasFailed { .. } | CoordResponse::LeaseExpired { .. } => return Ok(None),
            other => return Err(Self::unexpected("try_become_leader", other)),
        };
        self.leaderships.lock().insert(shard, epoch);
        info!(node_id = self.node.node_id, shard, epoch, "became leader");
        Ok(Some(epoch))
    }

    /// Give up leadership of `shard` so a peer can take over at once.
    /// No-op if this node does not hold it.
    pub async fn release_leadership(&self, shard: ShardId) -> Result<()> {
        let Some(epoch) = self.leaderships.lock().get(&shard).copied() else {
            return Ok(());
        };
        let delete = CoordRequest::DeleteIf {
            key: self.leader_key(shard),
            expected: Some(epoch),
        };
        self.call("release_leadership", delete).await?;
        self.leaderships.lock().remove(&shard);
        info!(node_id = self.node.node_id, shard, epoch, "released leadership");
        Ok(())
    }

    /// Forget a leadership locally after observing another leader.
    pub fn forget_leadership(&self, shard: ShardId) {
        self.leaderships.lock().remove(&shard);
    }

    pub fn held_leaderships(&self) -> HashMap<ShardId, u64> {
        self.leaderships.lock().clone()
    }

    fn leader_node(kv: &KeyValue) -> Option<NodeId> {
        serde_json::from_str::<LeaderValue>(&kv.value)
            .ok()
            .map(|v| v.node_id)
    }

    /// Read membership and leadership, publishing the snapshot if it is
    /// newer than the last one.
    pub async fn refresh(&self) -> Result<ClusterState> {
        let range = CoordRequest::Range {
            prefix: self.prefix(),
        };
        let (revision, kvs) = match self.call("refresh", range).await? {
            CoordResponse::Range { revision, kvs } => (revision, kvs),
            other => return Err(Self::unexpected("refresh", other)),
        };

        let members_prefix = format!("/{}/members/", self.cluster);
        let leaders_prefix = format!("/{}/leaders/shard-", self.cluster);
        let mut state = ClusterState {
            version: revision,
            ..ClusterState::default()
        };
        for kv in &kvs {
            if kv.key.starts_with(&members_prefix) {
                match serde_json::from_str::<NodeDescriptor>(&kv.value) {
                    Ok(node) => {
                        state.members.insert(node.node_id, node);
                    }
                    Err(e) => warn!(key = %kv.key, error = %e, "unreadable member entry"),
                }
            } else if let Some(shard) = kv.key.strip_prefix(&leaders_prefix) {
                let shard = shard.parse::<ShardId>().ok();
                match (shard, Self::leader_node(kv)) {
                    (Some(shard), Some(node_id)) => {
                        state.leaders.insert(
                            shard,
                            LeaderInfo {
                                node_id,
                                epoch: kv.mod_revision,
                            },
                        );
                    }
                    _ => warn!(key = %kv.key, "unreadable leader entry"),
                }
            }
        }
        state.derive_roles();

        self.state_tx.send_if_modified(|current| {
            if state.version > current.version || (current.version == 0 && *current != state) {
                *current = state.clone();
                true
            } else {
                false
            }
        });
        Ok(self.current_state())
    }

    /// Latest published snapshot. Missed intermediate versions are never
    /// replayed; only the newest matters.
    pub fn watch_cluster_state(&self) -> watch::Receiver<ClusterState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ClusterState {
        self.state_tx.borrow().clone()
    }

    /// Refresh at `interval` until cancelled.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = client.refresh().await {
                    warn!(node_id = client.node_id(), error = %e, "cluster state refresh failed");
                }
            }
        })
    }
}
