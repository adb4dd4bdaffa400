//! A running node: coordination, shard ownership, ingestion, queries and
//! the admin listener, wired together.
//!
//! ## Background tasks
//!
//! ```text
//! keepalive   renew lease at ttl/3
//! refresh     ClusterState every cluster_state_update_interval
//! ownership   acquire orphaned shards, drop shards led elsewhere
//! flush       age/size flush timer (+ manifest retention)
//! admin       Quiesce / Flush / Stop / Status
//! ```

pub mod admin;
pub mod gate;

use crate::cluster::coordinator::{Coordinator, InMemoryCoordinator};
use crate::cluster::remote::RemoteCoordinator;
use crate::cluster::types::{ClusterState, NodeDescriptor, NodeId, ShardId};
use crate::cluster::CoordinationClient;
use crate::config::{Config, ObjectStoreKind};
use crate::error::{Error, Result};
use crate::shutdown::{NodeShutdownReport, Phase, ShutdownOrchestrator};
use crate::streaming::clock::{Clock, SystemClock};
use crate::streaming::flush_worker::{FlushWorker, FlushWorkerHandle};
use crate::streaming::manifest::ManifestStore;
use crate::streaming::object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
use crate::streaming::recovery::RecoveryManager;
use crate::streaming::retry::RetryingObjectStore;
use crate::streaming::segment::Record;
use crate::streaming::write_buffer::{WriteBufferConfig, WriteBufferManager};
use gate::QueryGate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ticks a shard must stay leaderless before a non-preferred node takes it
const ORPHAN_TICKS_MAX: u32 = 3;

/// External collaborators of a node.
#[derive(Clone)]
pub struct NodeDeps {
    pub store: Arc<dyn ObjectStore>,
    pub coordinator: Arc<dyn Coordinator>,
    pub clock: Arc<dyn Clock>,
}

impl NodeDeps {
    pub fn new(store: Arc<dyn ObjectStore>, coordinator: Arc<dyn Coordinator>) -> Self {
        NodeDeps {
            store,
            coordinator,
            clock: Arc::new(SystemClock),
        }
    }

    /// Build the object store and coordinator named by the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.object_store.kind {
            ObjectStoreKind::Memory => Arc::new(InMemoryObjectStore::new()),
            ObjectStoreKind::LocalFs => {
                let path = config
                    .object_store
                    .path
                    .clone()
                    .ok_or_else(|| Error::Config("localfs object store needs a path".to_string()))?;
                Arc::new(LocalFsObjectStore::new(path))
            }
            #[cfg(feature = "s3")]
            ObjectStoreKind::S3 => {
                let s3 = config
                    .object_store
                    .s3
                    .as_ref()
                    .ok_or_else(|| Error::Config("s3 object store needs an [object_store.s3] section".to_string()))?;
                Arc::new(crate::streaming::s3_store::S3ObjectStore::new(s3)?)
            }
            #[cfg(not(feature = "s3"))]
            ObjectStoreKind::S3 => {
                return Err(Error::Config(
                    "s3 object store requires the `s3` feature".to_string(),
                ))
            }
        };
        let coordinator: Arc<dyn Coordinator> = if config.cluster_manager_addresses.is_empty() {
            Arc::new(InMemoryCoordinator::new())
        } else {
            Arc::new(RemoteCoordinator::new(
                config.cluster_manager_addresses.clone(),
                config.lease_ttl,
            ))
        };
        Ok(NodeDeps::new(store, coordinator))
    }
}

/// State shared by the node's tasks and its shutdown orchestrator.
pub(crate) struct NodeCore {
    pub(crate) config: Config,
    pub(crate) client: Arc<CoordinationClient>,
    pub(crate) buffers: Arc<WriteBufferManager>,
    pub(crate) recovery: RecoveryManager,
    pub(crate) gate: Arc<QueryGate>,
    pub(crate) phase_tx: watch::Sender<Phase>,
    /// Parent of every background task except the admin listener
    pub(crate) tasks_cancel: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) flush_worker: Mutex<Option<FlushWorkerHandle>>,
    pub(crate) admin_cancel: CancellationToken,
}

impl NodeCore {
    pub(crate) fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            info!(node_id = self.node_id(), from = ?previous, to = ?phase, "phase transition");
        }
    }
}

pub struct Node {
    core: Arc<NodeCore>,
    orchestrator: Arc<ShutdownOrchestrator>,
    admin_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.core.node_id())
            .field("phase", &self.core.phase())
            .field("admin_addr", &self.admin_addr)
            .finish()
    }
}

impl Node {
    pub async fn start_from_config(config: Config) -> Result<Node> {
        let deps = NodeDeps::from_config(&config)?;
        Self::start(config, deps).await
    }

    /// Register with the cluster, start background tasks and begin taking
    /// shard leadership. A shard accepts writes only after it has been
    /// rehydrated from its latest manifest.
    pub async fn start(config: Config, deps: NodeDeps) -> Result<Node> {
        config.validate()?;
        let node_id = config.node_id;

        let admin_listener = match config.cluster_address() {
            Some(addr) => Some(tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                Error::Config(format!("cannot bind cluster address {}: {}", addr, e))
            })?),
            None => None,
        };
        let admin_addr = admin_listener
            .as_ref()
            .map(|l| l.local_addr())
            .transpose()
            .map_err(|e| Error::Config(e.to_string()))?;

        let store: Arc<dyn ObjectStore> =
            Arc::new(RetryingObjectStore::new(deps.store.clone(), config.retry_policy()));
        let manifests = ManifestStore::new(store, &config.cluster_name);
        let buffers = Arc::new(WriteBufferManager::new(
            WriteBufferConfig::from_config(&config),
            manifests.clone(),
            deps.clock.clone(),
        ));

        let mut descriptor = NodeDescriptor::new(
            node_id,
            &admin_addr.map(|a| a.to_string()).unwrap_or_default(),
        );
        descriptor.api_address = config.api_address().map(str::to_string);
        descriptor.processing = config.processing_enabled;
        let client = Arc::new(CoordinationClient::new(deps.coordinator.clone(), &config, descriptor));
        client.register().await?;
        client.refresh().await?;

        let (phase_tx, _) = watch::channel(Phase::Running);
        let core = Arc::new(NodeCore {
            recovery: RecoveryManager::new(manifests),
            config,
            client,
            buffers,
            gate: Arc::new(QueryGate::new()),
            phase_tx,
            tasks_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            flush_worker: Mutex::new(None),
            admin_cancel: CancellationToken::new(),
        });
        let orchestrator = Arc::new(ShutdownOrchestrator::new(core.clone()));

        {
            let cancel = &core.tasks_cancel;
            let mut tasks = core.tasks.lock();
            tasks.push(core.client.spawn_keepalive(cancel.child_token()));
            tasks.push(
                core.client
                    .spawn_refresh(core.config.cluster_state_update_interval, cancel.child_token()),
            );
            tasks.push(tokio::spawn(ownership_loop(core.clone(), cancel.child_token())));
        }
        let retain = core
            .config
            .level_manager_enabled
            .then_some(core.config.manifest_retained_versions);
        *core.flush_worker.lock() = Some(
            FlushWorker::new(core.buffers.clone(), core.config.min_snapshot_interval, retain)
                .spawn(&core.tasks_cancel),
        );
        if let Some(listener) = admin_listener {
            tokio::spawn(admin::serve(listener, orchestrator.clone(), core.admin_cancel.clone()));
        }

        info!(node_id, admin = ?admin_addr, "node started");
        Ok(Node {
            core,
            orchestrator,
            admin_addr,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id()
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.core.phase_tx.subscribe()
    }

    pub fn cluster_state(&self) -> ClusterState {
        self.core.client.current_state()
    }

    /// Shards this node leads and has rehydrated
    pub fn owned_shards(&self) -> Vec<ShardId> {
        self.core.buffers.owned_shards()
    }

    pub fn buffered_records(&self, shard: ShardId) -> usize {
        self.core.buffers.buffered_len(shard)
    }

    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        crc32fast::hash(key) % self.core.config.shard_count
    }

    /// Buffer one record. Returns its sequence number; durability follows
    /// with the next flush of the shard.
    pub fn ingest(&self, shard: ShardId, key: &[u8], value: &[u8]) -> Result<u64> {
        match self.core.buffers.append(shard, key.to_vec(), value.to_vec()) {
            Err(Error::ShardNotOwned { shard, .. }) => Err(Error::ShardNotOwned {
                shard,
                leader: self.cluster_state().leader_of(shard).map(|l| l.node_id),
            }),
            other => other,
        }
    }

    /// Make a shard's buffer durable now.
    pub async fn flush_shard(&self, shard: ShardId) -> Result<u64> {
        Ok(self.core.buffers.flush_now(shard).await?.manifest.version)
    }

    /// Every record visible for `shard`: durable segments from the latest
    /// manifest plus, on the leader, records not yet flushed. Ordered by
    /// (epoch, sequence).
    pub async fn scan(&self, shard: ShardId) -> Result<Vec<Record>> {
        let node = self.node_id();
        let permit = self
            .core
            .gate
            .admit()
            .ok_or(Error::QueryRejected { node })?;

        let work = async {
            let mut records = self.core.recovery.load_shard(shard).await?.records;
            if let Some(buffered) = self.core.buffers.buffered_records(shard) {
                records.extend(buffered);
            }
            records.sort_by_key(|r| (r.epoch, r.sequence));
            records.dedup_by_key(|r| (r.epoch, r.sequence));
            Ok::<_, Error>(records)
        };
        tokio::select! {
            result = work => result,
            _ = permit.cancelled() => Err(Error::QueryRejected { node }),
        }
    }

    /// Poll cluster state until `shard` has a leader.
    pub async fn wait_for_leader(&self, shard: ShardId, timeout: Duration) -> Result<NodeId> {
        let mut rx = self.core.client.watch_cluster_state();
        let wait = async {
            loop {
                if let Some(leader) = rx.borrow_and_update().leader_of(shard) {
                    return Ok(leader.node_id);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ShardNotOwned { shard, leader: None });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ShardNotOwned { shard, leader: None })?
    }

    /// Drive this node through quiesce, flush and deregistration.
    pub async fn shutdown(&self, graceful: bool) -> Result<NodeShutdownReport> {
        self.orchestrator.run(graceful).await
    }

    /// Admission for the query layer; closed once the node quiesces.
    pub fn query_gate(&self) -> &Arc<QueryGate> {
        &self.core.gate
    }

    pub fn orchestrator(&self) -> &Arc<ShutdownOrchestrator> {
        &self.orchestrator
    }

    /// Resolves once the node reaches a terminal phase.
    pub async fn stopped(&self) {
        let mut rx = self.watch_phase();
        let _ = rx.wait_for(|p| p.is_terminal()).await;
    }
}

/// Reconcile local shard ownership with cluster state.
async fn ownership_loop(core: Arc<NodeCore>, cancel: CancellationToken) {
    let mut state_rx = core.client.watch_cluster_state();
    let mut tick = tokio::time::interval(core.config.cluster_state_update_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut orphaned: HashMap<ShardId, u32> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let state = state_rx.borrow_and_update().clone();
        reconcile(&core, &state, &mut orphaned, &cancel).await;
    }
    debug!(node_id = core.node_id(), "ownership loop stopped");
}

async fn reconcile(
    core: &NodeCore,
    state: &ClusterState,
    orphaned: &mut HashMap<ShardId, u32>,
    cancel: &CancellationToken,
) {
    let me = core.node_id();
    let held = core.client.held_leaderships();

    for shard in 0..core.config.shard_count {
        if cancel.is_cancelled() {
            return;
        }
        let leader = state.leader_of(shard);

        if let Some(epoch) = core.buffers.epoch_of(shard) {
            // Only trust snapshots taken after our acquisition.
            if state.version < epoch {
                continue;
            }
            let still_mine = leader.is_some_and(|l| l.node_id == me && l.epoch == epoch);
            if !still_mine {
                let dropped = core.buffers.relinquish(shard);
                core.client.forget_leadership(shard);
                warn!(node_id = me, shard, epoch, new_leader = ?leader, dropped, "leadership lost");
            }
            continue;
        }

        if core.phase() != Phase::Running || !core.config.processing_enabled {
            continue;
        }

        let epoch = match leader {
            Some(l) if l.node_id == me && held.get(&shard) == Some(&l.epoch) => Some(l.epoch),
            Some(_) => {
                orphaned.remove(&shard);
                None
            }
            None => {
                let ticks = orphaned.entry(shard).or_insert(0);
                *ticks += 1;
                if state.preferred_owner(shard) == Some(me) || *ticks > ORPHAN_TICKS_MAX {
                    match core.client.try_become_leader(shard).await {
                        Ok(epoch) => epoch,
                        Err(e) => {
                            warn!(node_id = me, shard, error = %e, "leadership attempt failed");
                            None
                        }
                    }
                } else {
                    None
                }
            }
        };

        if let Some(epoch) = epoch {
            orphaned.remove(&shard);
            if let Err(e) = core.buffers.acquire(shard, epoch).await {
                warn!(node_id = me, shard, error = %e, "rehydration failed, releasing shard");
                if let Err(e) = core.client.release_leadership(shard).await {
                    warn!(node_id = me, shard, error = %e, "release after failed rehydration failed");
                }
            }
        }
    }
}
