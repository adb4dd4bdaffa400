//! Shutdown Orchestrator (node scope)
//!
//! ```text
//! Running ─quiesce─▶ Quiescing ─flush─▶ Flushing ─stop─▶ Deregistering ─▶ Stopped
//!                                                                     └─▶ Failed (shards listed)
//! ```
//!
//! - **Quiescing**: ingestion closed, query gate closed, flush timer
//!   stopped, in-flight queries drained (or cancelled when forced).
//! - **Flushing**: every owned shard flushed by its own task with its own
//!   cancellation token; transient failures retried with backoff. A shard
//!   that exhausts its attempts is marked failed without holding up the rest.
//! - **Deregistering**: leadership of cleanly flushed shards released,
//!   then the node leaves the cluster. Failed shards keep their leader key
//!   until the lease expires, and the admin listener stays up so a repeated
//!   shutdown still sees them.
//!
//! Each step runs at most once; repeating a step returns its recorded
//! result, so retried admin requests and double shutdowns have no side
//! effects.

use crate::cluster::types::{NodeId, ShardId};
use crate::error::{Error, Result};
use crate::node::gate::DrainOutcome;
use crate::node::NodeCore;
use crate::streaming::retry::RetryPolicy;
use crate::streaming::write_buffer::{FlushResult, WriteBufferManager};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Running,
    Quiescing,
    Flushing,
    Deregistering,
    Stopped,
    /// Stopped with one or more shards that could not be flushed
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardOutcome {
    Flushed { version: u64, records: u32 },
    NothingToFlush { version: u64 },
    /// Another node is authoritative for the shard; no durability claimed
    HandedOver { reason: String },
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard: ShardId,
    pub outcome: ShardOutcome,
}

impl ShardReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ShardOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShutdownReport {
    pub node_id: NodeId,
    pub graceful: bool,
    pub drain: Option<DrainOutcome>,
    /// Sorted by shard
    pub shards: Vec<ShardReport>,
    /// Whether the node's membership was removed from the coordination store
    pub deregistered: bool,
    pub phase: Phase,
}

impl NodeShutdownReport {
    pub fn failed_shards(&self) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.shard)
            .collect()
    }

    /// Segments written during the flush phase
    pub fn flushed_segments(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| matches!(s.outcome, ShardOutcome::Flushed { .. }))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.phase == Phase::Stopped
    }
}

impl std::fmt::Display for NodeShutdownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node {} {:?}: {} shards, {} flushed",
            self.node_id,
            self.phase,
            self.shards.len(),
            self.flushed_segments()
        )?;
        for report in &self.shards {
            if let ShardOutcome::Failed { attempts, reason } = &report.outcome {
                write!(
                    f,
                    "; shard {} failed after {} attempts: {}",
                    report.shard, attempts, reason
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Progress {
    graceful: bool,
    drain: Option<DrainOutcome>,
    shards: Option<Vec<ShardReport>>,
    report: Option<NodeShutdownReport>,
}

pub struct ShutdownOrchestrator {
    core: Arc<NodeCore>,
    progress: tokio::sync::Mutex<Progress>,
    escalate: CancellationToken,
    /// Parent of the per-shard flush tokens
    flush_cancel: CancellationToken,
    shard_tokens: parking_lot::Mutex<HashMap<ShardId, CancellationToken>>,
    watchdog_armed: AtomicBool,
}

impl std::fmt::Debug for ShutdownOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownOrchestrator")
            .field("node_id", &self.core.node_id())
            .field("phase", &self.core.phase())
            .finish()
    }
}

impl ShutdownOrchestrator {
    pub(crate) fn new(core: Arc<NodeCore>) -> Self {
        ShutdownOrchestrator {
            core,
            progress: tokio::sync::Mutex::new(Progress::default()),
            escalate: CancellationToken::new(),
            flush_cancel: CancellationToken::new(),
            shard_tokens: parking_lot::Mutex::new(HashMap::new()),
            watchdog_armed: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id()
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn owned_shards(&self) -> Vec<ShardId> {
        self.core.buffers.owned_shards()
    }

    /// Turn a graceful shutdown in progress into a forced one: stop waiting
    /// for queries and cancel them. Buffered data is still flushed.
    pub fn escalate(&self) {
        if !self.escalate.is_cancelled() {
            warn!(node_id = self.node_id(), "shutdown escalated to forced");
        }
        self.escalate.cancel();
        self.core.gate.cancel_in_flight();
    }

    /// Abandon the flush of one shard, in flight or not yet started. The
    /// shard is reported failed and keeps its buffer and leader key.
    pub fn cancel_shard(&self, shard: ShardId) {
        info!(node_id = self.node_id(), shard, "shard flush cancelled");
        self.shard_token(shard).cancel();
    }

    fn shard_token(&self, shard: ShardId) -> CancellationToken {
        self.shard_tokens
            .lock()
            .entry(shard)
            .or_insert_with(|| self.flush_cancel.child_token())
            .clone()
    }

    /// Stop on our own if no stop request arrives within
    /// `shutdown_stop_timeout`. Armed by a stepwise shutdown, so a node
    /// whose driver went away does not sit quiesced on its leases.
    pub(crate) fn arm_stop_watchdog(self: &Arc<Self>) {
        if self.watchdog_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = Arc::clone(self);
        let deadline = self.core.config.shutdown_stop_timeout;
        tokio::spawn(async move {
            let mut phase = orchestrator.core.phase_tx.subscribe();
            let terminal = async move {
                let _ = phase.wait_for(|p| p.is_terminal()).await;
            };
            tokio::select! {
                _ = terminal => {}
                _ = tokio::time::sleep(deadline) => {
                    let node_id = orchestrator.node_id();
                    warn!(node_id, ?deadline, "no stop request, stopping");
                    if let Err(e) = orchestrator.stop().await {
                        error!(node_id, error = %e, "self-stop failed");
                    }
                }
            }
        });
    }

    /// Full shutdown: quiesce, flush, deregister.
    pub async fn run(&self, graceful: bool) -> Result<NodeShutdownReport> {
        self.quiesce(graceful).await?;
        self.flush().await?;
        self.stop().await
    }

    pub async fn quiesce(&self, graceful: bool) -> Result<DrainOutcome> {
        if !graceful {
            self.escalate();
        }
        let mut progress = self.progress.lock().await;
        self.quiesce_locked(&mut progress, graceful).await
    }

    pub async fn flush(&self) -> Result<Vec<ShardReport>> {
        let mut progress = self.progress.lock().await;
        self.flush_locked(&mut progress).await
    }

    pub async fn stop(&self) -> Result<NodeShutdownReport> {
        let mut progress = self.progress.lock().await;
        if let Some(report) = &progress.report {
            return Ok(report.clone());
        }
        let shards = self.flush_locked(&mut progress).await?;
        let core = &self.core;
        let node_id = core.node_id();
        core.set_phase(Phase::Deregistering);

        // Nothing may re-acquire a shard from here on.
        core.tasks_cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *core.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node_id, error = %e, "background task failed");
            }
        }

        let failed: HashSet<ShardId> = shards
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.shard)
            .collect();

        for shard in core.client.held_leaderships().into_keys() {
            if failed.contains(&shard) {
                continue;
            }
            if let Err(e) = core.client.release_leadership(shard).await {
                warn!(node_id, shard, error = %e, "release failed, lease expiry will reclaim");
            }
        }
        for shard in core.buffers.owned_shards() {
            if !failed.contains(&shard) {
                core.buffers.relinquish(shard);
            }
        }

        let deregistered = if failed.is_empty() {
            core.client.deregister().await
        } else {
            core.client.remove_member().await
        };
        let deregistered = match deregistered {
            Ok(()) => true,
            Err(e) => {
                warn!(node_id, error = %e, "deregistration failed, lease expiry will reclaim");
                false
            }
        };

        let phase = if failed.is_empty() {
            Phase::Stopped
        } else {
            Phase::Failed
        };
        let report = NodeShutdownReport {
            node_id,
            graceful: progress.graceful,
            drain: progress.drain,
            shards,
            deregistered,
            phase,
        };
        if failed.is_empty() {
            core.admin_cancel.cancel();
        }
        core.set_phase(phase);
        if failed.is_empty() {
            info!(node_id, shards = report.shards.len(), flushed = report.flushed_segments(), "node stopped");
        } else {
            error!(node_id, failed = ?report.failed_shards(), "node stopped with unflushed shards");
        }
        progress.report = Some(report.clone());
        Ok(report)
    }

    async fn quiesce_locked(&self, progress: &mut Progress, graceful: bool) -> Result<DrainOutcome> {
        if let Some(drain) = progress.drain {
            return Ok(drain);
        }
        let core = &self.core;
        let node_id = core.node_id();
        progress.graceful = graceful;
        core.set_phase(Phase::Quiescing);

        core.buffers.close_ingest();
        core.gate.close();
        let worker = core.flush_worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }

        let drain = if graceful && !self.escalate.is_cancelled() {
            core.gate.drain(core.config.drain_timeout, &self.escalate).await
        } else {
            DrainOutcome::Escalated {
                in_flight: core.gate.in_flight(),
            }
        };
        match drain {
            DrainOutcome::Drained => info!(node_id, "queries drained"),
            DrainOutcome::TimedOut { in_flight } => {
                warn!(node_id, error = %Error::DrainTimeout { in_flight }, "cancelling remaining queries");
                core.gate.cancel_in_flight();
            }
            DrainOutcome::Escalated { in_flight } => {
                info!(node_id, in_flight, "forced shutdown, queries cancelled");
                core.gate.cancel_in_flight();
            }
        }
        progress.drain = Some(drain);
        Ok(drain)
    }

    async fn flush_locked(&self, progress: &mut Progress) -> Result<Vec<ShardReport>> {
        if progress.drain.is_none() {
            self.quiesce_locked(progress, true).await?;
        }
        if let Some(shards) = &progress.shards {
            return Ok(shards.clone());
        }
        self.core.set_phase(Phase::Flushing);
        let shards = self.flush_all().await;
        progress.shards = Some(shards.clone());
        Ok(shards)
    }

    /// One task per owned shard, each with its own cancellation token.
    async fn flush_all(&self) -> Vec<ShardReport> {
        let owned = self.core.buffers.owned_shards();
        let policy = self.core.config.retry_policy();
        let mut tasks = JoinSet::new();
        for &shard in &owned {
            let token = self.shard_token(shard);
            tasks.spawn(flush_shard(self.core.buffers.clone(), shard, policy, token));
        }

        let mut reports = Vec::with_capacity(owned.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(node_id = self.node_id(), error = %e, "flush task failed"),
            }
        }
        for shard in owned {
            if !reports.iter().any(|r| r.shard == shard) {
                reports.push(ShardReport {
                    shard,
                    outcome: ShardOutcome::Failed {
                        attempts: 0,
                        reason: "flush task aborted".to_string(),
                    },
                });
            }
        }
        reports.sort_by_key(|r| r.shard);
        reports
    }
}

async fn flush_shard(
    buffers: Arc<WriteBufferManager>,
    shard: ShardId,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> ShardReport {
    let node_id = buffers.config().node_id;
    let mut attempts = 0;
    let outcome = loop {
        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break ShardOutcome::Failed {
                attempts,
                reason: "cancelled".to_string(),
            },
            result = buffers.flush_now(shard) => result,
        };
        match result {
            Ok(FlushResult {
                manifest,
                segment: Some(segment),
            }) => {
                break ShardOutcome::Flushed {
                    version: manifest.version,
                    records: segment.record_count,
                }
            }
            Ok(FlushResult {
                manifest,
                segment: None,
            }) => {
                break ShardOutcome::NothingToFlush {
                    version: manifest.version,
                }
            }
            Err(e @ (Error::LeadershipLost { .. } | Error::ShardNotOwned { .. })) => {
                info!(node_id, shard, reason = %e, "shard handed over, not flushed here");
                break ShardOutcome::HandedOver {
                    reason: e.to_string(),
                };
            }
            // A conflict leaves the batch buffered and this node still the
            // newest leader; retry on the fresher base.
            Err(e)
                if (e.is_transient() || matches!(e, Error::Conflict { .. }))
                    && attempts < policy.max_attempts =>
            {
                let delay = policy.delay_for(attempts);
                warn!(node_id, shard, attempts, ?delay, error = %e, "shard flush failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            Err(e) => {
                let failure = Error::ShardFlushFailed {
                    shard,
                    attempts,
                    reason: e.to_string(),
                };
                error!(node_id, shard, error = %failure, "giving up on shard");
                break ShardOutcome::Failed {
                    attempts,
                    reason: e.to_string(),
                };
            }
        }
    };
    ShardReport { shard, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::clock::ManualClock;
    use crate::streaming::manifest::ManifestStore;
    use crate::streaming::object_store::{InMemoryObjectStore, ObjectStore};
    use crate::streaming::write_buffer::WriteBufferConfig;
    use std::time::Duration;

    fn buffers(store: &Arc<dyn ObjectStore>, node_id: NodeId, publish_attempts: u32) -> Arc<WriteBufferManager> {
        Arc::new(WriteBufferManager::new(
            WriteBufferConfig {
                cluster_name: "orch".to_string(),
                node_id,
                max_size_bytes: 1 << 20,
                max_age: Duration::from_secs(60),
                min_flush_interval: Duration::from_secs(1),
                max_publish_attempts: publish_attempts,
            },
            ManifestStore::new(store.clone(), "orch"),
            Arc::new(ManualClock::new(0)),
        ))
    }

    /// A newer leader (epoch 2) whose first publish loses to a late flush
    /// of the previous leader (epoch 1).
    async fn newer_leader_behind_stale_publish() -> Arc<WriteBufferManager> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let new = buffers(&store, 2, 1);
        let old = buffers(&store, 1, 4);
        new.acquire(0, 2).await.unwrap();
        old.acquire(0, 1).await.unwrap();
        old.append(0, b"old".to_vec(), b"v".to_vec()).unwrap();
        old.flush_now(0).await.unwrap();
        new.append(0, b"a".to_vec(), b"v".to_vec()).unwrap();
        new.append(0, b"b".to_vec(), b"v".to_vec()).unwrap();
        new
    }

    #[tokio::test]
    async fn test_conflict_is_retried_not_handed_over() {
        let new = newer_leader_behind_stale_publish().await;
        let report = flush_shard(new.clone(), 0, RetryPolicy::test(), CancellationToken::new()).await;
        assert_eq!(
            report.outcome,
            ShardOutcome::Flushed {
                version: 2,
                records: 2
            }
        );
        assert_eq!(new.buffered_len(0), 0);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_fail_the_shard() {
        let new = newer_leader_behind_stale_publish().await;
        let report = flush_shard(new.clone(), 0, RetryPolicy::none(), CancellationToken::new()).await;
        assert!(report.is_failed(), "{:?}", report);
        assert!(matches!(report.outcome, ShardOutcome::Failed { attempts: 1, .. }));
        // Nothing was claimed durable and nothing was dropped.
        assert!(new.owns(0));
        assert_eq!(new.buffered_len(0), 2);
    }

    #[tokio::test]
    async fn test_superseded_leader_is_handed_over() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let old = buffers(&store, 1, 4);
        let new = buffers(&store, 2, 4);
        old.acquire(0, 1).await.unwrap();
        new.acquire(0, 2).await.unwrap();
        new.append(0, b"new".to_vec(), b"v".to_vec()).unwrap();
        new.flush_now(0).await.unwrap();
        old.append(0, b"old".to_vec(), b"v".to_vec()).unwrap();

        let report = flush_shard(old.clone(), 0, RetryPolicy::test(), CancellationToken::new()).await;
        assert!(matches!(report.outcome, ShardOutcome::HandedOver { .. }));
        assert!(!old.owns(0));
    }

    #[tokio::test]
    async fn test_cancelled_shard_fails_without_flushing() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let wb = buffers(&store, 1, 4);
        wb.acquire(0, 1).await.unwrap();
        wb.append(0, b"k".to_vec(), b"v".to_vec()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = flush_shard(wb.clone(), 0, RetryPolicy::test(), cancel).await;
        assert_eq!(
            report.outcome,
            ShardOutcome::Failed {
                attempts: 1,
                reason: "cancelled".to_string()
            }
        );
        assert_eq!(wb.buffered_len(0), 1);
    }
}
