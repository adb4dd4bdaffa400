//! Write Buffer Manager
//!
//! One in-memory buffer (memtable) per shard this node leads. `append` only
//! touches memory; `flush_now` turns the buffer into a segment and publishes
//! the next manifest version.
//!
//! ## Flush protocol
//!
//! ```text
//! take batch → drop records already durable for this epoch
//!            → put segment → publish_edit(base)
//!                 Committed          → base = new version
//!                 Conflict, newer    → discard buffer, LeadershipLost
//!                 Conflict, not newer→ rebase and retry (bounded)
//!            → I/O error: batch restored ahead of newer records
//! ```
//!
//! Per-shard state sits behind its own lock; no operation holds two shard
//! locks, and no lock is held across an await.

use crate::cluster::types::{NodeId, ShardId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::streaming::clock::Clock;
use crate::streaming::manifest::{
    LevelManifest, ManifestEdit, ManifestStore, ManifestWriter, PublishOutcome, SegmentDescriptor,
};
use crate::streaming::segment::{Record, SegmentWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    pub cluster_name: String,
    pub node_id: NodeId,
    /// Buffered bytes that trigger a flush
    pub max_size_bytes: usize,
    /// Maximum buffer age before a timer flush
    pub max_age: Duration,
    /// Minimum gap between timer flushes of one shard
    pub min_flush_interval: Duration,
    /// Publish attempts per flush, rebases included
    pub max_publish_attempts: u32,
}

impl WriteBufferConfig {
    pub fn from_config(config: &Config) -> Self {
        WriteBufferConfig {
            cluster_name: config.cluster_name.clone(),
            node_id: config.node_id,
            max_size_bytes: config.memtable_max_size_bytes,
            max_age: config.memtable_max_replace_interval,
            min_flush_interval: config.min_snapshot_interval,
            max_publish_attempts: config.max_retries,
        }
    }
}

/// Outcome of a successful `flush_now`.
#[derive(Debug, Clone)]
pub struct FlushResult {
    /// Latest manifest known to include every flushed record
    pub manifest: LevelManifest,
    /// The segment written, or None when nothing needed flushing
    pub segment: Option<SegmentDescriptor>,
}

#[derive(Debug)]
struct ShardState {
    epoch: u64,
    /// Last manifest version this node confirmed
    base: LevelManifest,
    next_sequence: u64,
    records: Vec<Record>,
    size_bytes: usize,
    /// When the oldest buffered record arrived
    oldest_ms: Option<u64>,
    last_flush_ms: u64,
    /// Batch currently being flushed
    flushing: Vec<Record>,
}

impl ShardState {
    fn restore_batch(&mut self, batch_oldest_ms: Option<u64>) {
        let mut restored = std::mem::take(&mut self.flushing);
        restored.append(&mut self.records);
        self.size_bytes = restored.iter().map(Record::size_bytes).sum();
        self.records = restored;
        self.oldest_ms = match (batch_oldest_ms, self.oldest_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    fn buffered_len(&self) -> usize {
        self.records.len() + self.flushing.len()
    }
}

struct ShardSlot {
    state: Mutex<ShardState>,
    /// Serializes flushes of one shard
    flush_lock: tokio::sync::Mutex<()>,
}

pub struct WriteBufferManager {
    config: WriteBufferConfig,
    manifests: ManifestStore,
    clock: Arc<dyn Clock>,
    shards: RwLock<HashMap<ShardId, Arc<ShardSlot>>>,
    ingest_open: AtomicBool,
    flush_wanted: Notify,
}

impl std::fmt::Debug for WriteBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBufferManager")
            .field("node_id", &self.config.node_id)
            .field("shards", &self.owned_shards())
            .field("ingest_open", &self.is_ingest_open())
            .finish()
    }
}

/// Object key of a segment. Deterministic, so a retried flush of the same
/// batch overwrites its own earlier attempt.
pub fn segment_key(cluster: &str, shard: ShardId, epoch: u64, min_seq: u64, max_seq: u64) -> String {
    format!(
        "{}/segments/shard-{:05}/{:020}-{:020}-{:020}.seg",
        cluster, shard, epoch, min_seq, max_seq
    )
}

impl WriteBufferManager {
    pub fn new(config: WriteBufferConfig, manifests: ManifestStore, clock: Arc<dyn Clock>) -> Self {
        WriteBufferManager {
            config,
            manifests,
            clock,
            shards: RwLock::new(HashMap::new()),
            ingest_open: AtomicBool::new(true),
            flush_wanted: Notify::new(),
        }
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn config(&self) -> &WriteBufferConfig {
        &self.config
    }

    fn slot(&self, shard: ShardId) -> Result<Arc<ShardSlot>> {
        self.shards
            .read()
            .get(&shard)
            .cloned()
            .ok_or(Error::ShardNotOwned {
                shard,
                leader: None,
            })
    }

    /// Take ownership of `shard` at leader `epoch`, rehydrating from its
    /// latest manifest. The shard accepts appends only once this returns.
    pub async fn acquire(&self, shard: ShardId, epoch: u64) -> Result<LevelManifest> {
        if let Some(slot) = self.shards.read().get(&shard) {
            let s = slot.state.lock();
            if s.epoch == epoch {
                return Ok(s.base.clone());
            }
        }

        let base = self.manifests.read_latest_or_empty(shard).await?;
        let now = self.clock.now_ms();
        let slot = Arc::new(ShardSlot {
            state: Mutex::new(ShardState {
                epoch,
                next_sequence: base.next_sequence,
                base: base.clone(),
                records: Vec::new(),
                size_bytes: 0,
                oldest_ms: None,
                last_flush_ms: now,
                flushing: Vec::new(),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        self.shards.write().insert(shard, slot);
        info!(
            node_id = self.config.node_id,
            shard,
            epoch,
            version = base.version,
            segments = base.segments.len(),
            "shard rehydrated"
        );
        Ok(base)
    }

    /// Give up a shard. Returns the number of buffered records dropped.
    pub fn relinquish(&self, shard: ShardId) -> usize {
        match self.shards.write().remove(&shard) {
            Some(slot) => {
                let dropped = slot.state.lock().buffered_len();
                if dropped > 0 {
                    warn!(node_id = self.config.node_id, shard, dropped, "relinquished shard with buffered records");
                } else {
                    debug!(node_id = self.config.node_id, shard, "relinquished shard");
                }
                dropped
            }
            None => 0,
        }
    }

    pub fn owns(&self, shard: ShardId) -> bool {
        self.shards.read().contains_key(&shard)
    }

    pub fn epoch_of(&self, shard: ShardId) -> Option<u64> {
        self.shards.read().get(&shard).map(|slot| slot.state.lock().epoch)
    }

    pub fn owned_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<_> = self.shards.read().keys().copied().collect();
        shards.sort_unstable();
        shards
    }

    /// Append one record. Returns its sequence number once it is in memory.
    pub fn append(&self, shard: ShardId, key: Vec<u8>, value: Vec<u8>) -> Result<u64> {
        if !self.is_ingest_open() {
            return Err(Error::IngestClosed {
                node: self.config.node_id,
            });
        }
        let slot = self.slot(shard)?;
        let mut s = slot.state.lock();
        let sequence = s.next_sequence;
        s.next_sequence += 1;
        let record = Record {
            epoch: s.epoch,
            sequence,
            key,
            value,
        };
        s.size_bytes += record.size_bytes();
        s.records.push(record);
        if s.oldest_ms.is_none() {
            s.oldest_ms = Some(self.clock.now_ms());
        }
        if s.size_bytes >= self.config.max_size_bytes {
            self.flush_wanted.notify_one();
        }
        Ok(sequence)
    }

    /// Records not yet covered by a published manifest, oldest first.
    pub fn buffered_records(&self, shard: ShardId) -> Option<Vec<Record>> {
        let slot = self.shards.read().get(&shard).cloned()?;
        let s = slot.state.lock();
        let mut out = s.flushing.clone();
        out.extend(s.records.iter().cloned());
        Some(out)
    }

    pub fn buffered_len(&self, shard: ShardId) -> usize {
        self.shards
            .read()
            .get(&shard)
            .map_or(0, |slot| slot.state.lock().buffered_len())
    }

    pub fn close_ingest(&self) {
        self.ingest_open.store(false, Ordering::SeqCst);
    }

    pub fn is_ingest_open(&self) -> bool {
        self.ingest_open.load(Ordering::SeqCst)
    }

    /// Woken when a shard crosses the size threshold.
    pub fn flush_signal(&self) -> &Notify {
        &self.flush_wanted
    }

    /// Shards whose buffer is old enough or large enough to flush.
    pub fn due_shards(&self) -> Vec<ShardId> {
        let now = self.clock.now_ms();
        let max_age = self.config.max_age.as_millis() as u64;
        let min_gap = self.config.min_flush_interval.as_millis() as u64;
        let mut due: Vec<ShardId> = self
            .shards
            .read()
            .iter()
            .filter(|(_, slot)| {
                let s = slot.state.lock();
                let Some(oldest) = s.oldest_ms else {
                    return false;
                };
                let aged = now.saturating_sub(oldest) >= max_age
                    && now.saturating_sub(s.last_flush_ms) >= min_gap;
                aged || s.size_bytes >= self.config.max_size_bytes
            })
            .map(|(shard, _)| *shard)
            .collect();
        due.sort_unstable();
        due
    }

    /// Make everything buffered for `shard` durable.
    pub async fn flush_now(&self, shard: ShardId) -> Result<FlushResult> {
        let slot = self.slot(shard)?;
        let _flushing = slot.flush_lock.lock().await;

        let (epoch, mut base, batch_oldest_ms) = {
            let mut s = slot.state.lock();
            let mut taken = std::mem::take(&mut s.records);
            s.flushing.append(&mut taken);
            s.size_bytes = 0;
            (s.epoch, s.base.clone(), s.oldest_ms.take())
        };
        let writer = ManifestWriter {
            node_id: self.config.node_id,
            epoch,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let durable_through = base.durable_through(epoch);
            let batch: Vec<Record> = {
                let s = slot.state.lock();
                s.flushing
                    .iter()
                    .filter(|r| durable_through.map_or(true, |d| r.sequence > d))
                    .cloned()
                    .collect()
            };

            if batch.is_empty() {
                let mut s = slot.state.lock();
                s.flushing.clear();
                s.last_flush_ms = self.clock.now_ms();
                s.base = base.clone();
                return Ok(FlushResult {
                    manifest: base,
                    segment: None,
                });
            }

            let descriptor = match self.write_segment(shard, epoch, &batch).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    slot.state.lock().restore_batch(batch_oldest_ms);
                    warn!(node_id = self.config.node_id, shard, error = %e, "segment write failed, batch kept");
                    return Err(e);
                }
            };

            let outcome = self
                .manifests
                .publish_edit(&base, &ManifestEdit::add(vec![descriptor.clone()]), writer)
                .await;
            match outcome {
                Ok(PublishOutcome::Committed(manifest)) => {
                    let mut s = slot.state.lock();
                    s.flushing.clear();
                    s.base = manifest.clone();
                    s.last_flush_ms = self.clock.now_ms();
                    let committed = manifest.segments.last().cloned().unwrap_or(descriptor);
                    info!(
                        node_id = self.config.node_id,
                        shard,
                        version = manifest.version,
                        records = committed.record_count,
                        bytes = committed.size_bytes,
                        "flushed"
                    );
                    return Ok(FlushResult {
                        manifest,
                        segment: Some(committed),
                    });
                }
                Ok(PublishOutcome::Conflict { current }) if current.leader_epoch > epoch => {
                    let discarded = self.lose_leadership(shard, &slot);
                    warn!(
                        node_id = self.config.node_id,
                        shard,
                        epoch,
                        current_epoch = current.leader_epoch,
                        discarded,
                        "newer leader published, buffer discarded"
                    );
                    return Err(Error::LeadershipLost {
                        shard,
                        discarded_records: discarded,
                    });
                }
                Ok(PublishOutcome::Conflict { current }) => {
                    if !current.contains_segment(&descriptor.key) {
                        if let Err(e) = self.manifests.store().delete(&descriptor.key).await {
                            debug!(shard, key = %descriptor.key, error = %e, "orphaned segment not deleted");
                        }
                    }
                    if attempts >= self.config.max_publish_attempts {
                        let mut s = slot.state.lock();
                        s.restore_batch(batch_oldest_ms);
                        // The next flush starts from the version that beat us.
                        s.base = current;
                        return Err(Error::Conflict {
                            shard,
                            expected_version: base.version,
                        });
                    }
                    debug!(
                        shard,
                        expected = base.version,
                        current = current.version,
                        attempt = attempts,
                        "rebasing flush"
                    );
                    base = current;
                }
                Err(e) => {
                    slot.state.lock().restore_batch(batch_oldest_ms);
                    warn!(node_id = self.config.node_id, shard, error = %e, "manifest publish failed, batch kept");
                    return Err(e.into());
                }
            }
        }
    }

    async fn write_segment(&self, shard: ShardId, epoch: u64, batch: &[Record]) -> Result<SegmentDescriptor> {
        let mut writer = SegmentWriter::new();
        for record in batch {
            writer.write_record(record)?;
        }
        let bytes = writer.finish()?;

        let min_sequence = batch.iter().map(|r| r.sequence).min().unwrap_or(0);
        let max_sequence = batch.iter().map(|r| r.sequence).max().unwrap_or(0);
        let min_key = batch.iter().map(|r| &r.key).min().cloned().unwrap_or_default();
        let max_key = batch.iter().map(|r| &r.key).max().cloned().unwrap_or_default();
        let key = segment_key(&self.config.cluster_name, shard, epoch, min_sequence, max_sequence);

        self.manifests.store().put(&key, &bytes).await?;

        Ok(SegmentDescriptor {
            segment_id: 0,
            key,
            epoch,
            min_key,
            max_key,
            record_count: batch.len() as u32,
            size_bytes: bytes.len() as u64,
            created_at_ms: self.clock.now_ms(),
            min_sequence,
            max_sequence,
        })
    }

    fn lose_leadership(&self, shard: ShardId, slot: &Arc<ShardSlot>) -> usize {
        let mut shards = self.shards.write();
        if shards.get(&shard).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            shards.remove(&shard);
        }
        drop(shards);
        let mut s = slot.state.lock();
        let discarded = s.buffered_len();
        s.flushing.clear();
        s.records.clear();
        s.size_bytes = 0;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;
    use crate::streaming::clock::ManualClock;
    use crate::streaming::object_store::{InMemoryObjectStore, ObjectStore};
    use crate::streaming::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};

    fn config(node_id: NodeId) -> WriteBufferConfig {
        WriteBufferConfig {
            cluster_name: "wb".to_string(),
            node_id,
            max_size_bytes: 1024,
            max_age: Duration::from_millis(1000),
            min_flush_interval: Duration::from_millis(100),
            max_publish_attempts: 4,
        }
    }

    fn manager_on(store: Arc<dyn ObjectStore>, node_id: NodeId, clock: &ManualClock) -> WriteBufferManager {
        WriteBufferManager::new(
            config(node_id),
            ManifestStore::new(store, "wb"),
            Arc::new(clock.clone()),
        )
    }

    fn kv(i: usize) -> (Vec<u8>, Vec<u8>) {
        (format!("k{}", i).into_bytes(), format!("v{}", i).into_bytes())
    }

    #[tokio::test]
    async fn test_append_requires_ownership() {
        let clock = ManualClock::new(0);
        let wb = manager_on(Arc::new(InMemoryObjectStore::new()), 1, &clock);
        let (k, v) = kv(0);
        assert!(matches!(
            wb.append(3, k.clone(), v.clone()),
            Err(Error::ShardNotOwned { shard: 3, .. })
        ));

        wb.acquire(3, 7).await.unwrap();
        assert_eq!(wb.append(3, k, v).unwrap(), 0);
        assert_eq!(wb.epoch_of(3), Some(7));
    }

    #[tokio::test]
    async fn test_closed_ingest_rejects() {
        let clock = ManualClock::new(0);
        let wb = manager_on(Arc::new(InMemoryObjectStore::new()), 1, &clock);
        wb.acquire(0, 1).await.unwrap();
        wb.close_ingest();
        assert!(matches!(
            wb.append(0, b"k".to_vec(), b"v".to_vec()),
            Err(Error::IngestClosed { node: 1 })
        ));
    }

    #[tokio::test]
    async fn test_flush_publishes_segment() {
        let clock = ManualClock::new(5_000);
        let store = InMemoryObjectStore::new();
        let wb = manager_on(Arc::new(store.clone()), 1, &clock);
        wb.acquire(2, 4).await.unwrap();
        for i in 0..10 {
            let (k, v) = kv(i);
            wb.append(2, k, v).unwrap();
        }

        let result = wb.flush_now(2).await.unwrap();
        assert_eq!(result.manifest.version, 1);
        assert_eq!(result.manifest.leader_epoch, 4);
        let segment = result.segment.unwrap();
        assert_eq!(segment.record_count, 10);
        assert_eq!((segment.min_sequence, segment.max_sequence), (0, 9));
        assert_eq!(segment.created_at_ms, 5_000);
        assert!(store.get(&segment.key).await.is_ok());
        assert_eq!(wb.buffered_len(2), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_publishes_nothing() {
        let clock = ManualClock::new(0);
        let store = InMemoryObjectStore::new();
        let wb = manager_on(Arc::new(store.clone()), 1, &clock);
        wb.acquire(0, 1).await.unwrap();

        let result = wb.flush_now(0).await.unwrap();
        assert_eq!(result.manifest.version, 0);
        assert!(result.segment.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_resumes_sequence() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let first = manager_on(store.clone(), 1, &clock);
        first.acquire(0, 1).await.unwrap();
        for i in 0..5 {
            let (k, v) = kv(i);
            first.append(0, k, v).unwrap();
        }
        first.flush_now(0).await.unwrap();

        let second = manager_on(store, 2, &clock);
        let base = second.acquire(0, 9).await.unwrap();
        assert_eq!(base.version, 1);
        assert_eq!(second.append(0, b"k".to_vec(), b"v".to_vec()).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stale_leader_loses_leadership() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let old = manager_on(store.clone(), 1, &clock);
        let new = manager_on(store.clone(), 2, &clock);
        old.acquire(0, 1).await.unwrap();
        new.acquire(0, 2).await.unwrap();

        new.append(0, b"new".to_vec(), b"1".to_vec()).unwrap();
        new.flush_now(0).await.unwrap();

        old.append(0, b"old".to_vec(), b"1".to_vec()).unwrap();
        old.append(0, b"old".to_vec(), b"2".to_vec()).unwrap();
        let err = old.flush_now(0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::LeadershipLost {
                shard: 0,
                discarded_records: 2
            }
        ));
        assert!(!old.owns(0));

        let latest = new.manifests().read_latest(0).await.unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.leader_epoch, 2);
    }

    #[tokio::test]
    async fn test_newer_leader_rebases_over_late_publish() {
        let clock = ManualClock::new(0);
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let old = manager_on(store.clone(), 1, &clock);
        let new = manager_on(store.clone(), 2, &clock);
        old.acquire(0, 1).await.unwrap();
        new.acquire(0, 2).await.unwrap();

        old.append(0, b"old".to_vec(), b"1".to_vec()).unwrap();
        old.flush_now(0).await.unwrap();

        new.append(0, b"new".to_vec(), b"1".to_vec()).unwrap();
        let result = new.flush_now(0).await.unwrap();
        assert_eq!(result.manifest.version, 2);
        assert_eq!(result.manifest.segments.len(), 2);
        assert_eq!(result.manifest.leader_epoch, 2);
    }

    #[tokio::test]
    async fn test_exhausted_rebase_keeps_batch_and_advances_base() {
        let clock = ManualClock::new(0);
        let memory = InMemoryObjectStore::new();
        // Orphaned-segment cleanup fails; the flush path must carry on.
        let mut faults = SimulatedStoreConfig::no_faults();
        faults.delete_fail_prob = 1.0;
        let sim = Arc::new(SimulatedObjectStore::new(memory.clone(), SimulatedRng::new(3), faults));
        let new = WriteBufferManager::new(
            WriteBufferConfig {
                max_publish_attempts: 1,
                ..config(2)
            },
            ManifestStore::new(sim.clone(), "wb"),
            Arc::new(clock.clone()),
        );
        let old = manager_on(Arc::new(memory.clone()), 1, &clock);
        new.acquire(0, 2).await.unwrap();
        old.acquire(0, 1).await.unwrap();

        old.append(0, b"old".to_vec(), b"1".to_vec()).unwrap();
        old.flush_now(0).await.unwrap();

        new.append(0, b"a".to_vec(), b"1".to_vec()).unwrap();
        new.append(0, b"b".to_vec(), b"2".to_vec()).unwrap();
        assert!(matches!(
            new.flush_now(0).await,
            Err(Error::Conflict {
                shard: 0,
                expected_version: 0
            })
        ));
        assert!(new.owns(0));
        assert_eq!(new.buffered_len(0), 2);
        assert_eq!(sim.stats().delete_failures, 1);

        let result = new.flush_now(0).await.unwrap();
        assert_eq!(result.manifest.version, 2);
        assert_eq!(result.manifest.leader_epoch, 2);
        assert_eq!(result.segment.unwrap().record_count, 2);
        assert_eq!(new.buffered_len(0), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_in_order() {
        let clock = ManualClock::new(0);
        let sim = Arc::new(SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(1),
            SimulatedStoreConfig::no_faults(),
        ));
        let wb = manager_on(sim.clone(), 1, &clock);
        wb.acquire(4, 1).await.unwrap();
        wb.append(4, b"a".to_vec(), b"1".to_vec()).unwrap();
        wb.append(4, b"b".to_vec(), b"2".to_vec()).unwrap();

        sim.fail_prefix("wb/segments/shard-00004/");
        assert!(matches!(wb.flush_now(4).await, Err(Error::ObjectStoreIo(_))));
        wb.append(4, b"c".to_vec(), b"3".to_vec()).unwrap();

        let buffered = wb.buffered_records(4).unwrap();
        let seqs: Vec<u64> = buffered.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        sim.heal_all();
        let result = wb.flush_now(4).await.unwrap();
        assert_eq!(result.segment.unwrap().record_count, 3);
    }

    #[tokio::test]
    async fn test_due_shards_by_age_and_size() {
        let clock = ManualClock::new(0);
        let wb = manager_on(Arc::new(InMemoryObjectStore::new()), 1, &clock);
        wb.acquire(0, 1).await.unwrap();
        wb.acquire(1, 1).await.unwrap();
        wb.acquire(2, 1).await.unwrap();

        wb.append(0, b"k".to_vec(), b"v".to_vec()).unwrap();
        wb.append(1, b"k".to_vec(), vec![0u8; 2048]).unwrap();
        assert_eq!(wb.due_shards(), vec![1]);

        clock.advance(Duration::from_millis(1000));
        assert_eq!(wb.due_shards(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_relinquish_drops_buffer() {
        let clock = ManualClock::new(0);
        let wb = manager_on(Arc::new(InMemoryObjectStore::new()), 1, &clock);
        wb.acquire(0, 1).await.unwrap();
        wb.append(0, b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(wb.relinquish(0), 1);
        assert_eq!(wb.relinquish(0), 0);
        assert!(wb.owned_shards().is_empty());
    }
}
