//! Level Manifest Store
//!
//! A shard's manifest is the durable record of which segments make up its
//! readable state. Every version is a separate immutable object:
//!
//! ```text
//! {cluster}/manifests/shard-00003/v-00000000000000000007.json
//! ```
//!
//! ## Publication
//!
//! Publishing version N+1 on top of N is a create-only write of the N+1 key.
//! If the key already exists, someone advanced the shard first, unless the
//! stored bytes are exactly ours (a retry after a lost acknowledgement), in
//! which case the publish already happened.
//!
//! Version 0 is the implied empty manifest and is never written.

use crate::cluster::types::{NodeId, ShardId};
use crate::streaming::object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ManifestError {
    Io(IoError),
    Json(serde_json::Error),
    /// The shard has never published a manifest
    NotFound { shard: ShardId },
    Corrupt { key: String, reason: String },
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Io(e) => write!(f, "I/O error: {}", e),
            ManifestError::Json(e) => write!(f, "JSON error: {}", e),
            ManifestError::NotFound { shard } => write!(f, "Manifest not found for shard {}", shard),
            ManifestError::Corrupt { key, reason } => {
                write!(f, "Corrupt manifest {}: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<IoError> for ManifestError {
    fn from(e: IoError) -> Self {
        ManifestError::Io(e)
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Json(e)
    }
}

/// Metadata for one immutable segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Assigned at publication, unique within the shard
    pub segment_id: u64,
    /// Object store key of the segment
    pub key: String,
    /// Leader epoch that wrote the segment
    pub epoch: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub record_count: u32,
    pub size_bytes: u64,
    pub created_at_ms: u64,
    pub min_sequence: u64,
    pub max_sequence: u64,
}

/// One version of a shard's manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelManifest {
    pub shard_id: ShardId,
    pub version: u64,
    /// Epoch of the leader that published this version
    pub leader_epoch: u64,
    pub written_by: Option<NodeId>,
    /// Sorted by segment_id
    pub segments: Vec<SegmentDescriptor>,
    pub next_segment_id: u64,
    /// First sequence number a new leader epoch should use
    pub next_sequence: u64,
}

/// Identity of a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestWriter {
    pub node_id: NodeId,
    pub epoch: u64,
}

/// Change applied on top of a base version.
#[derive(Debug, Clone, Default)]
pub struct ManifestEdit {
    pub added: Vec<SegmentDescriptor>,
    /// Segment ids superseded by level compaction
    pub removed: Vec<u64>,
}

impl ManifestEdit {
    pub fn add(segments: Vec<SegmentDescriptor>) -> Self {
        ManifestEdit {
            added: segments,
            removed: Vec::new(),
        }
    }
}

/// Result of a conditional publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Committed(LevelManifest),
    /// Another writer advanced the shard; `current` is the latest version
    Conflict { current: LevelManifest },
}

impl LevelManifest {
    pub fn empty(shard_id: ShardId) -> Self {
        LevelManifest {
            shard_id,
            version: 0,
            leader_epoch: 0,
            written_by: None,
            segments: Vec::new(),
            next_segment_id: 0,
            next_sequence: 0,
        }
    }

    /// The manifest that results from applying `edit` to this version.
    pub fn apply(&self, edit: &ManifestEdit, writer: ManifestWriter) -> LevelManifest {
        let mut next = self.clone();
        next.version += 1;
        next.leader_epoch = writer.epoch;
        next.written_by = Some(writer.node_id);
        next.segments.retain(|s| !edit.removed.contains(&s.segment_id));
        for segment in &edit.added {
            let mut segment = segment.clone();
            segment.segment_id = next.next_segment_id;
            next.next_segment_id += 1;
            next.next_sequence = next.next_sequence.max(segment.max_sequence + 1);
            next.segments.push(segment);
        }

        #[cfg(debug_assertions)]
        next.verify_invariants();

        next
    }

    /// Highest sequence made durable by `epoch`, if any.
    pub fn durable_through(&self, epoch: u64) -> Option<u64> {
        self.segments
            .iter()
            .filter(|s| s.epoch == epoch)
            .map(|s| s.max_sequence)
            .max()
    }

    pub fn contains_segment(&self, key: &str) -> bool {
        self.segments.iter().any(|s| s.key == key)
    }

    pub fn total_record_count(&self) -> u64 {
        self.segments.iter().map(|s| s.record_count as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// TigerStyle: Verify all invariants hold
    ///
    /// # Invariants
    /// - Segments are sorted by id, ids are unique
    /// - next_segment_id > all segment ids
    /// - Every segment has min_sequence <= max_sequence < next_sequence
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.segments
                .windows(2)
                .all(|w| w[0].segment_id < w[1].segment_id),
            "Invariant violated: segments must be sorted by id"
        );
        if let Some(last) = self.segments.last() {
            debug_assert!(
                self.next_segment_id > last.segment_id,
                "Invariant violated: next_segment_id ({}) must be > max segment id ({})",
                self.next_segment_id,
                last.segment_id
            );
        }
        for seg in &self.segments {
            debug_assert!(
                seg.min_sequence <= seg.max_sequence && seg.max_sequence < self.next_sequence,
                "Invariant violated: segment {} sequence range [{}, {}] vs next_sequence {}",
                seg.segment_id,
                seg.min_sequence,
                seg.max_sequence,
                self.next_sequence
            );
        }
    }
}

/// Reads and publishes manifests through the object store.
#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ManifestStore {
    /// `prefix` is the cluster namespace (the cluster name).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        ManifestStore {
            store,
            prefix: prefix.to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn shard_prefix(&self, shard: ShardId) -> String {
        format!("{}/manifests/shard-{:05}/", self.prefix, shard)
    }

    /// Deterministic key for `(shard, version)`
    pub fn manifest_key(&self, shard: ShardId, version: u64) -> String {
        format!("{}v-{:020}.json", self.shard_prefix(shard), version)
    }

    fn parse_version(key: &str) -> Option<u64> {
        let name = key.rsplit('/').next()?;
        name.strip_prefix("v-")?.strip_suffix(".json")?.parse().ok()
    }

    /// Published versions of a shard, ascending.
    pub async fn versions(&self, shard: ShardId) -> Result<Vec<u64>, ManifestError> {
        let listed = self.store.list_all(&self.shard_prefix(shard)).await?;
        let mut versions: Vec<u64> = listed
            .iter()
            .filter_map(|m| Self::parse_version(&m.key))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Highest published version, or None for a never-initialized shard.
    pub async fn latest_version(&self, shard: ShardId) -> Result<Option<u64>, ManifestError> {
        let mut latest = self.versions(shard).await?.last().copied();
        // Listing may lag behind writes; probe forward.
        loop {
            let probe = latest.map_or(1, |v| v + 1);
            if !self.store.exists(&self.manifest_key(shard, probe)).await? {
                return Ok(latest);
            }
            latest = Some(probe);
        }
    }

    pub async fn read_version(
        &self,
        shard: ShardId,
        version: u64,
    ) -> Result<LevelManifest, ManifestError> {
        if version == 0 {
            return Ok(LevelManifest::empty(shard));
        }
        let key = self.manifest_key(shard, version);
        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ManifestError::NotFound { shard })
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: LevelManifest =
            serde_json::from_slice(&data).map_err(|e| ManifestError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if manifest.shard_id != shard || manifest.version != version {
            return Err(ManifestError::Corrupt {
                key,
                reason: format!(
                    "holds shard {} version {}",
                    manifest.shard_id, manifest.version
                ),
            });
        }
        Ok(manifest)
    }

    /// Highest committed version; `NotFound` for a never-initialized shard.
    pub async fn read_latest(&self, shard: ShardId) -> Result<LevelManifest, ManifestError> {
        match self.latest_version(shard).await? {
            Some(version) => self.read_version(shard, version).await,
            None => Err(ManifestError::NotFound { shard }),
        }
    }

    /// Like `read_latest`, with the implied empty version 0 for new shards.
    pub async fn read_latest_or_empty(&self, shard: ShardId) -> Result<LevelManifest, ManifestError> {
        match self.read_latest(shard).await {
            Err(ManifestError::NotFound { .. }) => Ok(LevelManifest::empty(shard)),
            other => other,
        }
    }

    /// Publish `expected_version + 1` with `new_segments` appended.
    pub async fn publish(
        &self,
        shard: ShardId,
        expected_version: u64,
        new_segments: Vec<SegmentDescriptor>,
        writer: ManifestWriter,
    ) -> Result<PublishOutcome, ManifestError> {
        let base = match self.read_version(shard, expected_version).await {
            Ok(base) => base,
            Err(ManifestError::NotFound { .. }) => {
                let current = self.read_latest_or_empty(shard).await?;
                if current.version > expected_version {
                    return Ok(PublishOutcome::Conflict { current });
                }
                return Err(ManifestError::NotFound { shard });
            }
            Err(e) => return Err(e),
        };
        self.publish_edit(&base, &ManifestEdit::add(new_segments), writer)
            .await
    }

    /// Publish `edit` on top of `base` with a create-only write.
    pub async fn publish_edit(
        &self,
        base: &LevelManifest,
        edit: &ManifestEdit,
        writer: ManifestWriter,
    ) -> Result<PublishOutcome, ManifestError> {
        let shard = base.shard_id;
        if base.leader_epoch > writer.epoch {
            // A newer leader owns the base; building on it would resurrect a stale writer.
            return Ok(PublishOutcome::Conflict {
                current: base.clone(),
            });
        }

        let next = base.apply(edit, writer);
        let key = self.manifest_key(shard, next.version);
        let bytes = serde_json::to_vec_pretty(&next)?;

        match self.store.put_if_absent(&key, &bytes).await {
            Ok(()) => {
                debug!(shard, version = next.version, epoch = writer.epoch, "manifest published");
                Ok(PublishOutcome::Committed(next))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.store.get(&key).await?;
                if existing == bytes {
                    info!(shard, version = next.version, "manifest already published by this writer");
                    return Ok(PublishOutcome::Committed(next));
                }
                let current = self.read_latest_or_empty(shard).await?;
                warn!(
                    shard,
                    expected = base.version,
                    current = current.version,
                    current_epoch = current.leader_epoch,
                    "manifest publish conflict"
                );
                Ok(PublishOutcome::Conflict { current })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete all but the newest `retain` versions. Returns versions deleted.
    pub async fn prune(&self, shard: ShardId, retain: usize) -> Result<usize, ManifestError> {
        let versions = self.versions(shard).await?;
        let retain = retain.max(1);
        if versions.len() <= retain {
            return Ok(0);
        }
        let doomed = &versions[..versions.len() - retain];
        for version in doomed {
            self.store.delete(&self.manifest_key(shard, *version)).await?;
        }
        debug!(shard, deleted = doomed.len(), "pruned manifest versions");
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;
    use crate::streaming::object_store::InMemoryObjectStore;
    use crate::streaming::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig};

    const WRITER: ManifestWriter = ManifestWriter {
        node_id: 1,
        epoch: 10,
    };

    fn segment(key: &str, min_seq: u64, max_seq: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            segment_id: 0,
            key: key.to_string(),
            epoch: WRITER.epoch,
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
            record_count: (max_seq - min_seq + 1) as u32,
            size_bytes: 100,
            created_at_ms: 1_000,
            min_sequence: min_seq,
            max_sequence: max_seq,
        }
    }

    fn manifests() -> (InMemoryObjectStore, ManifestStore) {
        let inner = InMemoryObjectStore::new();
        let store = ManifestStore::new(Arc::new(inner.clone()), "test");
        (inner, store)
    }

    #[test]
    fn test_apply_assigns_ids_and_sequence() {
        let base = LevelManifest::empty(3);
        let next = base.apply(
            &ManifestEdit::add(vec![segment("s/a", 0, 4), segment("s/b", 5, 9)]),
            WRITER,
        );
        assert_eq!(next.version, 1);
        assert_eq!(next.leader_epoch, 10);
        assert_eq!(next.written_by, Some(1));
        assert_eq!(next.segments[0].segment_id, 0);
        assert_eq!(next.segments[1].segment_id, 1);
        assert_eq!(next.next_segment_id, 2);
        assert_eq!(next.next_sequence, 10);
        assert_eq!(next.total_record_count(), 10);
        assert_eq!(next.durable_through(10), Some(9));
        assert_eq!(next.durable_through(11), None);
    }

    #[test]
    fn test_apply_removes_superseded() {
        let v1 = LevelManifest::empty(0).apply(
            &ManifestEdit::add(vec![segment("s/a", 0, 4), segment("s/b", 5, 9)]),
            WRITER,
        );
        let edit = ManifestEdit {
            added: vec![segment("s/ab", 0, 9)],
            removed: vec![0, 1],
        };
        let v2 = v1.apply(&edit, WRITER);
        assert_eq!(v2.segments.len(), 1);
        assert_eq!(v2.segments[0].segment_id, 2);
        assert!(v2.contains_segment("s/ab"));
    }

    #[test]
    fn test_key_layout_and_parse() {
        let (_, store) = manifests();
        let key = store.manifest_key(3, 7);
        assert_eq!(key, "test/manifests/shard-00003/v-00000000000000000007.json");
        assert_eq!(ManifestStore::parse_version(&key), Some(7));
        assert_eq!(ManifestStore::parse_version("test/manifests/shard-00003/junk"), None);
    }

    #[tokio::test]
    async fn test_read_latest_never_initialized() {
        let (_, store) = manifests();
        assert!(matches!(
            store.read_latest(4).await,
            Err(ManifestError::NotFound { shard: 4 })
        ));
        let empty = store.read_latest_or_empty(4).await.unwrap();
        assert_eq!(empty.version, 0);
        assert!(empty.segments.is_empty());
    }

    #[tokio::test]
    async fn test_publish_sequence() {
        let (_, store) = manifests();
        let v1 = match store.publish(0, 0, vec![segment("s/a", 0, 4)], WRITER).await.unwrap() {
            PublishOutcome::Committed(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        let v2 = match store.publish(0, 1, vec![segment("s/b", 5, 9)], WRITER).await.unwrap() {
            PublishOutcome::Committed(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let latest = store.read_latest(0).await.unwrap();
        assert_eq!(latest, v2);
        assert_eq!(store.versions(0).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_publish_conflict_on_stale_base() {
        let (_, store) = manifests();
        let other = ManifestWriter {
            node_id: 2,
            epoch: 10,
        };
        store.publish(0, 0, vec![segment("s/a", 0, 4)], other).await.unwrap();

        let outcome = store
            .publish(0, 0, vec![segment("s/mine", 0, 2)], WRITER)
            .await
            .unwrap();
        match outcome {
            PublishOutcome::Conflict { current } => {
                assert_eq!(current.version, 1);
                assert_eq!(current.written_by, Some(2));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // The loser's content never became visible
        let latest = store.read_latest(0).await.unwrap();
        assert!(!latest.contains_segment("s/mine"));
    }

    #[tokio::test]
    async fn test_identical_retry_is_noop() {
        let (inner, store) = manifests();
        let base = LevelManifest::empty(5);
        let edit = ManifestEdit::add(vec![segment("s/a", 0, 4)]);

        let first = store.publish_edit(&base, &edit, WRITER).await.unwrap();
        let second = store.publish_edit(&base, &edit, WRITER).await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(second, PublishOutcome::Committed(ref m) if m.version == 1));
        assert_eq!(inner.keys_with_prefix("test/manifests/shard-00005/").len(), 1);
    }

    #[tokio::test]
    async fn test_fenced_by_newer_epoch() {
        let (_, store) = manifests();
        let newer = ManifestWriter {
            node_id: 2,
            epoch: 20,
        };
        let v1 = match store.publish(0, 0, vec![], newer).await.unwrap() {
            PublishOutcome::Committed(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        let outcome = store
            .publish_edit(&v1, &ManifestEdit::add(vec![segment("s/old", 0, 1)]), WRITER)
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Conflict { ref current } if current.leader_epoch == 20));
        assert_eq!(store.latest_version(0).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_reported() {
        let (inner, store) = manifests();
        inner
            .put(&store.manifest_key(1, 1), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            store.read_latest(1).await,
            Err(ManifestError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let (_, store) = manifests();
        let mut base = LevelManifest::empty(2);
        for i in 0..6u64 {
            match store
                .publish_edit(&base, &ManifestEdit::add(vec![segment(&format!("s/{}", i), i, i)]), WRITER)
                .await
                .unwrap()
            {
                PublishOutcome::Committed(m) => base = m,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(store.prune(2, 2).await.unwrap(), 4);
        assert_eq!(store.versions(2).await.unwrap(), vec![5, 6]);
        assert_eq!(store.read_latest(2).await.unwrap().segments.len(), 6);
        assert_eq!(store.prune(2, 2).await.unwrap(), 0);
    }

    // DST: lost acknowledgements on every write still converge to one version
    #[tokio::test]
    async fn test_publish_survives_lost_acks() {
        use crate::streaming::retry::{RetryPolicy, RetryingObjectStore};

        let mut config = SimulatedStoreConfig::no_faults();
        config.lost_ack_prob = 0.5;
        let sim = SimulatedObjectStore::new(InMemoryObjectStore::new(), SimulatedRng::new(7), config);
        let store = ManifestStore::new(
            Arc::new(RetryingObjectStore::new(sim, RetryPolicy::test())),
            "dst",
        );

        let mut base = LevelManifest::empty(0);
        for i in 0..20u64 {
            let edit = ManifestEdit::add(vec![segment(&format!("s/{}", i), i, i)]);
            loop {
                match store.publish_edit(&base, &edit, WRITER).await {
                    Ok(PublishOutcome::Committed(m)) => {
                        base = m;
                        break;
                    }
                    Ok(PublishOutcome::Conflict { current }) => panic!("no competing writer: {:?}", current),
                    Err(_) => continue,
                }
            }
        }
        let latest = store.read_latest(0).await.unwrap();
        assert_eq!(latest.version, 20);
        assert_eq!(latest.segments.len(), 20);
    }
}
