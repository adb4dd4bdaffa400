//! Object Store Persistence
//!
//! Per-shard write buffers flushed to immutable segments, made durable by
//! publishing a new level-manifest version.
//!
//! ## Architecture
//!
//! ```text
//! append → WriteBufferManager → Segment → ObjectStore
//!                  ↓                          ↑
//!            FlushWorker (age/size)    ManifestStore (v-N → v-N+1)
//! ```
//!
//! ## Key Features
//!
//! - **Stateless nodes**: a new leader rebuilds a shard from its manifest
//! - **Conditional publish**: create-only manifest keys arbitrate writers
//! - **Epoch fencing**: a stale leader's flush is rejected, never merged
//! - **Checksummed segments**: CRC32 validation

pub mod clock;
pub mod flush_worker;
pub mod manifest;
pub mod object_store;
pub mod recovery;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod segment;
pub mod simulated_store;
pub mod write_buffer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use flush_worker::{FlushWorker, FlushWorkerHandle};
pub use manifest::{
    LevelManifest, ManifestEdit, ManifestError, ManifestStore, ManifestWriter, PublishOutcome,
    SegmentDescriptor,
};
pub use object_store::{InMemoryObjectStore, ListResult, LocalFsObjectStore, ObjectMeta, ObjectStore};
pub use recovery::{RecoveryManager, RecoveryStats};
pub use retry::{RetryPolicy, RetryingObjectStore};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
pub use segment::{Record, SegmentError, SegmentReader, SegmentWriter};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use write_buffer::{FlushResult, WriteBufferConfig, WriteBufferManager};
