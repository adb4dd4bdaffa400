//! Crate-level error taxonomy.
//!
//! Transient failures (coordination round-trips, object-store I/O) are
//! retried where they happen and only surface here once retries are
//! exhausted. Conflict and ownership errors are control-flow signals that
//! drive state transitions.

use crate::cluster::coordinator::CoordError;
use crate::cluster::types::{NodeId, ShardId};
use crate::shutdown::ClusterShutdownReport;
use crate::streaming::manifest::ManifestError;
use crate::streaming::segment::SegmentError;
use std::io::{Error as IoError, ErrorKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Coordination service unreachable after the configured attempts
    CoordinationUnavailable {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
    /// Lost a manifest publish race and could not rebase within the bound
    Conflict { shard: ShardId, expected_version: u64 },
    /// This node is not the current leader for the shard
    ShardNotOwned {
        shard: ShardId,
        leader: Option<NodeId>,
    },
    /// A higher-epoch leader published for the shard; local buffer discarded
    LeadershipLost {
        shard: ShardId,
        discarded_records: usize,
    },
    /// Object store failure (after retries)
    ObjectStoreIo(IoError),
    /// In-flight queries did not finish within the grace window
    DrainTimeout { in_flight: usize },
    /// A shard could not be flushed within the retry bound
    ShardFlushFailed {
        shard: ShardId,
        attempts: u32,
        reason: String,
    },
    /// The node is quiescing and no longer accepts ingestion
    IngestClosed { node: NodeId },
    /// The node no longer admits queries
    QueryRejected { node: NodeId },
    /// The shard has never published a manifest
    ManifestNotFound { shard: ShardId },
    /// Stored data failed validation
    Corrupt(String),
    /// Invalid configuration
    Config(String),
    /// Malformed peer or admin message
    Protocol(String),
    /// Whole-cluster shutdown finished with failed shards or unreachable nodes
    ShutdownIncomplete(Box<ClusterShutdownReport>),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ObjectStoreIo(e) => crate::streaming::retry::is_transient(e),
            Error::CoordinationUnavailable { .. } => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::CoordinationUnavailable {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "coordination unavailable: {} failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            Error::Conflict {
                shard,
                expected_version,
            } => write!(
                f,
                "manifest conflict on shard {} at version {}",
                shard, expected_version
            ),
            Error::ShardNotOwned { shard, leader } => match leader {
                Some(leader) => write!(f, "shard {} is led by node {}", shard, leader),
                None => write!(f, "shard {} has no local leader", shard),
            },
            Error::LeadershipLost {
                shard,
                discarded_records,
            } => write!(
                f,
                "leadership of shard {} lost, {} buffered records discarded",
                shard, discarded_records
            ),
            Error::ObjectStoreIo(e) => write!(f, "object store I/O error: {}", e),
            Error::DrainTimeout { in_flight } => {
                write!(f, "drain timed out with {} queries in flight", in_flight)
            }
            Error::ShardFlushFailed {
                shard,
                attempts,
                reason,
            } => write!(
                f,
                "flush of shard {} failed after {} attempts: {}",
                shard, attempts, reason
            ),
            Error::IngestClosed { node } => write!(f, "node {} is not accepting ingestion", node),
            Error::QueryRejected { node } => write!(f, "node {} is not admitting queries", node),
            Error::ManifestNotFound { shard } => write!(f, "no manifest for shard {}", shard),
            Error::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::ShutdownIncomplete(report) => write!(f, "shutdown incomplete: {}", report),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStoreIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::ObjectStoreIo(e)
    }
}

impl From<ManifestError> for Error {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Io(io) => Error::ObjectStoreIo(io),
            ManifestError::NotFound { shard } => Error::ManifestNotFound { shard },
            other => Error::Corrupt(other.to_string()),
        }
    }
}

impl From<SegmentError> for Error {
    fn from(e: SegmentError) -> Self {
        match e {
            SegmentError::Io(io) => Error::ObjectStoreIo(io),
            other => Error::Corrupt(other.to_string()),
        }
    }
}

impl From<CoordError> for Error {
    fn from(e: CoordError) -> Self {
        Error::CoordinationUnavailable {
            operation: "coordination",
            attempts: 1,
            last_error: e.to_string(),
        }
    }
}

impl From<Error> for IoError {
    fn from(e: Error) -> Self {
        match e {
            Error::ObjectStoreIo(io) => io,
            other => IoError::new(ErrorKind::Other, other.to_string()),
        }
    }
}
