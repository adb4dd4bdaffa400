//! Linearizable coordination store.
//!
//! The coordination client needs a small etcd-like capability: a revisioned
//! key space, leases that delete their keys on expiry, create-only and
//! compare-and-swap writes, and prefix reads. `Coordinator` is that
//! capability as a command interface, so the same client runs against the
//! in-process store or a remote one.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub type Revision = u64;
pub type LeaseId = u64;

// TigerStyle: Explicit limits with _MAX suffix
const LEASES_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordRequest {
    GrantLease { ttl_ms: u64 },
    KeepAlive { lease: LeaseId },
    /// Revoke a lease and delete every key attached to it
    Revoke { lease: LeaseId },
    /// Unconditional write
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    /// Write only if the key's mod revision equals `expected`
    /// (`None`: only if the key does not exist)
    CompareAndSwap {
        key: String,
        expected: Option<Revision>,
        value: String,
        lease: Option<LeaseId>,
    },
    /// Delete, optionally only at a given mod revision
    DeleteIf {
        key: String,
        expected: Option<Revision>,
    },
    Range { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Store revision of the last write to this key
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordResponse {
    Lease { id: LeaseId, ttl_ms: u64 },
    /// The referenced lease no longer exists
    LeaseExpired { lease: LeaseId },
    Written { revision: Revision },
    CasFailed { current: Option<KeyValue> },
    Deleted { deleted: bool, revision: Revision },
    Range { revision: Revision, kvs: Vec<KeyValue> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordError {
    /// The store could not be reached; safe to retry
    Unavailable(String),
    Protocol(String),
}

impl std::fmt::Display for CoordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordError::Unavailable(msg) => write!(f, "coordination store unavailable: {}", msg),
            CoordError::Protocol(msg) => write!(f, "coordination protocol error: {}", msg),
        }
    }
}

impl std::error::Error for CoordError {}

pub trait Coordinator: Send + Sync + 'static {
    fn execute(&self, request: CoordRequest) -> BoxFuture<'_, Result<CoordResponse, CoordError>>;
}

impl<T: Coordinator + ?Sized> Coordinator for Arc<T> {
    fn execute(&self, request: CoordRequest) -> BoxFuture<'_, Result<CoordResponse, CoordError>> {
        (**self).execute(request)
    }
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    unavailable: bool,
}

impl StoreState {
    /// Drop expired leases and their keys. Lazy: runs before every request.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "lease expired");
            self.revoke(id);
        }
    }

    fn revoke(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let before = self.kvs.len();
        self.kvs.retain(|_, kv| kv.lease != Some(lease));
        if self.kvs.len() != before {
            self.revision += 1;
        }
        true
    }

    fn lease_alive(&self, lease: Option<LeaseId>) -> bool {
        lease.map_or(true, |id| self.leases.contains_key(&id))
    }

    fn write(&mut self, key: String, value: String, lease: Option<LeaseId>) -> Revision {
        self.revision += 1;
        let kv = KeyValue {
            key: key.clone(),
            value,
            mod_revision: self.revision,
            lease,
        };
        self.kvs.insert(key, kv);
        self.revision
    }

    fn apply(&mut self, request: CoordRequest, now: Instant) -> CoordResponse {
        self.expire(now);
        match request {
            CoordRequest::GrantLease { ttl_ms } => {
                self.next_lease += 1;
                let ttl = Duration::from_millis(ttl_ms);
                self.leases.insert(
                    self.next_lease,
                    Lease {
                        ttl,
                        deadline: now + ttl,
                    },
                );
                debug_assert!(self.leases.len() <= LEASES_MAX, "lease table overflow");
                CoordResponse::Lease {
                    id: self.next_lease,
                    ttl_ms,
                }
            }
            CoordRequest::KeepAlive { lease } => match self.leases.get_mut(&lease) {
                Some(l) => {
                    l.deadline = now + l.ttl;
                    CoordResponse::Lease {
                        id: lease,
                        ttl_ms: l.ttl.as_millis() as u64,
                    }
                }
                None => CoordResponse::LeaseExpired { lease },
            },
            CoordRequest::Revoke { lease } => {
                let deleted = self.revoke(lease);
                CoordResponse::Deleted {
                    deleted,
                    revision: self.revision,
                }
            }
            CoordRequest::Put { key, value, lease } => {
                if !self.lease_alive(lease) {
                    return CoordResponse::LeaseExpired {
                        lease: lease.unwrap_or_default(),
                    };
                }
                CoordResponse::Written {
                    revision: self.write(key, value, lease),
                }
            }
            CoordRequest::CompareAndSwap {
                key,
                expected,
                value,
                lease,
            } => {
                if !self.lease_alive(lease) {
                    return CoordResponse::LeaseExpired {
                        lease: lease.unwrap_or_default(),
                    };
                }
                let current = self.kvs.get(&key);
                if current.map(|kv| kv.mod_revision) != expected {
                    return CoordResponse::CasFailed {
                        current: current.cloned(),
                    };
                }
                CoordResponse::Written {
                    revision: self.write(key, value, lease),
                }
            }
            CoordRequest::DeleteIf { key, expected } => {
                let matches = match (self.kvs.get(&key), expected) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(kv), Some(rev)) => kv.mod_revision == rev,
                };
                if matches {
                    self.kvs.remove(&key);
                    self.revision += 1;
                }
                CoordResponse::Deleted {
                    deleted: matches,
                    revision: self.revision,
                }
            }
            CoordRequest::Range { prefix } => CoordResponse::Range {
                revision: self.revision,
                kvs: self
                    .kvs
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, kv)| kv.clone())
                    .collect(),
            },
        }
    }
}

/// In-process linearizable store. Clones share state, so several nodes in
/// one process (or a `CoordinationServer`) can use the same instance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every request fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    pub fn apply(&self, request: CoordRequest) -> Result<CoordResponse, CoordError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(CoordError::Unavailable("simulated outage".to_string()));
        }
        Ok(state.apply(request, Instant::now()))
    }
}

impl Coordinator for InMemoryCoordinator {
    fn execute(&self, request: CoordRequest) -> BoxFuture<'_, Result<CoordResponse, CoordError>> {
        let result = self.apply(request);
        Box::pin(async move { result })
    }
}
