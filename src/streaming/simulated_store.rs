//! Simulated Object Store with Fault Injection
//!
//! DST wrapper that injects failures, timeouts and lost acknowledgements
//! through buggify, plus deterministic per-prefix outages used to isolate a
//! single shard.

use crate::buggify::faults::object_store as faults;
use crate::io::Rng;
use crate::streaming::object_store::{ListResult, ObjectMeta, ObjectStore};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    pub put_fail_prob: f64,
    pub get_fail_prob: f64,
    pub list_fail_prob: f64,
    pub delete_fail_prob: f64,
    pub timeout_prob: f64,
    /// Probability that a write is applied but reported as failed
    pub lost_ack_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            list_fail_prob: 0.01,
            delete_fail_prob: 0.01,
            timeout_prob: 0.005,
            lost_ack_prob: 0.005,
            latency_range_us: (100, 2_000),
        }
    }
}

impl SimulatedStoreConfig {
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            list_fail_prob: 0.0,
            delete_fail_prob: 0.0,
            timeout_prob: 0.0,
            lost_ack_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.10,
            get_fail_prob: 0.10,
            list_fail_prob: 0.05,
            delete_fail_prob: 0.05,
            timeout_prob: 0.05,
            lost_ack_prob: 0.10,
            latency_range_us: (100, 5_000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub list_failures: u64,
    pub delete_failures: u64,
    pub timeouts: u64,
    pub lost_acks: u64,
    pub outage_rejections: u64,
}

struct SimState<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// Fault-injecting wrapper around another store.
pub struct SimulatedObjectStore<S: ObjectStore, R: Rng> {
    inner: S,
    config: SimulatedStoreConfig,
    state: Mutex<SimState<R>>,
    outages: RwLock<Vec<String>>,
}

enum Op {
    Put,
    Get,
    List,
    Delete,
}

impl<S: ObjectStore, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner,
            config,
            state: Mutex::new(SimState {
                rng,
                stats: SimulatedStoreStats::default(),
            }),
            outages: RwLock::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every operation on a key under `prefix` fails until healed.
    pub fn fail_prefix(&self, prefix: &str) {
        self.outages.write().push(prefix.to_string());
    }

    pub fn heal_prefix(&self, prefix: &str) {
        self.outages.write().retain(|p| p != prefix);
    }

    pub fn heal_all(&self) {
        self.outages.write().clear();
    }

    fn in_outage(&self, key: &str) -> bool {
        self.outages.read().iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Decide the injected fault for one operation. Never holds the lock
    /// across an await.
    fn inject(&self, key: &str, op: Op) -> (Option<IoError>, Duration) {
        let mut s = self.state.lock();
        let s = &mut *s;
        if self.in_outage(key) {
            s.stats.outage_rejections += 1;
            return (
                Some(IoError::new(ErrorKind::ConnectionRefused, "simulated outage")),
                Duration::ZERO,
            );
        }
        match op {
            Op::Put => s.stats.put_attempts += 1,
            Op::Get => s.stats.get_attempts += 1,
            _ => {}
        }
        if crate::buggify!(&mut s.rng, faults::TIMEOUT, self.config.timeout_prob) {
            s.stats.timeouts += 1;
            return (
                Some(IoError::new(ErrorKind::TimedOut, "simulated timeout")),
                Duration::ZERO,
            );
        }
        let (fault, prob) = match op {
            Op::Put => (faults::PUT_FAIL, self.config.put_fail_prob),
            Op::Get => (faults::GET_FAIL, self.config.get_fail_prob),
            Op::List => (faults::LIST_FAIL, self.config.list_fail_prob),
            Op::Delete => (faults::DELETE_FAIL, self.config.delete_fail_prob),
        };
        if crate::buggify!(&mut s.rng, fault, prob) {
            match op {
                Op::Put => s.stats.put_failures += 1,
                Op::Get => s.stats.get_failures += 1,
                Op::List => s.stats.list_failures += 1,
                Op::Delete => s.stats.delete_failures += 1,
            }
            return (
                Some(IoError::new(ErrorKind::Other, format!("simulated {} failure", fault))),
                Duration::ZERO,
            );
        }
        let (min, max) = self.config.latency_range_us;
        let latency = Duration::from_micros(s.rng.gen_range(min, max.max(min)));
        (None, latency)
    }

    fn lose_ack(&self) -> bool {
        let mut s = self.state.lock();
        let s = &mut *s;
        let lost = crate::buggify!(&mut s.rng, faults::LOST_ACK, self.config.lost_ack_prob);
        if lost {
            s.stats.lost_acks += 1;
        }
        lost
    }

    async fn gate(&self, key: &str, op: Op) -> IoResult<()> {
        let (fault, latency) = self.inject(key, op);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ack(&self, result: IoResult<()>) -> IoResult<()> {
        if result.is_ok() && self.lose_ack() {
            return Err(IoError::new(ErrorKind::TimedOut, "simulated lost acknowledgement"));
        }
        result
    }
}

impl<S: ObjectStore, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            self.gate(key, Op::Put).await?;
            let result = self.inner.put(key, data).await;
            self.ack(result)
        })
    }

    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            self.gate(key, Op::Put).await?;
            let result = self.inner.put_if_absent(key, data).await;
            self.ack(result)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        Box::pin(async move {
            self.gate(key, Op::Get).await?;
            self.inner.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(async move {
            self.gate(key, Op::Get).await?;
            self.inner.exists(key).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(async move {
            self.gate(key, Op::Delete).await?;
            self.inner.delete(key).await
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(async move {
            self.gate(prefix, Op::List).await?;
            self.inner.list(prefix, continuation_token).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(async move {
            self.gate(key, Op::Get).await?;
            self.inner.head(key).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulation::SimulatedRng;
    use crate::streaming::object_store::InMemoryObjectStore;

    fn store(config: SimulatedStoreConfig, seed: u64) -> SimulatedObjectStore<InMemoryObjectStore, SimulatedRng> {
        SimulatedObjectStore::new(InMemoryObjectStore::new(), SimulatedRng::new(seed), config)
    }

    #[tokio::test]
    async fn test_no_faults_passthrough() {
        let store = store(SimulatedStoreConfig::no_faults(), 1);
        store.put("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"1");
        assert_eq!(store.stats().put_failures, 0);
    }

    #[tokio::test]
    async fn test_prefix_outage_is_isolated() {
        let store = store(SimulatedStoreConfig::no_faults(), 2);
        store.fail_prefix("c/segments/shard-00003/");

        let err = store
            .put("c/segments/shard-00003/x.seg", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        store.put("c/segments/shard-00004/x.seg", b"x").await.unwrap();

        store.heal_prefix("c/segments/shard-00003/");
        store.put("c/segments/shard-00003/x.seg", b"x").await.unwrap();
        assert_eq!(store.stats().outage_rejections, 1);
    }

    #[tokio::test]
    async fn test_lost_ack_still_writes() {
        let mut config = SimulatedStoreConfig::no_faults();
        config.lost_ack_prob = 1.0;
        let store = store(config, 3);

        let err = store.put_if_absent("m/v-1", b"payload").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(store.inner().get("m/v-1").await.unwrap(), b"payload");
        assert_eq!(store.stats().lost_acks, 1);
    }

    #[tokio::test]
    async fn test_every_registered_fault_is_injected() {
        for &fault in crate::buggify::ALL_FAULTS {
            let mut config = SimulatedStoreConfig::no_faults();
            match fault {
                faults::PUT_FAIL => config.put_fail_prob = 1.0,
                faults::GET_FAIL => config.get_fail_prob = 1.0,
                faults::LIST_FAIL => config.list_fail_prob = 1.0,
                faults::DELETE_FAIL => config.delete_fail_prob = 1.0,
                faults::TIMEOUT => config.timeout_prob = 1.0,
                faults::LOST_ACK => config.lost_ack_prob = 1.0,
                other => panic!("fault {} has no injection point", other),
            }
            let store = store(config, 4);
            store.inner().put("k", b"v").await.unwrap();

            let failed = match fault {
                faults::GET_FAIL | faults::TIMEOUT => store.get("k").await.is_err(),
                faults::LIST_FAIL => store.list("", None).await.is_err(),
                faults::DELETE_FAIL => store.delete("k").await.is_err(),
                _ => store.put("k", b"v").await.is_err(),
            };
            assert!(failed, "{} never fired", fault);
        }
    }

    #[tokio::test]
    async fn test_chaos_is_deterministic_per_seed() {
        async fn run(seed: u64) -> Vec<bool> {
            let mut config = SimulatedStoreConfig::high_chaos();
            config.latency_range_us = (0, 0);
            let store = store(config, seed);
            let mut outcomes = Vec::new();
            for i in 0..50 {
                outcomes.push(store.put(&format!("k{}", i), b"v").await.is_ok());
            }
            outcomes
        }
        assert_eq!(run(99).await, run(99).await);
    }
}
