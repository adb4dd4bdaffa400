//! Bounded exponential backoff.
//!
//! `RetryingObjectStore` wraps any store and retries transient failures
//! transparently. Definitive answers (`NotFound`, `AlreadyExists`, invalid
//! input) are returned on the first attempt.

use crate::streaming::object_store::{ListResult, ObjectMeta, ObjectStore};
use futures::future::BoxFuture;
use std::future::Future;
use std::io::{ErrorKind, Result as IoResult};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn test() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_attempts: 4,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 1,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Whether an I/O error is worth retrying.
pub fn is_transient(err: &std::io::Error) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::PermissionDenied
            | ErrorKind::Unsupported
    )
}

/// Run `op` until it succeeds, fails definitively, or the policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> IoResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IoResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(operation, attempt, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                debug!(operation, attempt, ?delay, error = %e, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Object store wrapper that retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryingObjectStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingObjectStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        RetryingObjectStore { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ObjectStore> ObjectStore for RetryingObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(with_retry(&self.policy, "put", move || self.inner.put(key, data)))
    }

    /// A retry after a lost acknowledgement surfaces as `AlreadyExists`;
    /// callers that need idempotence compare the stored bytes.
    fn put_if_absent<'a>(&'a self, key: &'a str, data: &'a [u8]) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(with_retry(&self.policy, "put_if_absent", move || {
            self.inner.put_if_absent(key, data)
        }))
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<Vec<u8>>> {
        Box::pin(with_retry(&self.policy, "get", move || self.inner.get(key)))
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<bool>> {
        Box::pin(with_retry(&self.policy, "exists", move || self.inner.exists(key)))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<()>> {
        Box::pin(with_retry(&self.policy, "delete", move || self.inner.delete(key)))
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation_token: Option<&'a str>,
    ) -> BoxFuture<'a, IoResult<ListResult>> {
        Box::pin(with_retry(&self.policy, "list", move || {
            self.inner.list(prefix, continuation_token)
        }))
    }

    fn head<'a>(&'a self, key: &'a str) -> BoxFuture<'a, IoResult<ObjectMeta>> {
        Box::pin(with_retry(&self.policy, "head", move || self.inner.head(key)))
    }
}
