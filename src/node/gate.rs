//! Query admission.
//!
//! Queries hold a `QueryPermit` while they run. Shutdown closes the gate
//! (new queries are rejected) and then waits for the in-flight count to
//! reach zero, up to the drain timeout. A forced shutdown cancels the
//! permits' token instead of waiting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainOutcome {
    Drained,
    /// Grace window elapsed with queries still running
    TimedOut { in_flight: usize },
    /// A forced shutdown cut the wait short
    Escalated { in_flight: usize },
}

#[derive(Debug)]
pub struct QueryGate {
    open: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl Default for QueryGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct QueryPermit {
    gate: Arc<QueryGate>,
}

impl QueryPermit {
    /// Fires when in-flight queries are cancelled by a forced shutdown.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.gate.cancel.cancelled()
    }
}

impl Drop for QueryPermit {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.idle.notify_waiters();
        }
    }
}

impl QueryGate {
    pub fn new() -> Self {
        QueryGate {
            open: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// None once the gate is closed.
    pub fn admit(self: &Arc<Self>) -> Option<QueryPermit> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // Re-check after counting in, so close+drain never misses a query.
        if !self.open.load(Ordering::SeqCst) {
            drop(QueryPermit {
                gate: Arc::clone(self),
            });
            return None;
        }
        Some(QueryPermit {
            gate: Arc::clone(self),
        })
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_in_flight(&self) {
        self.cancel.cancel();
    }

    /// Wait for in-flight queries to finish.
    pub async fn drain(&self, timeout: Duration, escalate: &CancellationToken) -> DrainOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return DrainOutcome::Drained;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return DrainOutcome::TimedOut { in_flight: self.in_flight() };
                }
                _ = escalate.cancelled() => {
                    return DrainOutcome::Escalated { in_flight: self.in_flight() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_gate_rejects() {
        let gate = Arc::new(QueryGate::new());
        let permit = gate.admit();
        assert!(permit.is_some());
        gate.close();
        assert!(gate.admit().is_none());
        assert_eq!(gate.in_flight(), 1);
        drop(permit);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_permits() {
        let gate = Arc::new(QueryGate::new());
        let permit = gate.admit().unwrap();
        gate.close();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(permit);
        });
        let outcome = gate
            .drain(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let gate = Arc::new(QueryGate::new());
        let _permit = gate.admit().unwrap();
        gate.close();
        let outcome = gate
            .drain(Duration::from_millis(100), &CancellationToken::new())
            .await;
        assert_eq!(outcome, DrainOutcome::TimedOut { in_flight: 1 });
    }

    #[tokio::test]
    async fn test_escalation_cuts_drain_short() {
        let gate = Arc::new(QueryGate::new());
        let permit = gate.admit().unwrap();
        gate.close();
        let escalate = CancellationToken::new();
        escalate.cancel();
        let outcome = gate.drain(Duration::from_secs(60), &escalate).await;
        assert_eq!(outcome, DrainOutcome::Escalated { in_flight: 1 });

        gate.cancel_in_flight();
        tokio::time::timeout(Duration::from_secs(1), permit.cancelled())
            .await
            .unwrap();
    }
}
