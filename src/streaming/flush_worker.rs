//! Background flush timer.
//!
//! Ticks at the snapshot interval and flushes every shard whose buffer has
//! aged out or grown past the size threshold. A size crossing wakes the
//! worker early through the manager's flush signal.

use crate::error::Error;
use crate::streaming::write_buffer::WriteBufferManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FlushWorker {
    buffers: Arc<WriteBufferManager>,
    tick: Duration,
    /// Manifest versions kept per shard; None disables retention
    retain_versions: Option<usize>,
}

/// Handle to stop a running worker.
pub struct FlushWorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl FlushWorkerHandle {
    /// Stop ticking and wait for any in-progress flush to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "flush worker task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl FlushWorker {
    pub fn new(buffers: Arc<WriteBufferManager>, tick: Duration, retain_versions: Option<usize>) -> Self {
        FlushWorker {
            buffers,
            tick,
            retain_versions,
        }
    }

    pub fn spawn(self, parent: &CancellationToken) -> FlushWorkerHandle {
        let cancel = parent.child_token();
        let join = tokio::spawn(self.run(cancel.clone()));
        FlushWorkerHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick = ?self.tick, "flush worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.buffers.flush_signal().notified() => {}
            }
            self.flush_due(&cancel).await;
        }
        debug!("flush worker stopped");
    }

    /// One pass over the due shards. Returns how many were flushed.
    pub async fn flush_due(&self, cancel: &CancellationToken) -> usize {
        let mut flushed = 0;
        for shard in self.buffers.due_shards() {
            if cancel.is_cancelled() {
                break;
            }
            match self.buffers.flush_now(shard).await {
                Ok(result) => {
                    if result.segment.is_some() {
                        flushed += 1;
                        self.retain(shard).await;
                    }
                }
                Err(Error::LeadershipLost { .. }) | Err(Error::ShardNotOwned { .. }) => {}
                Err(e) => warn!(shard, error = %e, "background flush failed, will retry"),
            }
        }
        flushed
    }

    async fn retain(&self, shard: u32) {
        let Some(retain) = self.retain_versions else {
            return;
        };
        if let Err(e) = self.buffers.manifests().prune(shard, retain).await {
            warn!(shard, error = %e, "manifest retention failed");
        }
    }
}
