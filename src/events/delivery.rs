//! Offline event delivery worker
//!
//! Runs on the reconciliation tick, entirely off the enforcement path.
//! Drains a bounded oldest-first batch, attempts delivery per event, and
//! treats a duplicate server acknowledgement as success so facts are never
//! double-delivered.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::Backend;

use super::OfflineEventQueue;

pub struct DeliveryWorker {
    queue: Arc<OfflineEventQueue>,
    backend: Arc<dyn Backend>,
    batch_size: usize,
    backoff_base_secs: u64,
    backoff_max_secs: u64,
    retention_secs: u64,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<OfflineEventQueue>,
        backend: Arc<dyn Backend>,
        batch_size: usize,
        backoff_base_secs: u64,
        backoff_max_secs: u64,
        retention_secs: u64,
    ) -> Self {
        Self {
            queue,
            backend,
            batch_size,
            backoff_base_secs,
            backoff_max_secs,
            retention_secs,
        }
    }

    /// One delivery pass. Returns the number of events confirmed synced.
    pub async fn run_once(&self) -> usize {
        let batch = match self.queue.drain_batch(self.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Failed to read offline event batch");
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }
        debug!(count = batch.len(), "Delivering offline event batch");

        let mut synced = 0;
        for event in &batch {
            match self.backend.deliver_event(event).await {
                Ok(ack) if ack.is_success() => {
                    if ack.duplicate {
                        debug!(id = %event.id, "Server already had event, treating as synced");
                    }
                    if let Err(e) = self.queue.mark_synced(&event.id) {
                        warn!(id = %event.id, error = %e, "Failed to mark event synced");
                    } else {
                        synced += 1;
                    }
                }
                Ok(_) => {
                    warn!(id = %event.id, "Server refused event");
                    let _ = self.queue.mark_failed(
                        &event.id,
                        self.backoff_base_secs,
                        self.backoff_max_secs,
                    );
                }
                Err(e) => {
                    debug!(id = %event.id, error = %e, "Event delivery failed, will retry");
                    let _ = self.queue.mark_failed(
                        &event.id,
                        self.backoff_base_secs,
                        self.backoff_max_secs,
                    );
                }
            }
        }

        if synced > 0 {
            info!(synced, "Offline events delivered");
        }

        if let Err(e) = self.queue.purge_synced(self.retention_secs) {
            warn!(error = %e, "Offline event GC failed");
        }

        synced
    }
}
