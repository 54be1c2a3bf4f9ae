//! Runs sessions across many devices, a bounded number at a time.
//!
//! Devices are split into batches of at most `batch_size`, in order. Every device in a batch gets
//! its own task, and the scheduler waits for the whole batch to finish before starting the next
//! one. At most `batch_size` sessions are ever alive at once.
//!
//! Each device produces exactly one result. A session that panics is reported as
//! [FailureKind::Crashed] instead of being lost.

use crate::core::{DeviceDescriptor, FailureKind, Outcome, SessionResult};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives each device's result the moment its session ends.
///
/// Called concurrently from many tasks.
pub trait Report: Send + Sync + 'static {
    fn report(&self, result: SessionResult);
}

/// The number of batches needed to run `devices` devices, `batch_size` at a time.
pub fn batch_count(devices: usize, batch_size: NonZeroUsize) -> usize {
    devices.div_ceil(batch_size.get())
}

/// What a [BatchScheduler] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub batches: usize,
    pub devices: usize,
}

/// Runs one worker per device, batch by batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchScheduler {
    batch_size: NonZeroUsize,
}

impl BatchScheduler {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        BatchScheduler { batch_size }
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Runs `worker` on every device in `devices` and reports each outcome to `reporter`.
    ///
    /// Returns once every batch has finished.
    pub async fn run<W, Fut, R>(
        &self,
        devices: Vec<DeviceDescriptor>,
        worker: W,
        reporter: Arc<R>,
    ) -> ScheduleSummary
    where
        W: Fn(DeviceDescriptor) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
        R: Report + ?Sized,
    {
        let total = devices.len();
        let batches = batch_count(total, self.batch_size);
        info!(devices = total, batches, batch_size = self.batch_size.get(), "scheduling");

        let mut devices = devices.into_iter().peekable();
        let mut batch_number = 0;
        while devices.peek().is_some() {
            batch_number += 1;
            let batch: Vec<_> = devices.by_ref().take(self.batch_size.get()).collect();
            debug!(batch = batch_number, of = batches, size = batch.len(), "starting batch");

            let mut handles = Vec::with_capacity(batch.len());
            for device in batch {
                let id = device.id.clone();
                let session = worker(device);
                let reporter = Arc::clone(&reporter);
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    let outcome = session.await;
                    reporter.report(SessionResult {
                        id: task_id,
                        outcome,
                    });
                });
                handles.push((id, handle));
            }

            for (id, handle) in handles {
                if let Err(error) = handle.await {
                    warn!(device = %id, "session crashed: {error}");
                    reporter.report(SessionResult {
                        id,
                        outcome: Outcome::failure(FailureKind::Crashed, error.to_string()),
                    });
                }
            }
            debug!(batch = batch_number, of = batches, "finished batch");
        }

        ScheduleSummary {
            batches: batch_number,
            devices: total,
        }
    }
}
