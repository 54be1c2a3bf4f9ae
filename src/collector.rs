//! Gathers device outcomes from concurrent sessions.
//!
//! Sessions hand their results to a [ResultSender]; a single [ResultReceiver] drains them. The
//! channel closes when the last sender is dropped, which is how the receiver learns that every
//! session has finished. No marker value ever travels through the channel, so nothing a device
//! returns can be mistaken for the end of a job.
//!
//! The receiver works in one of two modes, chosen when the job starts:
//!
//! * [ResultReceiver::collect] waits for every result and returns the complete [ResultSet].
//! * [ResultReceiver::stream] hands each result to a [Sink] as soon as it arrives, then calls
//!   [Sink::finish] exactly once after the last one.

use crate::core::{ResultSet, SessionResult};
use crate::scheduler::Report;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Returns a connected sender and receiver.
pub fn channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSender { tx }, ResultReceiver { rx })
}

/// The producing end. Clone one per session; the job is over when every clone is dropped.
#[derive(Clone, Debug)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<SessionResult>,
}

impl ResultSender {
    /// Sends `result` to the receiver. Returns `false` if the receiver is gone.
    pub fn send(&self, result: SessionResult) -> bool {
        match self.tx.send(result) {
            Ok(()) => true,
            Err(mpsc::error::SendError(result)) => {
                warn!(device = %result.id, "result dropped: collector is gone");
                false
            }
        }
    }
}

impl Report for ResultSender {
    fn report(&self, result: SessionResult) {
        self.send(result);
    }
}

/// Receives results as they're streamed.
#[async_trait]
pub trait Sink: Send {
    /// Handles one device's result.
    async fn deliver(&mut self, result: &SessionResult) -> io::Result<()>;

    /// Called once, after every result has been delivered.
    async fn finish(&mut self) -> io::Result<()>;
}

/// The consuming end.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<SessionResult>,
}

impl ResultReceiver {
    /// Waits until every sender is dropped and returns everything they sent.
    ///
    /// A second result for the same device is logged and discarded.
    pub async fn collect(mut self) -> ResultSet {
        let mut results = ResultSet::new();
        while let Some(result) = self.rx.recv().await {
            let id = result.id.clone();
            if !results.record(result) {
                warn!(device = %id, "discarding duplicate result");
            }
        }
        results
    }

    /// Spawns a task that delivers each result to `sink` as it arrives, then finishes the sink.
    ///
    /// # Returns
    ///
    /// A handle resolving to the number of results delivered, or to the first error `sink`
    /// returned. A sink that fails to deliver is not finished.
    pub fn stream<S: Sink + 'static>(mut self, mut sink: S) -> JoinHandle<io::Result<usize>> {
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(result) = self.rx.recv().await {
                if !seen.insert(result.id.clone()) {
                    warn!(device = %result.id, "discarding duplicate result");
                    continue;
                }
                sink.deliver(&result).await?;
            }
            sink.finish().await?;
            Ok(seen.len())
        })
    }
}
