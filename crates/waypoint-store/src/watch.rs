//! Watch events and the stream that delivers them

use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub revision: i64,
}

/// Batches of events for one watched prefix.
///
/// Backends push batches into the sending half; the stream ends when the
/// backend drops it. An `Err` item means the watch is broken and the caller
/// should open a new one.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<StoreResult<Vec<WatchEvent>>>,
}

pub(crate) type WatchSender = mpsc::UnboundedSender<StoreResult<Vec<WatchEvent>>>;

impl WatchStream {
    pub(crate) fn channel() -> (WatchSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next batch. `None` once the watch has been closed.
    pub async fn next(&mut self) -> Option<StoreResult<Vec<WatchEvent>>> {
        self.rx.recv().await
    }

    /// Take every batch already queued without waiting.
    ///
    /// Returns the number of events drained, or the first error seen. Used to
    /// coalesce a burst of changes into one refetch.
    pub fn drain_pending(&mut self) -> StoreResult<usize> {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(Ok(batch)) => drained += batch.len(),
                Ok(Err(e)) => return Err(e),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(drained),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(StoreError::WatchClosed("watch stream disconnected".into()))
                }
            }
        }
    }
}
