//! A parked request and its single-use release signal.

use crate::types::WaitOutcome;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// One caller waiting in a shard's queue.
///
/// The release signal is consumed by [`deliver`](Self::deliver), so an entry
/// can produce at most one outcome. Whoever removes the entry from the queue
/// owns that outcome.
#[derive(Debug)]
pub(crate) struct BufferedRequest {
    id: u64,
    enqueued_at: Instant,
    release: oneshot::Sender<WaitOutcome>,
}

impl BufferedRequest {
    /// Create an entry and the receiver its caller parks on.
    pub(crate) fn new(id: u64, enqueued_at: Instant) -> (Self, oneshot::Receiver<WaitOutcome>) {
        let (release, rx) = oneshot::channel();
        (
            Self {
                id,
                enqueued_at,
                release,
            },
            rx,
        )
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Wake the caller with `outcome`. Returns false if the caller is gone.
    pub(crate) fn deliver(self, outcome: WaitOutcome) -> bool {
        self.release.send(outcome).is_ok()
    }
}
