//! The handle pair connecting a store's running transfer to its observer.
//!
//! A store backend keeps the [`TransferReporter`] and pushes progress and the
//! final outcome through it. Whoever started the transfer keeps the
//! [`TransferHandle`], reads those events, and may cancel the transfer while it
//! reports itself cancellable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::objectstore::StoredObject;

/// Bytes written so far out of the bytes expected for one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

#[derive(Debug)]
pub enum TransferEvent<E> {
    Progress(Progress),
    Success(StoredObject),
    Failure(E),
}

struct Shared {
    cancel: CancellationToken,
    cancellable: AtomicBool,
}

pub fn transfer_channel<E>() -> (TransferReporter<E>, TransferHandle<E>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        cancel: CancellationToken::new(),
        cancellable: AtomicBool::new(true),
    });

    let reporter = TransferReporter {
        events: events_tx,
        shared: Arc::clone(&shared),
    };
    let handle = TransferHandle {
        events: events_rx,
        control: TransferControl { shared },
    };
    (reporter, handle)
}

/// The producing side of a transfer, owned by the store backend.
pub struct TransferReporter<E> {
    events: mpsc::UnboundedSender<TransferEvent<E>>,
    shared: Arc<Shared>,
}

impl<E> TransferReporter<E> {
    pub fn progress(&self, completed: u64, total: u64) {
        // the observer may already be gone, which is fine
        let _ = self
            .events
            .send(TransferEvent::Progress(Progress { completed, total }));
    }

    pub fn succeed(self, object: StoredObject) {
        self.shared.cancellable.store(false, Ordering::Release);
        let _ = self.events.send(TransferEvent::Success(object));
    }

    pub fn fail(self, error: E) {
        self.shared.cancellable.store(false, Ordering::Release);
        let _ = self.events.send(TransferEvent::Failure(error));
    }

    /// Marks whether the transfer may currently be aborted, e.g. `false` while
    /// an object is being committed.
    pub fn set_cancellable(&self, cancellable: bool) {
        self.shared
            .cancellable
            .store(cancellable, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shared.cancel.cancelled()
    }
}

/// Cancels a transfer; cheap to clone and independent of the event stream.
#[derive(Clone)]
pub struct TransferControl {
    shared: Arc<Shared>,
}

impl TransferControl {
    pub fn is_cancellable(&self) -> bool {
        self.shared.cancellable.load(Ordering::Acquire)
    }

    /// Requests cancellation if the transfer is cancellable right now.
    ///
    /// Returns whether the request was issued.
    pub fn cancel(&self) -> bool {
        if !self.is_cancellable() {
            return false;
        }
        self.shared.cancel.cancel();
        true
    }
}

/// The observing side of a transfer.
pub struct TransferHandle<E> {
    events: mpsc::UnboundedReceiver<TransferEvent<E>>,
    control: TransferControl,
}

impl<E> TransferHandle<E> {
    pub fn is_cancellable(&self) -> bool {
        self.control.is_cancellable()
    }

    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// The next event, or `None` once the reporter is gone.
    pub async fn next_event(&mut self) -> Option<TransferEvent<E>> {
        self.events.recv().await
    }

    pub fn split(self) -> (TransferControl, impl Stream<Item = TransferEvent<E>>) {
        let events = futures_util::stream::unfold(self.events, |mut events| async move {
            let event = events.recv().await?;
            Some((event, events))
        });
        (self.control, events)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::objectstore::{ContentHash, ObjectMetadata, ObjectPath};

    fn stored(path: &str) -> StoredObject {
        StoredObject {
            path: ObjectPath::new(path).unwrap(),
            size: 0,
            content_hash: ContentHash::from_contents(b""),
            metadata: ObjectMetadata::default(),
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let (reporter, mut handle) = transfer_channel::<std::io::Error>();
        reporter.progress(1, 4);
        reporter.progress(4, 4);
        reporter.succeed(stored("a"));

        assert!(matches!(
            handle.next_event().await,
            Some(TransferEvent::Progress(Progress { completed: 1, total: 4 }))
        ));
        assert!(matches!(
            handle.next_event().await,
            Some(TransferEvent::Progress(Progress { completed: 4, total: 4 }))
        ));
        assert!(matches!(
            handle.next_event().await,
            Some(TransferEvent::Success(_))
        ));
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn cancel_respects_cancellable_flag() {
        let (reporter, handle) = transfer_channel::<std::io::Error>();

        reporter.set_cancellable(false);
        assert!(!handle.cancel());
        assert!(!reporter.is_cancelled());

        reporter.set_cancellable(true);
        assert!(handle.cancel());
        assert!(reporter.is_cancelled());
        reporter.cancelled().await;
    }

    #[tokio::test]
    async fn finished_transfers_are_not_cancellable() {
        let (reporter, handle) = transfer_channel::<std::io::Error>();
        let (control, events) = handle.split();

        reporter.succeed(stored("a"));
        assert!(!control.is_cancellable());
        assert!(!control.cancel());

        let events: Vec<_> = events.collect().await;
        assert_eq!(events.len(), 1);
    }
}
