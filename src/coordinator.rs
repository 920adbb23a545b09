//! Runs a batch of uploads concurrently and publishes one aggregated state.

use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::stream::{self, BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::BatchProgress;
use crate::item::{ImageAction, ImageChange, ImageTarget, TransferItem, TransferSource};
use crate::objectstore::{ObjectMetadata, ObjectPath, ObjectStore, PathError, NO_CACHE};
use crate::state::{AggregateState, UnitCount, UploadError};
use crate::transfer::{TransferControl, TransferEvent};

/// What happens to objects that were already written when a batch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave them in the store.
    #[default]
    KeepUploaded,
    /// Delete them, best effort, after the failure has been published.
    DeleteUploaded,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("upload batch has already been started")]
    AlreadyStarted,
    #[error("invalid image destination: {0}")]
    InvalidPath(#[from] PathError),
}

/// Turns N independent object uploads into a single stream of [`AggregateState`]s.
///
/// Items are enqueued first, then [`start`](Self::start) launches all of them
/// at once. The coordinator reaches exactly one terminal state: `Complete` once
/// every item succeeded, or `Failed` with the first error observed, in which
/// case all other cancellable transfers are cancelled.
///
/// Dropping the coordinator cancels whatever is still running.
pub struct UploadCoordinator<S: ObjectStore> {
    store: Arc<S>,
    config: CoordinatorConfig,
    items: Vec<TransferItem>,
    deletions: Vec<ObjectPath>,
    started: bool,
    publisher: Arc<Publisher<S::Error>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: ObjectStore> UploadCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: CoordinatorConfig::default(),
            items: vec![],
            deletions: vec![],
            started: false,
            publisher: Arc::new(Publisher::new()),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn enqueue(&mut self, item: TransferItem) -> Result<(), CoordinatorError> {
        if self.started {
            return Err(CoordinatorError::AlreadyStarted);
        }
        self.items.push(item);
        Ok(())
    }

    /// Enqueues the upload an image edit needs, or schedules the deletion of
    /// the stored image. Deletions run when the batch starts and do not
    /// influence its outcome.
    pub fn enqueue_image(
        &mut self,
        target: &ImageTarget,
        change: ImageChange,
    ) -> Result<(), CoordinatorError> {
        if self.started {
            return Err(CoordinatorError::AlreadyStarted);
        }
        match change.resolve(target)? {
            ImageAction::Upload(item) => self.enqueue(item),
            ImageAction::Delete(path) => {
                self.deletions.push(path);
                Ok(())
            }
        }
    }

    /// Number of uploads waiting for [`start`](Self::start).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every state published from now on, starting with the current one.
    ///
    /// The stream ends after a terminal state.
    pub fn subscribe(&self) -> StateStream<S::Error> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> AggregateState<S::Error> {
        self.publisher.current()
    }

    /// Launches every enqueued upload and any scheduled image deletions.
    ///
    /// # Panics
    ///
    /// Must be called within a tokio runtime, as the batch and the store
    /// transfers run on spawned tasks.
    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        if self.started {
            return Err(CoordinatorError::AlreadyStarted);
        }
        self.started = true;
        self.spawn_deletions();

        let items = mem::take(&mut self.items);
        if items.is_empty() {
            tracing::debug!("empty upload batch");
            self.publisher.publish(AggregateState::Complete(vec![]));
            return Ok(());
        }
        tracing::info!(items = items.len(), "starting upload batch");

        let mut destinations = Vec::with_capacity(items.len());
        let mut controls = Vec::with_capacity(items.len());
        let mut events = SelectAll::new();
        for (index, item) in items.into_iter().enumerate() {
            let metadata = no_cache(item.metadata);
            let handle = match item.source {
                TransferSource::Bytes(payload) => {
                    self.store
                        .upload_bytes(payload, item.destination.clone(), metadata)
                }
                TransferSource::File(local_path) => {
                    self.store
                        .upload_file(local_path, item.destination.clone(), metadata)
                }
            };
            let (control, item_events) = handle.split();
            let item_events: BoxStream<'static, ItemEvent<S::Error>> = item_events
                .map(move |event| (index, Some(event)))
                .chain(stream::once(async move { (index, None) }))
                .boxed();

            destinations.push(item.destination);
            controls.push(control);
            events.push(item_events);
        }

        self.publisher
            .publish(AggregateState::InProgress(UnitCount::PLACEHOLDER));

        let batch = Batch {
            store: Arc::clone(&self.store),
            policy: self.config.failure_policy,
            progress: BatchProgress::new(destinations),
            controls,
            publisher: Arc::clone(&self.publisher),
        };
        self.task = Some(tokio::spawn(batch.run(events, self.shutdown.clone())));
        Ok(())
    }

    /// Waits until the batch has finished, including any rollback, and returns
    /// the final state.
    pub async fn join(mut self) -> AggregateState<S::Error> {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(%err, "upload batch task failed");
            }
        }
        self.publisher.current()
    }

    fn spawn_deletions(&mut self) {
        let deletions = mem::take(&mut self.deletions);
        if deletions.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let results = futures_util::future::join_all(
                deletions.iter().map(|path| store.delete_object(path)),
            )
            .await;
            for (path, result) in deletions.iter().zip(results) {
                match result {
                    Ok(()) => tracing::debug!(%path, "deleted replaced image"),
                    Err(err) => tracing::warn!(%path, %err, "failed to delete image"),
                }
            }
        });
    }
}

impl<S: ObjectStore> Drop for UploadCoordinator<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn no_cache(metadata: Option<ObjectMetadata>) -> ObjectMetadata {
    let mut metadata = metadata.unwrap_or_default();
    metadata.cache_control = Some(NO_CACHE.into());
    metadata
}

/// An event of the item at the given index; `None` once its event stream ended.
type ItemEvent<E> = (usize, Option<TransferEvent<E>>);

/// The single owner of a running batch's bookkeeping.
struct Batch<S: ObjectStore> {
    store: Arc<S>,
    policy: FailurePolicy,
    progress: BatchProgress,
    controls: Vec<TransferControl>,
    publisher: Arc<Publisher<S::Error>>,
}

impl<S: ObjectStore> Batch<S> {
    async fn run(
        mut self,
        mut events: SelectAll<BoxStream<'static, ItemEvent<S::Error>>>,
        shutdown: CancellationToken,
    ) {
        while !self.progress.is_finished() {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let cancelled = self.cancel_running(None);
                    tracing::info!(cancelled, "upload batch dropped before finishing");
                    return;
                }
                next = events.next() => next,
            };
            // each item's end marker settles that item, so the merged stream
            // cannot run dry before the batch is finished
            let Some((index, event)) = next else {
                break;
            };
            self.handle(index, event);
        }

        let failed = matches!(self.publisher.current(), AggregateState::Failed(_));
        if failed && self.policy == FailurePolicy::DeleteUploaded {
            self.roll_back(events, shutdown).await;
        }
    }

    fn handle(&mut self, index: usize, event: Option<TransferEvent<S::Error>>) {
        let state = match event {
            Some(TransferEvent::Progress(progress)) => self.progress.on_progress(index, progress),
            Some(TransferEvent::Success(object)) => {
                tracing::debug!(index, path = %object.path, size = object.size, "upload finished");
                self.progress.on_success(index, object)
            }
            Some(TransferEvent::Failure(err)) => {
                self.fail(index, UploadError::Transfer(err))
            }
            None => {
                if self.progress.is_finished() {
                    return;
                }
                let state = self.progress.on_ended(index);
                if state.is_some() {
                    let cancelled = self.cancel_running(Some(index));
                    tracing::warn!(index, cancelled, "transfer ended without a result");
                }
                state
            }
        };

        if let Some(state) = state {
            if let AggregateState::Complete(results) = &state {
                tracing::info!(items = results.len(), "upload batch complete");
            }
            self.publisher.publish(state);
        }
    }

    fn fail(
        &mut self,
        index: usize,
        error: UploadError<S::Error>,
    ) -> Option<AggregateState<S::Error>> {
        if self.progress.is_finished() {
            return None;
        }
        let cancelled = self.cancel_running(Some(index));
        tracing::warn!(index, %error, cancelled, "upload failed, cancelling batch");
        self.progress.on_failure(error)
    }

    /// Cancels every transfer except `skip` that is cancellable right now.
    fn cancel_running(&self, skip: Option<usize>) -> usize {
        self.controls
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .filter(|(_, control)| control.cancel())
            .count()
    }

    /// Deletes every object written by this batch, including those whose
    /// transfers could not be cancelled and finished after the failure.
    async fn roll_back(
        &self,
        mut events: SelectAll<BoxStream<'static, ItemEvent<S::Error>>>,
        shutdown: CancellationToken,
    ) {
        let mut uploaded: Vec<ObjectPath> = self.progress.uploaded().cloned().collect();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some((_, Some(TransferEvent::Success(object)))) => uploaded.push(object.path),
                Some(_) => {}
                None => break,
            }
        }
        drop(events);

        for path in uploaded {
            match self.store.delete_object(&path).await {
                Ok(()) => tracing::info!(%path, "rolled back uploaded object"),
                Err(err) => tracing::warn!(%path, %err, "failed to roll back uploaded object"),
            }
        }
    }
}

struct Published<E> {
    current: AggregateState<E>,
    subscribers: Vec<mpsc::UnboundedSender<AggregateState<E>>>,
}

/// Fans states out to subscribers; nothing is published after a terminal state.
struct Publisher<E> {
    inner: Mutex<Published<E>>,
}

impl<E> Publisher<E> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Published {
                current: AggregateState::Idle,
                subscribers: vec![],
            }),
        }
    }

    fn current(&self) -> AggregateState<E> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.current.clone()
    }

    fn subscribe(&self) -> StateStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(inner.current.clone());
        if !inner.current.is_terminal() {
            inner.subscribers.push(tx);
        }
        StateStream { states: rx }
    }

    fn publish(&self, state: AggregateState<E>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.current.is_terminal() {
            return;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(state.clone()).is_ok());
        if state.is_terminal() {
            inner.subscribers.clear();
        }
        inner.current = state;
    }
}

/// The states published by an [`UploadCoordinator`].
pub struct StateStream<E> {
    states: mpsc::UnboundedReceiver<AggregateState<E>>,
}

impl<E> Stream for StateStream<E> {
    type Item = AggregateState<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.states.poll_recv(cx)
    }
}
