//! Bookkeeping for one running batch.
//!
//! [`BatchProgress`] is owned by exactly one event loop, so every event is
//! applied against a consistent view of all items. Each handler returns the
//! state to publish, if any; once a terminal state was returned every later
//! event is ignored.

use std::sync::Arc;

use crate::objectstore::{ObjectPath, StoredObject};
use crate::state::{AggregateState, UnitCount, UploadError};
use crate::transfer::Progress;

pub(crate) struct BatchProgress {
    destinations: Vec<ObjectPath>,
    snapshots: Vec<Progress>,
    results: Vec<Option<StoredObject>>,
    succeeded: usize,
    finished: bool,
}

impl BatchProgress {
    pub fn new(destinations: Vec<ObjectPath>) -> Self {
        let len = destinations.len();
        Self {
            destinations,
            snapshots: vec![Progress::default(); len],
            results: vec![None; len],
            succeeded: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_progress<E>(&mut self, index: usize, progress: Progress) -> Option<AggregateState<E>> {
        if self.finished {
            return None;
        }
        self.snapshots[index] = progress;
        Some(AggregateState::InProgress(self.unit_count()))
    }

    pub fn on_success<E>(
        &mut self,
        index: usize,
        object: StoredObject,
    ) -> Option<AggregateState<E>> {
        if self.finished || self.results[index].is_some() {
            return None;
        }
        self.results[index] = Some(object);
        self.succeeded += 1;

        if self.succeeded < self.results.len() {
            return None;
        }
        self.finished = true;
        let results = self.results.iter().flatten().cloned().collect();
        Some(AggregateState::Complete(results))
    }

    pub fn on_failure<E>(&mut self, error: UploadError<E>) -> Option<AggregateState<E>> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(AggregateState::Failed(Arc::new(error)))
    }

    /// The event stream of `index` ended; without a result that is a failure.
    pub fn on_ended<E>(&mut self, index: usize) -> Option<AggregateState<E>> {
        if self.results[index].is_some() {
            return None;
        }
        let destination = self.destinations[index].clone();
        self.on_failure(UploadError::Abandoned(destination))
    }

    pub fn unit_count(&self) -> UnitCount {
        self.snapshots
            .iter()
            .fold(UnitCount { total: 0, completed: 0 }, |sum, snapshot| UnitCount {
                total: sum.total.saturating_add(snapshot.total),
                completed: sum.completed.saturating_add(snapshot.completed),
            })
    }

    /// Objects that were fully written before the batch ended.
    pub fn uploaded(&self) -> impl Iterator<Item = &ObjectPath> {
        self.results.iter().flatten().map(|object| &object.path)
    }
}
