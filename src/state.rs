use std::sync::Arc;

use crate::objectstore::{ObjectPath, StoredObject};

/// Aggregated bytes across every transfer of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitCount {
    pub total: u64,
    pub completed: u64,
}

impl UnitCount {
    /// Published right after a batch starts, before any transfer knows its size.
    pub const PLACEHOLDER: Self = Self {
        total: 1,
        completed: 0,
    };

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError<E> {
    #[error(transparent)]
    Transfer(E),
    #[error("transfer to `{0}` ended without a result")]
    Abandoned(ObjectPath),
}

/// The combined state of an upload batch.
#[derive(Debug)]
pub enum AggregateState<E> {
    Idle,
    InProgress(UnitCount),
    /// Results of every item, in the order the items were enqueued.
    Complete(Vec<StoredObject>),
    Failed(Arc<UploadError<E>>),
}

impl<E> AggregateState<E> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed(_))
    }
}

// derived `Clone` would require `E: Clone`
impl<E> Clone for AggregateState<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Idle => Self::Idle,
            Self::InProgress(count) => Self::InProgress(*count),
            Self::Complete(results) => Self::Complete(results.clone()),
            Self::Failed(error) => Self::Failed(Arc::clone(error)),
        }
    }
}
