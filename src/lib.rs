//! Concurrent multi-object uploads with a single aggregated progress stream.
//!
//! An [`UploadCoordinator`] takes a batch of [`TransferItem`]s, starts one
//! transfer per item against an [`ObjectStore`], and republishes everything it
//! observes as one [`AggregateState`].

mod aggregate;
pub mod chunker;
pub mod coordinator;
pub mod item;
pub mod localstore;
pub mod memstore;
pub mod objectstore;
pub mod state;
pub mod transfer;

pub use coordinator::{
    CoordinatorConfig, CoordinatorError, FailurePolicy, StateStream, UploadCoordinator,
};
pub use item::{ImageChange, ImageKind, ImageTarget, ItemError, TransferItem, TransferSource};
pub use objectstore::{ContentHash, ObjectMetadata, ObjectPath, ObjectStore, StoredObject};
pub use state::{AggregateState, UnitCount, UploadError};
pub use transfer::{transfer_channel, Progress, TransferEvent, TransferHandle, TransferReporter};
