use core::fmt;
use std::path::PathBuf;

use crate::objectstore::{ObjectMetadata, ObjectPath, PathError};

/// Where the bytes of a transfer come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// One object to be written by an upload batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub source: TransferSource,
    pub destination: ObjectPath,
    pub metadata: Option<ObjectMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("transfer to `{0}` has both a byte payload and a file")]
    BothSources(ObjectPath),
    #[error("transfer to `{0}` has neither a byte payload nor a file")]
    NoSource(ObjectPath),
}

impl TransferItem {
    pub fn bytes(payload: impl Into<Vec<u8>>, destination: ObjectPath) -> Self {
        Self {
            source: TransferSource::Bytes(payload.into()),
            destination,
            metadata: None,
        }
    }

    pub fn file(local_path: impl Into<PathBuf>, destination: ObjectPath) -> Self {
        Self {
            source: TransferSource::File(local_path.into()),
            destination,
            metadata: None,
        }
    }

    /// Builds an item from two optional sources, exactly one of which has to be set.
    pub fn from_parts(
        payload: Option<Vec<u8>>,
        local_path: Option<PathBuf>,
        destination: ObjectPath,
        metadata: Option<ObjectMetadata>,
    ) -> Result<Self, ItemError> {
        let source = match (payload, local_path) {
            (Some(payload), None) => TransferSource::Bytes(payload),
            (None, Some(local_path)) => TransferSource::File(local_path),
            (Some(_), Some(_)) => return Err(ItemError::BothSources(destination)),
            (None, None) => return Err(ItemError::NoSource(destination)),
        };
        Ok(Self {
            source,
            destination,
            metadata,
        })
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Header,
    Icon,
    Normal,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "header",
            Self::Icon => "icon",
            Self::Normal => "normal",
        })
    }
}

/// The document an image belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTarget {
    pub collection: String,
    pub document_id: String,
    pub kind: ImageKind,
}

/// A pending edit to one stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageChange {
    /// A new image without a stored counterpart.
    Create { data: Vec<u8> },
    /// New contents for an already stored image.
    Update { existing: ObjectPath, data: Vec<u8> },
    Delete { existing: ObjectPath },
}

/// What an [`ImageChange`] turns into once its target is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageAction {
    Upload(TransferItem),
    Delete(ObjectPath),
}

impl ImageChange {
    pub(crate) fn resolve(self, target: &ImageTarget) -> Result<ImageAction, PathError> {
        Ok(match self {
            Self::Create { data } => {
                let destination =
                    ObjectPath::for_image(&target.collection, &target.document_id, target.kind)?;
                ImageAction::Upload(TransferItem::bytes(data, destination))
            }
            Self::Update { existing, data } => {
                ImageAction::Upload(TransferItem::bytes(data, existing))
            }
            Self::Delete { existing } => ImageAction::Delete(existing),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(path: &str) -> ObjectPath {
        ObjectPath::new(path).unwrap()
    }

    #[test]
    fn from_parts_requires_exactly_one_source() {
        let both = TransferItem::from_parts(
            Some(b"abc".to_vec()),
            Some("/tmp/a.jpg".into()),
            path("rocks/1/a"),
            None,
        );
        assert_eq!(both, Err(ItemError::BothSources(path("rocks/1/a"))));

        let neither = TransferItem::from_parts(None, None, path("rocks/1/a"), None);
        assert_eq!(neither, Err(ItemError::NoSource(path("rocks/1/a"))));

        let item = TransferItem::from_parts(None, Some("/tmp/a.jpg".into()), path("rocks/1/a"), None)
            .unwrap();
        assert_eq!(item.source, TransferSource::File("/tmp/a.jpg".into()));
    }

    #[test]
    fn image_changes_resolve_to_actions() {
        let target = ImageTarget {
            collection: "rocks".into(),
            document_id: "r1".into(),
            kind: ImageKind::Normal,
        };

        let ImageAction::Upload(created) = ImageChange::Create { data: vec![1] }
            .resolve(&target)
            .unwrap()
        else {
            panic!("create should upload");
        };
        assert!(created.destination.starts_with("rocks/r1/normal/"));

        let updated = ImageChange::Update {
            existing: path("rocks/r1/header/old"),
            data: vec![2],
        }
        .resolve(&target)
        .unwrap();
        assert_eq!(
            updated,
            ImageAction::Upload(TransferItem::bytes(vec![2u8], path("rocks/r1/header/old")))
        );

        let deleted = ImageChange::Delete {
            existing: path("rocks/r1/normal/gone"),
        }
        .resolve(&target)
        .unwrap();
        assert_eq!(deleted, ImageAction::Delete(path("rocks/r1/normal/gone")));
    }
}
