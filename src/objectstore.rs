use core::fmt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::item::ImageKind;
use crate::transfer::TransferHandle;

/// The `Cache-Control` directive forced onto every uploaded object.
pub const NO_CACHE: &str = "no-cache";

/// A `/`-separated key naming an object inside a store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("object path is empty")]
    Empty,
    #[error("object path `{0}` must not start with `/`")]
    Absolute(String),
    #[error("object path `{0}` contains an empty, `.` or `..` segment")]
    InvalidSegment(String),
}

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if path.starts_with('/') {
            return Err(PathError::Absolute(path));
        }
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(PathError::InvalidSegment(path));
        }
        Ok(Self(path))
    }

    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        Self::new(format!("{}/{segment}", self.0))
    }

    /// A fresh, unique key for an image attached to a document:
    /// `{collection}/{document_id}/{kind}/{uuid}`.
    pub fn for_image(
        collection: &str,
        document_id: &str,
        kind: ImageKind,
    ) -> Result<Self, PathError> {
        let id = uuid::Uuid::new_v4();
        Self::new(format!("{collection}/{document_id}/{kind}/{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Maps this key below `root` on the local filesystem.
    ///
    /// Validation in [`ObjectPath::new`], which decoding goes through as well,
    /// guarantees the result stays inside `root`.
    pub fn to_local(&self, root: &Path) -> PathBuf {
        let mut local = root.to_path_buf();
        local.extend(self.0.split('/'));
        local
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = PathError;

    fn try_from(path: String) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.0
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPath({:?})", self.0)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes stored alongside an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub cache_control: Option<String>,
    pub content_type: Option<String>,
    pub custom: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// BLAKE3 digest of an object's contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn from_contents(contents: &[u8]) -> Self {
        Self(*blake3::hash(contents).as_bytes())
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash(BLAKE3:{:x})", base16ct::HexDisplay(&self.0))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.0))
    }
}

/// What the store reports once an object has been fully written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub path: ObjectPath,
    pub size: u64,
    pub content_hash: ContentHash,
    pub metadata: ObjectMetadata,
}

/// A remote (or local) object store that uploads can be sent to.
///
/// Both upload methods start the transfer right away on the current tokio
/// runtime; the returned [`TransferHandle`] observes and controls it.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn upload_bytes(
        &self,
        payload: Vec<u8>,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<Self::Error>;

    fn upload_file(
        &self,
        local_path: PathBuf,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<Self::Error>;

    async fn fetch_object(&self, path: &ObjectPath) -> Result<Vec<u8>, Self::Error>;

    async fn delete_object(&self, path: &ObjectPath) -> Result<(), Self::Error>;

    /// All keys starting with `prefix`, sorted.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectPath>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_validates_paths() {
        let encoded = postcard::to_stdvec(&"rocks/r1/normal/a".to_string()).unwrap();
        let decoded: ObjectPath = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, ObjectPath::new("rocks/r1/normal/a").unwrap());
        assert_eq!(postcard::to_stdvec(&decoded).unwrap(), encoded);

        for bad in ["../x", "/etc/passwd", "rocks/../../x", ""] {
            let encoded = postcard::to_stdvec(&bad.to_string()).unwrap();
            assert!(postcard::from_bytes::<ObjectPath>(&encoded).is_err(), "{bad:?} decoded");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(ObjectPath::new(""), Err(PathError::Empty));
        assert!(matches!(
            ObjectPath::new("/rocks/1"),
            Err(PathError::Absolute(_))
        ));
        for bad in ["rocks//1", "rocks/./1", "rocks/../1", "rocks/"] {
            assert!(
                matches!(ObjectPath::new(bad), Err(PathError::InvalidSegment(_))),
                "{bad}"
            );
        }

        let path = ObjectPath::new("rocks/1/header").unwrap();
        assert_eq!(path.child("a.jpg").unwrap().as_str(), "rocks/1/header/a.jpg");
        assert!(path.child("..").is_err());
    }

    #[test]
    fn image_paths_are_unique() {
        let a = ObjectPath::for_image("rocks", "r1", ImageKind::Header).unwrap();
        let b = ObjectPath::for_image("rocks", "r1", ImageKind::Header).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("rocks/r1/header/"));
    }

    #[test]
    fn local_paths_stay_below_root() {
        let root = Path::new("/tmp/store");
        let path = ObjectPath::new("courses/c1/normal/x").unwrap();
        assert_eq!(
            path.to_local(root),
            PathBuf::from("/tmp/store/courses/c1/normal/x")
        );
    }

    #[test]
    fn content_hash_renders_as_hex() {
        let hash = ContentHash::from_contents(b"");
        assert_eq!(
            hash.to_string(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }
}
