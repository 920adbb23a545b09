use core::fmt;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::chunker::{copy_with_progress, CopyOutcome, DEFAULT_CHUNK_SIZE};
use crate::objectstore::{ObjectMetadata, ObjectPath, ObjectStore, StoredObject};
use crate::transfer::{transfer_channel, TransferHandle, TransferReporter};

#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("failed to read upload source: {0}")]
    Io(#[from] io::Error),
    #[error("upload to `{path}` failed: {message}")]
    Injected { path: ObjectPath, message: String },
    #[error("upload to `{0}` was cancelled")]
    Cancelled(ObjectPath),
    #[error("object `{0}` does not exist")]
    NotFound(ObjectPath),
}

pub struct Config {
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

struct StoredBlob {
    contents: Vec<u8>,
    object: StoredObject,
}

impl fmt::Debug for StoredBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.contents.len().min(64);
        let printed = String::from_utf8_lossy(&self.contents[..len]);

        write!(
            f,
            "StoredBlob({printed:?}{}, {:?})",
            if len < self.contents.len() { "…" } else { "" },
            self.object.content_hash
        )
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: RwLock<BTreeMap<ObjectPath, StoredBlob>>,
    faults: Mutex<HashMap<ObjectPath, String>>,
}

/// An [`ObjectStore`] keeping everything in memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    chunk_size: usize,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("objects", &self.inner.objects)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            chunk_size: Config::default().chunk_size,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.chunk_size = config.chunk_size;
        self
    }

    /// Makes the next upload to `path` fail after its first chunk.
    pub fn fail_on(&self, path: ObjectPath, message: impl Into<String>) {
        let mut faults = self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.insert(path, message.into());
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        let objects = self.inner.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.contains_key(path)
    }

    pub fn len(&self) -> usize {
        let objects = self.inner.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_fault(&self, path: &ObjectPath) -> Option<String> {
        let mut faults = self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.remove(path)
    }

    fn spawn_upload(
        &self,
        source: UploadSource,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<MemoryStoreError> {
        let (reporter, handle) = transfer_channel();
        let store = self.clone();
        tokio::spawn(async move {
            match store.upload(&reporter, source, &destination, metadata).await {
                Ok(Some(object)) => reporter.succeed(object),
                Ok(None) => reporter.fail(MemoryStoreError::Cancelled(destination)),
                Err(err) => reporter.fail(err),
            }
        });
        handle
    }

    async fn upload(
        &self,
        reporter: &TransferReporter<MemoryStoreError>,
        source: UploadSource,
        destination: &ObjectPath,
        metadata: ObjectMetadata,
    ) -> Result<Option<StoredObject>, MemoryStoreError> {
        let payload = match source {
            UploadSource::Bytes(payload) => payload,
            UploadSource::File(local_path) => tokio::fs::read(local_path).await?,
        };
        let total = payload.len() as u64;

        let (source, fault) = match self.take_fault(destination) {
            Some(message) => {
                let cut = payload.len().min(self.chunk_size);
                (&payload[..cut], Some(message))
            }
            None => (&payload[..], None),
        };

        let mut contents = Vec::with_capacity(payload.len());
        let outcome =
            copy_with_progress(reporter, self.chunk_size, total, source, &mut contents).await?;
        let CopyOutcome::Finished { len, hash } = outcome else {
            return Ok(None);
        };
        if let Some(message) = fault {
            return Err(MemoryStoreError::Injected {
                path: destination.clone(),
                message,
            });
        }

        let object = StoredObject {
            path: destination.clone(),
            size: len,
            content_hash: hash,
            metadata,
        };
        let blob = StoredBlob {
            contents,
            object: object.clone(),
        };
        let mut objects = self.inner.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(destination.clone(), blob);

        Ok(Some(object))
    }
}

enum UploadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    type Error = MemoryStoreError;

    fn upload_bytes(
        &self,
        payload: Vec<u8>,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<Self::Error> {
        self.spawn_upload(UploadSource::Bytes(payload), destination, metadata)
    }

    fn upload_file(
        &self,
        local_path: PathBuf,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<Self::Error> {
        self.spawn_upload(UploadSource::File(local_path), destination, metadata)
    }

    async fn fetch_object(&self, path: &ObjectPath) -> Result<Vec<u8>, Self::Error> {
        let objects = self.inner.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(path)
            .map(|blob| blob.contents.clone())
            .ok_or_else(|| MemoryStoreError::NotFound(path.clone()))
    }

    async fn delete_object(&self, path: &ObjectPath) -> Result<(), Self::Error> {
        let mut objects = self.inner.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MemoryStoreError::NotFound(path.clone()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectPath>, Self::Error> {
        let objects = self.inner.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}
