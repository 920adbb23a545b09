//! An [`ObjectStore`] backed by a local directory.
//!
//! Layout below the root:
//! - `objects/<key>`: object contents
//! - `meta/<key>`: the postcard-encoded [`StoredObject`]
//! - `tmp/`: in-flight uploads and their records, renamed into place once complete
//!
//! The record is moved into `meta/` before the contents land in `objects/`,
//! so a key that can be fetched is always listed.
//!
//! Keys map onto nested directories. A key cannot be stored while another key
//! uses it as a directory prefix: with `a` stored, uploading `a/b` fails, and
//! the other way around.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::chunker::{copy_with_progress, CopyOutcome, DEFAULT_CHUNK_SIZE};
use crate::objectstore::{ObjectMetadata, ObjectPath, ObjectStore, StoredObject};
use crate::transfer::{transfer_channel, TransferHandle, TransferReporter};

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

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    chunk_size: usize,
}

enum UploadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: Config::default().chunk_size,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.chunk_size = config.chunk_size;
        self
    }

    fn object_path(&self, path: &ObjectPath) -> PathBuf {
        path.to_local(&self.root.join("objects"))
    }

    fn meta_path(&self, path: &ObjectPath) -> PathBuf {
        path.to_local(&self.root.join("meta"))
    }

    /// Reads the record written when `path` was uploaded.
    pub async fn stat(&self, path: &ObjectPath) -> io::Result<StoredObject> {
        let record = fs::read(self.meta_path(path)).await?;
        postcard::from_bytes(&record).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn spawn_upload(
        &self,
        source: UploadSource,
        destination: ObjectPath,
        metadata: ObjectMetadata,
    ) -> TransferHandle<io::Error> {
        let (reporter, handle) = transfer_channel();
        let store = self.clone();
        tokio::spawn(async move {
            let tmp_path = store.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
            let result = store
                .upload(&reporter, source, &tmp_path, &destination, metadata)
                .await;
            if !matches!(result, Ok(Some(_))) {
                // nothing to clean up if the files were never created
                let _ = fs::remove_file(&tmp_path).await;
                let _ = fs::remove_file(tmp_path.with_extension("meta")).await;
            }
            match result {
                Ok(Some(object)) => reporter.succeed(object),
                Ok(None) => reporter.fail(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("upload to `{destination}` was cancelled"),
                )),
                Err(err) => {
                    tracing::debug!(%destination, %err, "local upload failed");
                    reporter.fail(err)
                }
            }
        });
        handle
    }

    async fn upload(
        &self,
        reporter: &TransferReporter<io::Error>,
        source: UploadSource,
        tmp_path: &Path,
        destination: &ObjectPath,
        metadata: ObjectMetadata,
    ) -> io::Result<Option<StoredObject>> {
        fs::create_dir_all(self.root.join("tmp")).await?;
        let mut tmp_file = fs::File::create(tmp_path).await?;

        let outcome = match source {
            UploadSource::Bytes(payload) => {
                let total = payload.len() as u64;
                copy_with_progress(reporter, self.chunk_size, total, payload.as_slice(), &mut tmp_file)
                    .await?
            }
            UploadSource::File(local_path) => {
                let file = fs::File::open(&local_path).await?;
                let total = file.metadata().await?.len();
                copy_with_progress(reporter, self.chunk_size, total, file, &mut tmp_file).await?
            }
        };
        let CopyOutcome::Finished { len, hash } = outcome else {
            return Ok(None);
        };
        tmp_file.sync_all().await?;
        drop(tmp_file);

        reporter.set_cancellable(false);
        let object = StoredObject {
            path: destination.clone(),
            size: len,
            content_hash: hash,
            metadata,
        };
        let record = postcard::to_stdvec(&object)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let tmp_meta_path = tmp_path.with_extension("meta");
        fs::write(&tmp_meta_path, record).await?;

        let object_path = self.object_path(destination);
        let meta_path = self.meta_path(destination);
        for path in [&object_path, &meta_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::rename(&tmp_meta_path, &meta_path).await?;
        if let Err(err) = fs::rename(tmp_path, &object_path).await {
            let _ = fs::remove_file(&meta_path).await;
            return Err(err);
        }

        Ok(Some(object))
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    type Error = io::Error;

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
        fs::read(self.object_path(path)).await
    }

    async fn delete_object(&self, path: &ObjectPath) -> Result<(), Self::Error> {
        fs::remove_file(self.object_path(path)).await?;
        match fs::remove_file(self.meta_path(path)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectPath>, Self::Error> {
        let meta_root = self.root.join("meta");
        let mut found = vec![];
        let mut pending = vec![(meta_root, String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let key = format!("{key_prefix}{name}");
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if key.starts_with(prefix) {
                    if let Ok(path) = ObjectPath::new(key) {
                        found.push(path);
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferEvent;

    fn path(path: &str) -> ObjectPath {
        ObjectPath::new(path).unwrap()
    }

    async fn finish(mut handle: TransferHandle<io::Error>) -> TransferEvent<io::Error> {
        loop {
            match handle.next_event().await.expect("transfer ended without a result") {
                TransferEvent::Progress(_) => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn stores_objects_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).with_config(Config { chunk_size: 8 });
        let metadata = ObjectMetadata::default().with_custom("uploader", "u1");

        let terminal = finish(store.upload_bytes(
            b"a rock photo, in bytes".to_vec(),
            path("rocks/r1/header/h"),
            metadata.clone(),
        ))
        .await;
        let TransferEvent::Success(object) = terminal else {
            panic!("upload should succeed");
        };
        assert_eq!(object.size, 22);

        assert_eq!(
            store.fetch_object(&path("rocks/r1/header/h")).await.unwrap(),
            b"a rock photo, in bytes"
        );
        assert_eq!(store.stat(&path("rocks/r1/header/h")).await.unwrap(), object);
        assert_eq!(object.metadata, metadata);

        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn lists_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.list_objects("").await.unwrap().is_empty());

        for key in ["rocks/r1/normal/b", "rocks/r1/normal/a", "courses/c1/header/x"] {
            let terminal = finish(store.upload_bytes(vec![0; 3], path(key), Default::default())).await;
            assert!(matches!(terminal, TransferEvent::Success(_)));
        }

        assert_eq!(
            store.list_objects("rocks/").await.unwrap(),
            [path("rocks/r1/normal/a"), path("rocks/r1/normal/b")]
        );
        assert_eq!(store.list_objects("").await.unwrap().len(), 3);

        store.delete_object(&path("rocks/r1/normal/a")).await.unwrap();
        assert_eq!(store.list_objects("rocks/").await.unwrap(), [path("rocks/r1/normal/b")]);
        assert!(store.delete_object(&path("rocks/r1/normal/a")).await.is_err());
    }

    #[tokio::test]
    async fn uploads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("topo.png");
        std::fs::write(&source, vec![7u8; 1000]).unwrap();

        let store = LocalStore::new(dir.path().join("store")).with_config(Config { chunk_size: 64 });
        let terminal = finish(store.upload_file(source, path("rocks/r2/normal/topo"), Default::default())).await;
        let TransferEvent::Success(object) = terminal else {
            panic!("upload should succeed");
        };
        assert_eq!(object.size, 1000);

        let missing = dir.path().join("nope.png");
        let terminal = finish(store.upload_file(missing, path("rocks/r2/normal/nope"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Failure(err) if err.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn failed_record_write_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("meta/rocks/r1/x")).unwrap();

        let terminal = finish(store.upload_bytes(b"abc".to_vec(), path("rocks/r1/x"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Failure(_)));

        let err = store.fetch_object(&path("rocks/r1/x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(store.list_objects("").await.unwrap().is_empty());

        let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn keys_cannot_nest_below_stored_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        let terminal = finish(store.upload_bytes(b"a".to_vec(), path("a"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Success(_)));
        let terminal = finish(store.upload_bytes(b"ab".to_vec(), path("a/b"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Failure(_)));

        let terminal = finish(store.upload_bytes(b"cd".to_vec(), path("c/d"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Success(_)));
        let terminal = finish(store.upload_bytes(b"c".to_vec(), path("c"), Default::default())).await;
        assert!(matches!(terminal, TransferEvent::Failure(_)));

        assert_eq!(store.list_objects("").await.unwrap(), [path("a"), path("c/d")]);
        assert_eq!(store.fetch_object(&path("a")).await.unwrap(), b"a");
        assert!(store.fetch_object(&path("a/b")).await.is_err());
        assert_eq!(store.fetch_object(&path("c/d")).await.unwrap(), b"cd");
    }
}
