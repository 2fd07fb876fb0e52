use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    storage::{
        bounded,
        error::{StorageError, StoreBackend},
    },
};

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub key: String,
    pub modified_at: OffsetDateTime,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

pub fn validate_blob_key(key: &str) -> Result<(), StorageError> {
    let well_formed = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && !key.ends_with(TEMP_SUFFIX)
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(StorageError::conflict(
            StoreBackend::Blob,
            format!("invalid blob key '{key}'"),
        ))
    }
}

/// Blobs as files under `root`. Every call is bounded by `operation_timeout`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    operation_timeout: Duration,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, operation_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            operation_timeout,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_blob_key(key)?;
        Ok(self.root.join(key))
    }
}

fn blob_io_error(action: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::unavailable(
        StoreBackend::Blob,
        format!("failed to {action} '{}': {err}", path.display()),
    )
}

async fn run_blocking<T, F>(work: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        StorageError::unavailable(StoreBackend::Blob, format!("blob worker failed: {err}"))
    })?
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().ok_or_else(|| {
        StorageError::unavailable(
            StoreBackend::Blob,
            format!("blob path '{}' has no parent", path.display()),
        )
    })?;
    fs::create_dir_all(parent).map_err(|err| blob_io_error("create directory", parent, err))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TEMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);

    let file =
        fs::File::create(&tmp_path).map_err(|err| blob_io_error("create", &tmp_path, err))?;
    {
        let mut writer = BufWriter::new(&file);
        writer
            .write_all(bytes)
            .map_err(|err| blob_io_error("write", &tmp_path, err))?;
        writer
            .flush()
            .map_err(|err| blob_io_error("flush", &tmp_path, err))?;
    }
    file.sync_all()
        .map_err(|err| blob_io_error("sync", &tmp_path, err))?;

    fs::rename(&tmp_path, path).map_err(|err| blob_io_error("publish", path, err))?;

    if let Ok(parent_dir) = fs::File::open(parent) {
        let _ = parent_dir.sync_all();
    }
    Ok(())
}

fn collect_blobs(root: &Path, start: &Path) -> Result<Vec<BlobInfo>, StorageError> {
    let mut found = Vec::new();
    let mut pending = vec![start.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(blob_io_error("scan", &dir, err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| blob_io_error("scan", &dir, err))?;
            let path = entry.path();
            let metadata = entry
                .metadata()
                .map_err(|err| blob_io_error("stat", &path, err))?;
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(TEMP_SUFFIX) {
                continue;
            }

            let modified_at = metadata
                .modified()
                .map(OffsetDateTime::from)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
            found.push(BlobInfo { key, modified_at });
        }
    }

    found.sort_by(|left, right| left.key.cmp(&right.key));
    Ok(found)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        bounded(
            StoreBackend::Blob,
            "put",
            self.operation_timeout,
            run_blocking(move || write_atomically(&path, &bytes)),
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        bounded(StoreBackend::Blob, "get", self.operation_timeout, async {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(blob_io_error("read", &path, err)),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        bounded(StoreBackend::Blob, "delete", self.operation_timeout, async {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(blob_io_error("delete", &path, err)),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.trim_matches('/').to_string();
        let start = if prefix.is_empty() {
            root.clone()
        } else {
            validate_blob_key(&prefix)?;
            root.join(&prefix)
        };
        bounded(
            StoreBackend::Blob,
            "list",
            self.operation_timeout,
            run_blocking(move || collect_blobs(&root, &start)),
        )
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let root = self.root.clone();
        let check = run_blocking(move || {
            fs::create_dir_all(&root).map_err(|err| blob_io_error("create directory", &root, err))?;
            let metadata =
                fs::metadata(&root).map_err(|err| blob_io_error("stat", &root, err))?;
            if metadata.permissions().readonly() {
                return Err(StorageError::unavailable(
                    StoreBackend::Blob,
                    format!("blob root '{}' is read-only", root.display()),
                ));
            }
            Ok(())
        });
        bounded(StoreBackend::Blob, "ping", self.operation_timeout, check).await
    }
}

/// In-process blob store; modification times come from the supplied clock.
#[derive(Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, (Vec<u8>, OffsetDateTime)>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBlobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            blobs: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_blob_key(key)?;
        let now = self.clock.now();
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), (bytes, now));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_blob_key(key)?;
        Ok(self
            .blobs
            .lock()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_blob_key(key)?;
        self.blobs.lock().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>, StorageError> {
        let guard = self.blobs.lock().await;
        Ok(guard
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (_, modified_at))| BlobInfo {
                key: key.clone(),
                modified_at: *modified_at,
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
