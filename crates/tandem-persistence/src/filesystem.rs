//! Local filesystem storage backend

use std::{
    io,
    path::{Component, Path, PathBuf},
    pin::Pin,
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tandem_common::{
    MetadataPatch, MetadataRecord, ReadStream, StorageBackend, TandemError, TandemResult,
    WriteOptions, WriteStream,
};
use tempfile::NamedTempFile;
use tokio::{io::AsyncWrite, sync::Mutex};
use tracing::debug;

use crate::metadata::apply_patch;

pub const FILESYSTEM_BACKEND: &str = "filesystem";

/// File holding every metadata record, relative to the storage root
pub const METADATA_FILE: &str = ".tandem-db.json";

/// Stores content as files below a root directory
pub struct FilesystemBackend {
    root: PathBuf,
    metadata_lock: Mutex<()>,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metadata_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> TandemResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(TandemError::Storage(format!("invalid storage path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    async fn load_metadata(&self) -> TandemResult<Map<String, Value>> {
        match tokio::fs::read(self.metadata_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_metadata(&self, records: &Map<String, Value>) -> TandemResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let staging = self.root.join(format!("{}.tmp", METADATA_FILE));
        tokio::fs::write(&staging, serde_json::to_vec_pretty(records)?).await?;
        tokio::fs::rename(&staging, self.metadata_path()).await?;
        Ok(())
    }
}

fn map_io(path: &str, e: io::Error) -> TandemError {
    match e.kind() {
        io::ErrorKind::NotFound => TandemError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => TandemError::AlreadyExists(path.to_string()),
        _ => TandemError::Io(e),
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn name(&self) -> &'static str {
        FILESYSTEM_BACKEND
    }

    async fn read(&self, path: &str) -> TandemResult<ReadStream> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn write(&self, path: &str, options: WriteOptions) -> TandemResult<WriteStream> {
        let full = self.resolve(path)?;
        if options.create_only && tokio::fs::try_exists(&full).await? {
            return Err(TandemError::AlreadyExists(path.to_string()));
        }

        let parent = full
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent).await?;

        let temp = NamedTempFile::new_in(&parent)?;
        let file = tokio::fs::File::from_std(temp.reopen()?);
        debug!("Staging write of {} in {}", path, temp.path().display());

        Ok(Box::new(FileWriter {
            file,
            temp: Some(temp),
            target: full,
            create_only: options.create_only,
        }))
    }

    async fn remove(&self, path: &str) -> TandemResult<()> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn patch_metadata(&self, name: &str, patch: MetadataPatch) -> TandemResult<()> {
        let _guard = self.metadata_lock.lock().await;
        let mut records = self.load_metadata().await?;

        let mut record = match records.remove(name) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if !apply_patch(&mut record, patch) {
            records.insert(name.to_string(), Value::Object(record));
        }
        self.store_metadata(&records).await
    }

    async fn list_metadata(&self) -> TandemResult<Vec<MetadataRecord>> {
        let _guard = self.metadata_lock.lock().await;
        let records = self.load_metadata().await?;
        Ok(records
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Object(metadata) => Some(MetadataRecord { name, metadata }),
                _ => None,
            })
            .collect())
    }
}

/// Writes into a staging file and moves it into place on shutdown.
/// Dropping it earlier discards the staging file.
struct FileWriter {
    file: tokio::fs::File,
    temp: Option<NamedTempFile>,
    target: PathBuf,
    create_only: bool,
}

impl AsyncWrite for FileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.file).poll_shutdown(cx))?;

        if let Some(temp) = self.temp.take() {
            let persisted = if self.create_only {
                temp.persist_noclobber(&self.target)
            } else {
                temp.persist(&self.target)
            };
            persisted.map_err(io::Error::from)?;
        }
        Poll::Ready(Ok(()))
    }
}
