//! In-memory storage backend

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::{Map, Value};
use tandem_common::{
    MetadataPatch, MetadataRecord, ReadStream, StorageBackend, TandemError, TandemResult,
    WriteOptions, WriteStream,
};
use tokio::io::AsyncWrite;

use crate::metadata::apply_patch;

pub const MEMORY_BACKEND: &str = "memory";

/// Storage kept entirely in process memory
///
/// Clones share the same content.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    files: Arc<DashMap<String, Arc<Vec<u8>>>>,
    metadata: Arc<DashMap<String, Map<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        MEMORY_BACKEND
    }

    async fn read(&self, path: &str) -> TandemResult<ReadStream> {
        let data = self
            .files
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TandemError::NotFound(path.to_string()))?;
        Ok(Box::new(io::Cursor::new(SharedBytes(data))))
    }

    async fn write(&self, path: &str, options: WriteOptions) -> TandemResult<WriteStream> {
        if options.create_only && self.files.contains_key(path) {
            return Err(TandemError::AlreadyExists(path.to_string()));
        }
        Ok(Box::new(MemoryWriter {
            files: self.files.clone(),
            path: path.to_string(),
            create_only: options.create_only,
            buf: Vec::new(),
            committed: false,
        }))
    }

    async fn remove(&self, path: &str) -> TandemResult<()> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TandemError::NotFound(path.to_string()))
    }

    async fn patch_metadata(&self, name: &str, patch: MetadataPatch) -> TandemResult<()> {
        let mut record = self
            .metadata
            .get(name)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        if apply_patch(&mut record, patch) {
            self.metadata.remove(name);
        } else {
            self.metadata.insert(name.to_string(), record);
        }
        Ok(())
    }

    async fn list_metadata(&self) -> TandemResult<Vec<MetadataRecord>> {
        let mut records: Vec<MetadataRecord> = self
            .metadata
            .iter()
            .map(|entry| MetadataRecord {
                name: entry.key().clone(),
                metadata: entry.value().clone(),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Buffers writes and publishes the content on shutdown
struct MemoryWriter {
    files: Arc<DashMap<String, Arc<Vec<u8>>>>,
    path: String,
    create_only: bool,
    buf: Vec<u8>,
    committed: bool,
}

impl MemoryWriter {
    fn commit(&mut self) -> io::Result<()> {
        let data = Arc::new(std::mem::take(&mut self.buf));
        match self.files.entry(self.path.clone()) {
            Entry::Occupied(_) if self.create_only => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("'{}' already exists", self.path),
            )),
            Entry::Occupied(mut occupied) => {
                occupied.insert(data);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(data);
                Ok(())
            }
        }
    }
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.committed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.committed {
            return Poll::Ready(Ok(()));
        }
        self.committed = true;
        Poll::Ready(self.commit())
    }
}
