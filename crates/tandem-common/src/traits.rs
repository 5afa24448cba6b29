//! Seams for pluggable collaborators
//!
//! Content storage and the cross-node transport are both supplied from the
//! outside; the rest of Tandem only ever talks to them through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TandemError, TandemResult};

/// Readable content stream handed out by a backend
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable content stream; the content is committed on `shutdown`
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fail with `AlreadyExists` instead of replacing existing content
    pub create_only: bool,
}

impl WriteOptions {
    pub fn create_only() -> Self {
        Self { create_only: true }
    }
}

/// Keys to set and keys to drop on one metadata record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub add: Map<String, Value>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub name: String,
    pub metadata: Map<String, Value>,
}

/// Content-storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name used in configuration
    fn name(&self) -> &'static str;

    /// Open `path` for reading; `NotFound` when nothing is stored there
    async fn read(&self, path: &str) -> TandemResult<ReadStream>;

    async fn write(&self, path: &str, options: WriteOptions) -> TandemResult<WriteStream>;

    /// Remove `path`; `NotFound` when nothing is stored there
    async fn remove(&self, path: &str) -> TandemResult<()>;

    /// Apply `patch` to the record `name`, creating it if needed.
    /// A record left with no keys is dropped.
    async fn patch_metadata(&self, name: &str, patch: MetadataPatch) -> TandemResult<()>;

    async fn list_metadata(&self) -> TandemResult<Vec<MetadataRecord>>;

    /// Whole content of `path`, `None` when absent
    async fn read_bytes(&self, path: &str) -> TandemResult<Option<Vec<u8>>> {
        let mut stream = match self.read(path).await {
            Ok(stream) => stream,
            Err(TandemError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(Some(buf))
    }

    async fn write_bytes(&self, path: &str, data: &[u8], options: WriteOptions) -> TandemResult<()> {
        let mut stream = self.write(path, options).await?;
        stream.write_all(data).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Callback a transport invokes for every message on a subscribed event
pub type TransportSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Cross-node message transport
///
/// Event names handed to a transport never carry the `remote:` prefix.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Route messages for `event` to `sink`, replacing any earlier sink
    fn subscribe(&self, event: &str, sink: TransportSink) -> TandemResult<()>;

    fn unsubscribe(&self, event: &str) -> TandemResult<()>;

    async fn emit(&self, event: &str, payload: Value) -> TandemResult<()>;

    /// Events this node is currently subscribed to
    fn subscriptions(&self) -> Vec<String>;

    /// Number of other nodes currently reachable
    fn peer_count(&self) -> usize;
}
