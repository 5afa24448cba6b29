//! Content synchronisation on remote unlock
//!
//! The node releasing a remote lock signs the SHA-256 of the target's content.
//! Each peer compares it with its own copy and, when they differ, pulls the
//! content from the releasing node over the bus as an encrypted envelope.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use tandem_common::{
    CONTENT_REQUEST_EVENT, StorageBackend, TandemError, TandemResult, WriteOptions,
    crypto::{sha256_hex, sha256_hex_bytes},
    remote,
};
use tandem_core::{ClusterContext, EventBus, target_path};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifetime of sync tokens in seconds
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 300;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncClaims {
    /// Hex SHA-256 of the content, `None` when the target has no content
    pub sha256: Option<String>,
    pub target: String,
    pub request_id: String,
    /// Node holding the authoritative content
    pub node_id: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local content already matched
    Unchanged,
    /// Content fetched and stored
    Updated,
    /// Content removed to match the holder
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest {
    target: String,
    request_id: String,
    /// Node expected to answer
    node_id: String,
    reply_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentReply {
    exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    envelope: Option<String>,
    node_id: String,
}

fn reply_channel(request_id: &str, reply_to: &str) -> String {
    remote(&format!("content:{}:{}", request_id, reply_to))
}

#[derive(Clone)]
pub struct SyncProtocol {
    context: Arc<ClusterContext>,
    bus: EventBus,
    storage: Arc<dyn StorageBackend>,
    token_ttl_secs: i64,
    fetch_timeout: Duration,
}

impl SyncProtocol {
    pub fn new(
        context: Arc<ClusterContext>,
        bus: EventBus,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            context,
            bus,
            storage,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_token_ttl(mut self, secs: i64) -> Self {
        self.token_ttl_secs = secs;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Hash of the content guarded by `target`; `None` when there is none
    pub async fn content_hash(&self, target: &str) -> TandemResult<Option<String>> {
        match self.storage.read(&target_path(target)).await {
            Ok(mut stream) => Ok(Some(sha256_hex(&mut stream).await?)),
            Err(TandemError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Signed assertion of the current content of `target`
    pub async fn sync_token(&self, target: &str, request_id: &str) -> TandemResult<String> {
        let iat = chrono::Utc::now().timestamp();
        let claims = SyncClaims {
            sha256: self.content_hash(target).await?,
            target: target.to_string(),
            request_id: request_id.to_string(),
            node_id: self.context.node_id().to_string(),
            iat,
            exp: iat + self.token_ttl_secs,
        };
        self.context.sign(&claims)
    }

    /// Bring the local copy of `target` in line with `token`
    pub async fn sync(&self, target: &str, request_id: &str, token: &str) -> TandemResult<SyncOutcome> {
        let claims: SyncClaims = self.context.verify(token)?;
        if claims.target != target || claims.request_id != request_id {
            return Err(TandemError::InvalidToken(format!(
                "token is for {} / {}, not {} / {}",
                claims.target, claims.request_id, target, request_id
            )));
        }

        let local = self.content_hash(target).await?;
        if local == claims.sha256 {
            debug!("{} already in sync for {}", target, request_id);
            return Ok(SyncOutcome::Unchanged);
        }

        let Some(expected) = claims.sha256.as_deref() else {
            self.remove_local(target).await?;
            info!("Removed {} to match node {}", target, claims.node_id);
            return Ok(SyncOutcome::Removed);
        };

        let content = self.fetch(&claims).await?;
        let actual = sha256_hex_bytes(&content);
        if actual != expected {
            return Err(TandemError::SyncFailed {
                target: target.to_string(),
                reason: format!("fetched content hashes to {}, token says {}", actual, expected),
            });
        }

        self.storage
            .write_bytes(&target_path(target), &content, WriteOptions::default())
            .await?;
        info!(
            "Updated {} ({} bytes) from node {}",
            target,
            content.len(),
            claims.node_id
        );
        Ok(SyncOutcome::Updated)
    }

    async fn remove_local(&self, target: &str) -> TandemResult<()> {
        match self.storage.remove(&target_path(target)).await {
            Ok(()) | Err(TandemError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, claims: &SyncClaims) -> TandemResult<Vec<u8>> {
        let me = self.context.node_id();
        let mut replies = self
            .bus
            .subscribe(&reply_channel(&claims.request_id, me))?;

        let request = ContentRequest {
            target: claims.target.clone(),
            request_id: claims.request_id.clone(),
            node_id: claims.node_id.clone(),
            reply_to: me.to_string(),
        };
        self.bus
            .emit(&remote(CONTENT_REQUEST_EVENT), serde_json::to_value(&request)?)
            .await?;

        let payload = tokio::time::timeout(self.fetch_timeout, replies.recv())
            .await
            .map_err(|_| TandemError::Timeout {
                request_id: claims.request_id.clone(),
                after_ms: self.fetch_timeout.as_millis() as u64,
            })?
            .ok_or_else(|| TandemError::TransportUnavailable("reply channel closed".to_string()))?;
        let reply: ContentReply = serde_json::from_value(payload)?;

        let sync_failed = |reason: String| TandemError::SyncFailed {
            target: claims.target.clone(),
            reason,
        };
        if !reply.exists {
            return Err(sync_failed(format!(
                "node {} no longer has the content",
                reply.node_id
            )));
        }
        let envelope = reply
            .envelope
            .ok_or_else(|| sync_failed("reply carries no envelope".to_string()))?;
        let envelope = BASE64
            .decode(envelope)
            .map_err(|e| sync_failed(format!("malformed envelope: {}", e)))?;

        Ok(self.context.decipher().open(&envelope).await?)
    }

    /// Answer content requests addressed to this node
    pub fn start_content_server(&self) -> TandemResult<JoinHandle<()>> {
        let mut requests = self.bus.subscribe(&remote(CONTENT_REQUEST_EVENT))?;
        let server = self.clone();

        Ok(tokio::spawn(async move {
            while let Some(payload) = requests.recv().await {
                let request: ContentRequest = match serde_json::from_value(payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Ignoring malformed content request: {}", e);
                        continue;
                    }
                };
                if request.node_id != server.context.node_id() {
                    continue;
                }

                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.serve(&request).await {
                        warn!(
                            "Failed to serve {} to node {}: {}",
                            request.target, request.reply_to, e
                        );
                    }
                });
            }
        }))
    }

    async fn serve(&self, request: &ContentRequest) -> TandemResult<()> {
        let content = self
            .storage
            .read_bytes(&target_path(&request.target))
            .await?;
        let envelope = match &content {
            Some(bytes) => Some(BASE64.encode(self.context.cipher().seal(bytes).await?)),
            None => None,
        };
        debug!(
            "Serving {} to node {} ({} bytes)",
            request.target,
            request.reply_to,
            content.as_ref().map_or(0, Vec::len)
        );

        let reply = ContentReply {
            exists: content.is_some(),
            envelope,
            node_id: self.context.node_id().to_string(),
        };
        self.bus
            .emit(
                &reply_channel(&request.request_id, &request.reply_to),
                serde_json::to_value(&reply)?,
            )
            .await
    }
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("node_id", &self.context.node_id())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::testing::{TestNode, test_cluster};

    fn protocol(node: &TestNode) -> SyncProtocol {
        SyncProtocol::new(node.context.clone(), node.bus.clone(), Arc::new(node.storage.clone()))
            .with_fetch_timeout(Duration::from_secs(2))
    }

    async fn put(node: &TestNode, path: &str, data: &[u8]) {
        node.storage
            .write_bytes(path, data, WriteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_binds_target_and_request() {
        let (_hub, nodes) = test_cluster(1);
        let sync = protocol(&nodes[0]);
        let token = sync.sync_token("Package:foo", "req-1").await.unwrap();

        let wrong_target = sync.sync("Package:bar", "req-1", &token).await;
        assert!(matches!(wrong_target, Err(TandemError::InvalidToken(_))));

        let wrong_request = sync.sync("Package:foo", "req-2", &token).await;
        assert!(matches!(wrong_request, Err(TandemError::InvalidToken(_))));

        let garbage = sync.sync("Package:foo", "req-1", "not-a-token").await;
        assert!(matches!(garbage, Err(TandemError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_matching_hash_needs_no_transfer() {
        let (hub, nodes) = test_cluster(2);
        put(&nodes[0], "foo/package.json", b"{\"v\":1}").await;
        put(&nodes[1], "foo/package.json", b"{\"v\":1}").await;

        let token = protocol(&nodes[0])
            .sync_token("Package:foo", "req-1")
            .await
            .unwrap();

        // no content server is running and the hub is down: any fetch would fail
        hub.set_online(false);
        let outcome = protocol(&nodes[1])
            .sync("Package:foo", "req-1", &token)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_absent_on_both_sides_is_unchanged() {
        let (_hub, nodes) = test_cluster(2);
        let token = protocol(&nodes[0])
            .sync_token("Package:ghost", "req-1")
            .await
            .unwrap();
        let outcome = protocol(&nodes[1])
            .sync("Package:ghost", "req-1", &token)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_differing_content_is_fetched() {
        let (_hub, nodes) = test_cluster(2);
        let holder = protocol(&nodes[0]);
        let _server = holder.start_content_server().unwrap();

        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        put(&nodes[0], "foo/package.json", &content).await;
        put(&nodes[1], "foo/package.json", b"stale").await;

        let token = holder.sync_token("Package:foo", "req-7").await.unwrap();
        let outcome = protocol(&nodes[1])
            .sync("Package:foo", "req-7", &token)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(
            nodes[1].storage.read_bytes("foo/package.json").await.unwrap(),
            Some(content)
        );
    }

    #[tokio::test]
    async fn test_removed_content_is_removed() {
        let (_hub, nodes) = test_cluster(2);
        put(&nodes[1], "-/users/alice.json", b"{}").await;

        let token = protocol(&nodes[0])
            .sync_token("Authentication:alice", "req-3")
            .await
            .unwrap();
        let outcome = protocol(&nodes[1])
            .sync("Authentication:alice", "req-3", &token)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Removed);
        assert!(!nodes[1].storage.contains("-/users/alice.json"));
    }

    #[tokio::test]
    async fn test_fetch_times_out_without_holder() {
        let (_hub, nodes) = test_cluster(2);
        put(&nodes[0], "foo/package.json", b"new").await;
        let token = protocol(&nodes[0])
            .sync_token("Package:foo", "req-9")
            .await
            .unwrap();

        let fetcher = protocol(&nodes[1]).with_fetch_timeout(Duration::from_millis(50));
        let result = fetcher.sync("Package:foo", "req-9", &token).await;
        assert!(matches!(result, Err(TandemError::Timeout { .. })));
    }
}
