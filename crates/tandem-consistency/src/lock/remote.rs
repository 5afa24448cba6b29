//! Cluster-wide lock mirroring
//!
//! A remote lock is a request broadcast to every peer. Each peer takes an
//! exclusive mirror lock in its own queues and confirms once it holds it. On
//! unlock the peer first syncs the target's content, then drops the mirror
//! lock and confirms; a failed sync is reported instead and the mirror lock
//! stays in place. An unlock for a mirror that is still queued withdraws it
//! and confirms without touching content.

use std::collections::HashSet;

use serde_json::Value;
use tandem_common::{
    LOCK_EVENT, TandemError, TandemResult, UNLOCK_EVENT, remote, reply_event,
};
use tandem_core::{EventBus, Subscription};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    local::LocalLockManager,
    model::{LockConfirmation, LockErrorMessage, LockType, RemoteLockMessage},
};
use crate::sync::SyncProtocol;

const CONFIRMED: &str = "confirmed";
const ERROR: &str = "error";

#[derive(Clone)]
pub struct RemoteLockCoordinator {
    bus: EventBus,
    locks: LocalLockManager,
    sync: SyncProtocol,
}

impl RemoteLockCoordinator {
    pub fn new(bus: EventBus, locks: LocalLockManager, sync: SyncProtocol) -> Self {
        Self { bus, locks, sync }
    }

    fn node_id(&self) -> &str {
        self.bus.node_id()
    }

    /// Hold `target` on every peer
    pub async fn lock(&self, target: &str, request_id: &str) -> TandemResult<()> {
        let mut confirmations = self
            .bus
            .subscribe(&remote(&reply_event(LOCK_EVENT, request_id, CONFIRMED)))?;
        let peers = self.bus.peer_count();

        let message = RemoteLockMessage {
            target: target.to_string(),
            request_id: request_id.to_string(),
            token: None,
            node_id: self.node_id().to_string(),
        };
        self.bus
            .emit(&remote(LOCK_EVENT), serde_json::to_value(&message)?)
            .await?;
        debug!("Requested remote lock on {} for {} from {} peers", target, request_id, peers);

        self.await_confirmations(&mut confirmations, None, target, request_id, peers)
            .await?;
        info!("Remote lock on {} held for {}", target, request_id);
        Ok(())
    }

    /// Sync peers with the current content of `target` and release it everywhere
    pub async fn unlock(&self, target: &str, request_id: &str) -> TandemResult<()> {
        let token = self.sync.sync_token(target, request_id).await?;

        let mut confirmations = self
            .bus
            .subscribe(&remote(&reply_event(UNLOCK_EVENT, request_id, CONFIRMED)))?;
        let mut errors = self
            .bus
            .subscribe(&remote(&reply_event(UNLOCK_EVENT, request_id, ERROR)))?;
        let peers = self.bus.peer_count();

        let message = RemoteLockMessage {
            target: target.to_string(),
            request_id: request_id.to_string(),
            token: Some(token),
            node_id: self.node_id().to_string(),
        };
        self.bus
            .emit(&remote(UNLOCK_EVENT), serde_json::to_value(&message)?)
            .await?;

        self.await_confirmations(&mut confirmations, Some(&mut errors), target, request_id, peers)
            .await?;
        info!("Remote lock on {} released for {}", target, request_id);
        Ok(())
    }

    async fn await_confirmations(
        &self,
        confirmations: &mut Subscription,
        mut errors: Option<&mut Subscription>,
        target: &str,
        request_id: &str,
        peers: usize,
    ) -> TandemResult<()> {
        let mut confirmed: HashSet<String> = HashSet::new();

        while confirmed.len() < peers {
            tokio::select! {
                payload = confirmations.recv() => {
                    let payload = payload.ok_or_else(|| {
                        TandemError::TransportUnavailable("confirmation stream closed".to_string())
                    })?;
                    let confirmation: LockConfirmation = serde_json::from_value(payload)?;
                    if confirmation.request_id != request_id {
                        return Err(TandemError::TargetMismatch {
                            expected: request_id.to_string(),
                            actual: confirmation.request_id,
                        });
                    }
                    if confirmation.node_id != self.node_id() {
                        confirmed.insert(confirmation.node_id);
                    }
                }
                payload = next_error(&mut errors) => {
                    let failure: LockErrorMessage = serde_json::from_value(payload)?;
                    warn!(
                        "Node {} could not release {} for {}: {}",
                        failure.node_id, target, request_id, failure.error
                    );
                    return Err(TandemError::from_peer(&failure.kind, target, failure.error));
                }
            }
        }
        Ok(())
    }

    /// Serve lock and unlock requests from peers
    pub fn start(&self) -> TandemResult<Vec<JoinHandle<()>>> {
        let mut lock_requests = self.bus.subscribe(&remote(LOCK_EVENT))?;
        let mut unlock_requests = self.bus.subscribe(&remote(UNLOCK_EVENT))?;

        let coordinator = self.clone();
        let locks = tokio::spawn(async move {
            while let Some(payload) = lock_requests.recv().await {
                if let Some(message) = coordinator.peer_message(payload) {
                    coordinator.on_lock(message);
                }
            }
        });

        let coordinator = self.clone();
        let unlocks = tokio::spawn(async move {
            while let Some(payload) = unlock_requests.recv().await {
                if let Some(message) = coordinator.peer_message(payload) {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move { coordinator.on_unlock(message).await });
                }
            }
        });

        info!("Remote lock listeners started on node {}", self.node_id());
        Ok(vec![locks, unlocks])
    }

    /// Decode a request, dropping our own loopback
    fn peer_message(&self, payload: Value) -> Option<RemoteLockMessage> {
        match serde_json::from_value::<RemoteLockMessage>(payload) {
            Ok(message) if message.node_id == self.node_id() => None,
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Ignoring malformed remote lock message: {}", e);
                None
            }
        }
    }

    fn on_lock(&self, message: RemoteLockMessage) {
        // queued now so mirror locks keep arrival order
        let granted = self
            .locks
            .acquire(&message.target, &message.request_id, LockType::Write);
        let coordinator = self.clone();

        tokio::spawn(async move {
            if !granted.await {
                debug!(
                    "Mirror lock on {} for {} withdrawn before grant",
                    message.target, message.request_id
                );
                return;
            }
            coordinator
                .reply(LOCK_EVENT, &message.request_id, CONFIRMED, None)
                .await;
        });
    }

    async fn on_unlock(&self, message: RemoteLockMessage) {
        // a mirror that was never granted guards nothing here, so there is
        // nothing to take from the requester
        if !self.locks.is_held(&message.target, &message.request_id) {
            self.locks.release(&message.target, &message.request_id).await;
            debug!(
                "Withdrew pending mirror lock on {} for {} without sync",
                message.target, message.request_id
            );
            self.reply(UNLOCK_EVENT, &message.request_id, CONFIRMED, None)
                .await;
            return;
        }

        let result = match message.token.as_deref() {
            Some(token) => {
                self.sync
                    .sync(&message.target, &message.request_id, token)
                    .await
            }
            None => Err(TandemError::InvalidToken("unlock carries no token".to_string())),
        };

        match result {
            Ok(outcome) => {
                debug!(
                    "Synced {} for {} from node {}: {:?}",
                    message.target, message.request_id, message.node_id, outcome
                );
                self.locks.release(&message.target, &message.request_id).await;
                self.reply(UNLOCK_EVENT, &message.request_id, CONFIRMED, None)
                    .await;
            }
            Err(e) => {
                error!(
                    "Sync of {} for {} failed, keeping mirror lock: {}",
                    message.target, message.request_id, e
                );
                self.reply(UNLOCK_EVENT, &message.request_id, ERROR, Some(&e))
                    .await;
            }
        }
    }

    async fn reply(&self, kind: &str, request_id: &str, outcome: &str, failure: Option<&TandemError>) {
        let payload = match failure {
            None => serde_json::to_value(LockConfirmation {
                request_id: request_id.to_string(),
                node_id: self.node_id().to_string(),
            }),
            Some(e) => serde_json::to_value(LockErrorMessage {
                request_id: request_id.to_string(),
                node_id: self.node_id().to_string(),
                kind: e.kind().to_string(),
                error: e.to_string(),
            }),
        };
        let event = remote(&reply_event(kind, request_id, outcome));
        let sent = match payload {
            Ok(payload) => self.bus.emit(&event, payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!("Failed to send {}: {}", event, e);
        }
    }
}

async fn next_error(errors: &mut Option<&mut Subscription>) -> Value {
    match errors {
        Some(sub) => match sub.recv().await {
            Some(payload) => payload,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tandem_common::{StorageBackend, WriteOptions};
    use tandem_core::testing::{TestNode, test_cluster};

    fn coordinator(node: &TestNode) -> (RemoteLockCoordinator, LocalLockManager) {
        let locks = LocalLockManager::new();
        let sync = SyncProtocol::new(
            node.context.clone(),
            node.bus.clone(),
            Arc::new(node.storage.clone()),
        );
        let _ = sync.start_content_server().unwrap();
        (
            RemoteLockCoordinator::new(node.bus.clone(), locks.clone(), sync),
            locks,
        )
    }

    #[tokio::test]
    async fn test_lock_without_peers_resolves_immediately() {
        let (_hub, nodes) = test_cluster(1);
        let (remote_locks, _) = coordinator(&nodes[0]);
        remote_locks.start().unwrap();

        tokio::time::timeout(Duration::from_secs(1), remote_locks.lock("Package:foo", "r1"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_holds_mirror_lock_until_unlock() {
        let (_hub, nodes) = test_cluster(2);
        let (requester, requester_locks) = coordinator(&nodes[0]);
        let (peer, peer_locks) = coordinator(&nodes[1]);
        requester.start().unwrap();
        peer.start().unwrap();

        requester.lock("Package:foo", "r1").await.unwrap();
        assert!(peer_locks.is_held("Package:foo", "r1"));
        // the requester never mirrors its own request
        assert!(requester_locks.queue_snapshot("Package:foo").is_empty());

        nodes[0]
            .storage
            .write_bytes("foo/package.json", b"{\"v\":2}", WriteOptions::default())
            .await
            .unwrap();
        requester.unlock("Package:foo", "r1").await.unwrap();

        assert!(!peer_locks.is_held("Package:foo", "r1"));
        assert_eq!(
            nodes[1].storage.read_bytes("foo/package.json").await.unwrap(),
            Some(b"{\"v\":2}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_second_remote_lock_waits_for_first() {
        let (_hub, nodes) = test_cluster(3);
        let (a, _) = coordinator(&nodes[0]);
        let (b, _) = coordinator(&nodes[1]);
        let (c, _) = coordinator(&nodes[2]);
        for node in [&a, &b, &c] {
            node.start().unwrap();
        }

        a.lock("Package:foo", "from-a").await.unwrap();

        let b_task = {
            let b = b.clone();
            tokio::spawn(async move { b.lock("Package:foo", "from-b").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!b_task.is_finished());

        a.unlock("Package:foo", "from-a").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), b_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unlock_with_unreachable_transport() {
        let (hub, nodes) = test_cluster(2);
        let (a, _) = coordinator(&nodes[0]);
        hub.set_online(false);

        let result = a.unlock("Package:foo", "r1").await;
        assert!(matches!(result, Err(TandemError::TransportUnavailable(_))));
        let result = a.lock("Package:foo", "r1").await;
        assert!(matches!(result, Err(TandemError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failed_sync_reports_error_and_keeps_lock() {
        let (_hub, nodes) = test_cluster(2);
        let (requester, _) = coordinator(&nodes[0]);
        let (peer, peer_locks) = coordinator(&nodes[1]);
        peer.start().unwrap();

        requester.lock("Package:foo", "r1").await.unwrap();
        assert!(peer_locks.is_held("Package:foo", "r1"));

        // an unlock carrying a token for another request
        let forged = requester
            .sync
            .sync_token("Package:foo", "other")
            .await
            .unwrap();
        let mut errors = nodes[0]
            .bus
            .subscribe("remote:unlock:r1:error")
            .unwrap();
        nodes[0]
            .bus
            .emit(
                "remote:unlock",
                serde_json::json!({
                    "target": "Package:foo",
                    "requestId": "r1",
                    "token": forged,
                    "nodeId": "node-0",
                }),
            )
            .await
            .unwrap();

        let failure: LockErrorMessage =
            serde_json::from_value(errors.recv().await.unwrap()).unwrap();
        assert_eq!(failure.kind, "invalid_token");
        assert_eq!(failure.node_id, "node-1");
        assert!(peer_locks.is_held("Package:foo", "r1"));
    }

    #[tokio::test]
    async fn test_unlock_of_pending_mirror_withdraws_without_sync() {
        let (_hub, nodes) = test_cluster(2);
        let (requester, _) = coordinator(&nodes[0]);
        let (peer, peer_locks) = coordinator(&nodes[1]);
        requester.start().unwrap();
        peer.start().unwrap();

        nodes[0]
            .storage
            .write_bytes("foo/package.json", b"{\"v\":1}", WriteOptions::default())
            .await
            .unwrap();
        assert!(peer_locks.acquire("Package:foo", "local-write", LockType::Write).await);
        nodes[1]
            .storage
            .write_bytes("foo/package.json", b"{\"v\":2}", WriteOptions::default())
            .await
            .unwrap();

        // the peer is busy, so the requester gives up and cleans up
        let attempt =
            tokio::time::timeout(Duration::from_millis(100), requester.lock("Package:foo", "r2")).await;
        assert!(attempt.is_err());
        assert_eq!(peer_locks.queue_snapshot("Package:foo").len(), 2);

        tokio::time::timeout(Duration::from_secs(2), requester.unlock("Package:foo", "r2"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            nodes[1].storage.read_bytes("foo/package.json").await.unwrap(),
            Some(b"{\"v\":2}".to_vec())
        );
        let queue = peer_locks.queue_snapshot("Package:foo");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].request_id, "local-write");
        assert!(peer_locks.is_held("Package:foo", "local-write"));
    }

    #[tokio::test]
    async fn test_confirmation_for_other_request_is_a_mismatch() {
        let (_hub, nodes) = test_cluster(2);
        let (requester, _) = coordinator(&nodes[0]);

        let impostor = nodes[1].bus.clone();
        tokio::spawn(async move {
            let mut requests = impostor.subscribe("remote:lock").unwrap();
            if requests.recv().await.is_some() {
                impostor
                    .emit(
                        "remote:lock:r1:confirmed",
                        serde_json::json!({ "requestId": "r2", "nodeId": "node-1" }),
                    )
                    .await
                    .unwrap();
            }
        });
        tokio::task::yield_now().await;

        let result = requester.lock("Package:foo", "r1").await;
        assert!(matches!(result, Err(TandemError::TargetMismatch { .. })));
    }
}
