//! Multi-node lock and sync scenarios over an in-process hub

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tandem_common::TandemError;
use tandem_consistency::{
    LocalLockManager, LockService, LockType, OperationDescriptor, RemoteLockCoordinator,
    SyncProtocol,
};
use tandem_core::{
    ClusterStorage,
    testing::{TestNode, test_cluster},
};

struct Node {
    service: Arc<LockService>,
    storage: ClusterStorage,
}

fn start(node: &TestNode) -> Node {
    start_with_timeout(node, Duration::from_secs(5))
}

fn start_with_timeout(node: &TestNode, acquire_timeout: Duration) -> Node {
    let backend = Arc::new(node.storage.clone());
    let locks = LocalLockManager::new();
    let sync = SyncProtocol::new(node.context.clone(), node.bus.clone(), backend.clone());
    sync.start_content_server().unwrap();
    let remote = RemoteLockCoordinator::new(node.bus.clone(), locks.clone(), sync);
    remote.start().unwrap();

    Node {
        service: Arc::new(
            LockService::new(locks, remote).with_acquire_timeout(acquire_timeout),
        ),
        storage: ClusterStorage::new(backend, node.bus.clone()),
    }
}

#[tokio::test]
async fn test_write_is_replicated_on_release() {
    let (_hub, nodes) = test_cluster(3);
    let cluster: Vec<Node> = nodes.iter().map(start).collect();

    let op = OperationDescriptor::new("publish-1", "PUT", "/foo");
    cluster[0].service.prepare(&op).await.unwrap();
    for node in &cluster[1..] {
        assert!(node.service.local_locks().queued_targets().contains(&"Package:foo".to_string()));
    }

    let document = json!({ "name": "foo", "versions": { "1.0.0": {} } });
    cluster[0].storage.save_package("foo", &document).await.unwrap();
    cluster[0].service.release("publish-1").await.unwrap();

    for node in &cluster {
        assert_eq!(node.storage.read_package("foo").await.unwrap(), document);
        assert!(node.service.local_locks().queued_targets().is_empty());
    }
}

#[tokio::test]
async fn test_delete_is_replicated_on_release() {
    let (_hub, nodes) = test_cluster(2);
    let cluster: Vec<Node> = nodes.iter().map(start).collect();
    let document = json!({ "name": "foo" });

    let op = OperationDescriptor::new("publish", "PUT", "/foo");
    cluster[0].service.prepare(&op).await.unwrap();
    cluster[0].storage.save_package("foo", &document).await.unwrap();
    cluster[0].service.release("publish").await.unwrap();
    assert_eq!(cluster[1].storage.read_package("foo").await.unwrap(), document);

    let op = OperationDescriptor::new("unpublish", "DELETE", "/foo/-rev/1");
    cluster[0].service.prepare(&op).await.unwrap();
    cluster[0].storage.delete_package("foo").await.unwrap();
    cluster[0].service.release("unpublish").await.unwrap();

    assert!(matches!(
        cluster[1].storage.read_package("foo").await,
        Err(TandemError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_peer_read_waits_for_remote_write() {
    let (_hub, nodes) = test_cluster(2);
    let cluster: Vec<Node> = nodes.iter().map(start).collect();

    let op = OperationDescriptor::new("publish", "PUT", "/@scope/pkg");
    cluster[0].service.prepare(&op).await.unwrap();

    let reader = {
        let service = cluster[1].service.clone();
        tokio::spawn(async move {
            service
                .prepare(&OperationDescriptor::new("read", "GET", "/@scope%2fpkg"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());

    let document = json!({ "name": "@scope/pkg" });
    cluster[0].storage.save_package("@scope/pkg", &document).await.unwrap();
    cluster[0].service.release("publish").await.unwrap();

    let targets = reader.await.unwrap().unwrap();
    assert_eq!(targets[0].lock_type, LockType::Read);
    assert_eq!(
        cluster[1].storage.read_package("@scope/pkg").await.unwrap(),
        document
    );
    cluster[1].service.release("read").await.unwrap();
}

#[tokio::test]
async fn test_user_update_locks_authentication_target() {
    let (_hub, nodes) = test_cluster(2);
    let cluster: Vec<Node> = nodes.iter().map(start).collect();

    let op = OperationDescriptor::new("login", "PUT", "/-/user/org.couchdb.user:alice");
    let targets = cluster[0].service.prepare(&op).await.unwrap();
    assert!(targets.iter().all(|t| t.target == "Authentication:alice"));
    assert_eq!(
        cluster[1].service.local_locks().queued_targets(),
        vec!["Authentication:alice".to_string()]
    );

    cluster[0].service.release("login").await.unwrap();
    assert!(cluster[1].service.local_locks().queued_targets().is_empty());
}

#[tokio::test]
async fn test_timed_out_writer_leaves_peer_write_intact() {
    let (_hub, nodes) = test_cluster(2);
    let a = start_with_timeout(&nodes[0], Duration::from_millis(100));
    let b = start(&nodes[1]);

    let original = json!({ "name": "foo", "rev": "v1" });
    a.storage.save_package("foo", &original).await.unwrap();
    b.storage.save_package("foo", &original).await.unwrap();

    b.service
        .prepare(&OperationDescriptor::new("b-op", "PUT", "/foo"))
        .await
        .unwrap();
    let newer = json!({ "name": "foo", "rev": "v2-from-b" });
    b.storage.save_package("foo", &newer).await.unwrap();

    let result = a
        .service
        .prepare(&OperationDescriptor::new("a-op", "PUT", "/foo"))
        .await;
    assert!(matches!(result, Err(TandemError::Timeout { .. })));

    assert_eq!(b.storage.read_package("foo").await.unwrap(), newer);
    assert!(b.service.local_locks().is_held("Package:foo", "b-op"));
    let queue = b.service.local_locks().queue_snapshot("Package:foo");
    assert!(queue.iter().all(|e| e.request_id == "b-op"));

    b.service.release("b-op").await.unwrap();
    assert_eq!(a.storage.read_package("foo").await.unwrap(), newer);
    assert!(a.service.local_locks().queued_targets().is_empty());
}

#[tokio::test]
async fn test_publish_replicates_only_the_package_document() {
    use tokio::io::AsyncWriteExt;

    let (_hub, nodes) = test_cluster(2);
    let cluster: Vec<Node> = nodes.iter().map(start).collect();

    let op = OperationDescriptor::new("publish", "PUT", "/foo");
    cluster[0].service.prepare(&op).await.unwrap();
    let document = json!({ "name": "foo", "versions": { "1.0.0": {} } });
    cluster[0].storage.save_package("foo", &document).await.unwrap();
    let mut tarball = cluster[0]
        .storage
        .write_tarball("foo", "foo-1.0.0.tgz")
        .await
        .unwrap();
    tarball.write_all(b"tarball").await.unwrap();
    tarball.shutdown().await.unwrap();
    cluster[0].storage.add_package("foo").await.unwrap();
    cluster[0].service.release("publish").await.unwrap();

    let peer = &cluster[1].storage;
    assert_eq!(peer.read_package("foo").await.unwrap(), document);
    assert!(matches!(
        peer.read_tarball("foo", "foo-1.0.0.tgz").await,
        Err(TandemError::NotFound(_))
    ));
    assert!(peer.list_packages().await.unwrap().is_empty());
    assert_eq!(cluster[0].storage.list_packages().await.unwrap(), vec!["foo"]);
}
