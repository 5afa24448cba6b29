//! Fixtures for tests: a fixed cluster key pair and in-process clusters

use std::sync::Arc;

use tandem_persistence::MemoryBackend;

use crate::{context::ClusterContext, event_bus::EventBus, transport::MemoryHub};

pub const TEST_PRIVATE_KEY_PEM: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../testdata/cluster-private.pem"
));

pub const TEST_PUBLIC_KEY_PEM: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../testdata/cluster-public.pem"
));

/// Context on the test key pair with a fixed node id
pub fn test_context(node_id: &str) -> ClusterContext {
    match ClusterContext::from_pem(TEST_PRIVATE_KEY_PEM, TEST_PUBLIC_KEY_PEM) {
        Ok(context) => context.with_node_id(node_id),
        Err(e) => panic!("test keys are invalid: {}", e),
    }
}

/// Bus on a private hub with no peers
pub fn test_bus(node_id: &str) -> EventBus {
    let hub = MemoryHub::new();
    EventBus::new(node_id, Arc::new(hub.connect(node_id)))
}

/// One node of an in-process cluster
#[derive(Clone)]
pub struct TestNode {
    pub context: Arc<ClusterContext>,
    pub bus: EventBus,
    pub storage: MemoryBackend,
}

impl TestNode {
    pub fn node_id(&self) -> &str {
        self.context.node_id()
    }
}

/// `size` nodes named `node-0..` sharing a fresh hub
pub fn test_cluster(size: usize) -> (MemoryHub, Vec<TestNode>) {
    let hub = MemoryHub::new();
    let nodes = (0..size)
        .map(|i| {
            let node_id = format!("node-{}", i);
            TestNode {
                context: Arc::new(test_context(&node_id)),
                bus: EventBus::new(node_id.clone(), Arc::new(hub.connect(&node_id))),
                storage: MemoryBackend::new(),
            }
        })
        .collect();
    (hub, nodes)
}
