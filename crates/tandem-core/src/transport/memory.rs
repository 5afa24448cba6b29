//! In-process transport hub
//!
//! Several nodes living in one process share a `MemoryHub`. Delivery is
//! immediate and in emit order. Hubs can be looked up by name so nodes
//! assembled from configuration end up on the same hub.

use std::{
    collections::HashMap,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tandem_common::{RemoteTransport, TandemError, TandemResult, TransportSink};
use tracing::debug;

pub const MEMORY_TRANSPORT: &str = "memory";

static HUBS: LazyLock<DashMap<String, MemoryHub>> = LazyLock::new(DashMap::new);

struct HubInner {
    name: String,
    /// node id -> event -> sink
    nodes: RwLock<HashMap<String, HashMap<String, TransportSink>>>,
    online: AtomicBool,
    loopback: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// A private hub; loopback enabled
    pub fn new() -> Self {
        Self::with_name("anonymous")
    }

    fn with_name(name: &str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                name: name.to_string(),
                nodes: RwLock::new(HashMap::new()),
                online: AtomicBool::new(true),
                loopback: AtomicBool::new(true),
            }),
        }
    }

    /// The process-wide hub called `name`, created on first use
    pub fn named(name: &str) -> Self {
        HUBS.entry(name.to_string())
            .or_insert_with(|| Self::with_name(name))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Join the hub as `node_id`; the node leaves when the transport drops
    pub fn connect(&self, node_id: &str) -> MemoryTransport {
        self.inner
            .nodes
            .write()
            .entry(node_id.to_string())
            .or_default();
        debug!("Node {} joined hub '{}'", node_id, self.inner.name);
        MemoryTransport {
            hub: self.clone(),
            node_id: node_id.to_string(),
        }
    }

    /// Take the hub offline: every subscribe and emit fails until restored
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Whether a node receives its own emits
    pub fn set_loopback(&self, loopback: bool) {
        self.inner.loopback.store(loopback, Ordering::SeqCst);
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    fn ensure_online(&self) -> TandemResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TandemError::TransportUnavailable(format!(
                "memory hub '{}' is offline",
                self.inner.name
            )))
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's handle on a `MemoryHub`
pub struct MemoryTransport {
    hub: MemoryHub,
    node_id: String,
}

impl MemoryTransport {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        MEMORY_TRANSPORT
    }

    fn subscribe(&self, event: &str, sink: TransportSink) -> TandemResult<()> {
        self.hub.ensure_online()?;
        self.hub
            .inner
            .nodes
            .write()
            .entry(self.node_id.clone())
            .or_default()
            .insert(event.to_string(), sink);
        Ok(())
    }

    fn unsubscribe(&self, event: &str) -> TandemResult<()> {
        if let Some(events) = self.hub.inner.nodes.write().get_mut(&self.node_id) {
            events.remove(event);
        }
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> TandemResult<()> {
        self.hub.ensure_online()?;
        let loopback = self.hub.inner.loopback.load(Ordering::SeqCst);

        let sinks: Vec<TransportSink> = self
            .hub
            .inner
            .nodes
            .read()
            .iter()
            .filter(|(node, _)| loopback || **node != self.node_id)
            .filter_map(|(_, events)| events.get(event).cloned())
            .collect();

        for sink in sinks {
            sink(payload.clone());
        }
        Ok(())
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .hub
            .inner
            .nodes
            .read()
            .get(&self.node_id)
            .map(|events| events.keys().cloned().collect())
            .unwrap_or_default();
        events.sort();
        events
    }

    fn peer_count(&self) -> usize {
        self.hub.node_count().saturating_sub(1)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.inner.nodes.write().remove(&self.node_id);
        debug!("Node {} left hub '{}'", self.node_id, self.hub.inner.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (TransportSink, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: TransportSink = Arc::new(move |v| captured.lock().push(v));
        (sink, seen)
    }

    #[tokio::test]
    async fn test_delivery_between_nodes() {
        let hub = MemoryHub::new();
        let a = hub.connect("a");
        let b = hub.connect("b");
        let (sink, seen) = recorder();
        b.subscribe("lock", sink).unwrap();

        a.emit("lock", Value::from(1)).await.unwrap();
        a.emit("unlock", Value::from(2)).await.unwrap();
        assert_eq!(*seen.lock(), vec![Value::from(1)]);
        assert_eq!(a.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_loopback_toggle() {
        let hub = MemoryHub::new();
        let a = hub.connect("a");
        let (sink, seen) = recorder();
        a.subscribe("x", sink).unwrap();

        a.emit("x", Value::Null).await.unwrap();
        hub.set_loopback(false);
        a.emit("x", Value::Null).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_leaves_hub() {
        let hub = MemoryHub::new();
        let a = hub.connect("a");
        {
            let _b = hub.connect("b");
            assert_eq!(a.peer_count(), 1);
        }
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn test_named_hubs_are_shared() {
        let first = MemoryHub::named("shared-test-hub");
        let second = MemoryHub::named("shared-test-hub");
        let _a = first.connect("a");
        assert_eq!(second.node_count(), 1);
        assert_eq!(second.name(), "shared-test-hub");
    }

    #[tokio::test]
    async fn test_offline_hub_rejects() {
        let hub = MemoryHub::new();
        let a = hub.connect("a");
        hub.set_online(false);
        let (sink, _) = recorder();
        assert!(matches!(
            a.subscribe("x", sink),
            Err(TandemError::TransportUnavailable(_))
        ));
        assert!(a.emit("x", Value::Null).await.is_err());
    }
}
