//! Event federation bus
//!
//! Local publish/subscribe bridged to a `RemoteTransport`:
//! - `remote:X` names are cluster scope. The first local subscriber causes one
//!   transport subscription to `X`, the last one leaving tears it down.
//!   Emitting `remote:X` only goes to the transport.
//! - Other names are local scope. Emitting notifies local subscribers and
//!   mirrors the event to the transport as `local:X`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tandem_common::{
    LOCAL_MIRROR_PREFIX, REMOTE_PREFIX, RemoteTransport, TandemResult, TransportSink,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

struct BusInner {
    node_id: String,
    transport: Arc<dyn RemoteTransport>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    /// `remote:` events with a live transport subscription
    remote_links: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
}

/// Process-wide event registry; clones share the same registry
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(node_id: impl Into<String>, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                node_id: node_id.into(),
                transport,
                listeners: Mutex::new(HashMap::new()),
                remote_links: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.inner.transport
    }

    /// Other nodes reachable through the transport
    pub fn peer_count(&self) -> usize {
        self.inner.transport.peer_count()
    }

    /// Attach a listener to `event`
    ///
    /// Fails only when `event` is remote scope and the transport refuses the
    /// subscription.
    pub fn subscribe(&self, event: &str) -> TandemResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, tx });

        if let Some(remote) = event.strip_prefix(REMOTE_PREFIX)
            && let Err(e) = self.link_remote(event, remote)
        {
            self.inner.detach(event, id);
            return Err(e);
        }

        Ok(Subscription {
            inner: self.inner.clone(),
            event: event.to_string(),
            id,
            rx,
        })
    }

    fn link_remote(&self, event: &str, remote: &str) -> TandemResult<()> {
        let mut links = self.inner.remote_links.lock();
        if links.contains(event) {
            return Ok(());
        }

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let local_name = event.to_string();
        let sink: TransportSink = Arc::new(move |payload| {
            if let Some(inner) = weak.upgrade() {
                inner.notify(&local_name, payload);
            }
        });

        self.inner.transport.subscribe(remote, sink)?;
        links.insert(event.to_string());
        debug!("Linked '{}' to transport event '{}'", event, remote);
        Ok(())
    }

    /// Publish `payload` under `event`
    pub async fn emit(&self, event: &str, payload: Value) -> TandemResult<()> {
        if let Some(remote) = event.strip_prefix(REMOTE_PREFIX) {
            debug!("Emitting '{}' on transport", remote);
            return self.inner.transport.emit(remote, payload).await;
        }

        let delivered = self.inner.notify(event, payload.clone());
        debug!("Emitted '{}' to {} local listeners", event, delivered);

        let mirrored = format!("{}{}", LOCAL_MIRROR_PREFIX, event);
        if let Err(e) = self.inner.transport.emit(&mirrored, payload).await {
            warn!("Failed to mirror '{}' to transport: {}", event, e);
        }
        Ok(())
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// `remote:` events currently backed by a transport subscription
    pub fn remote_subscriptions(&self) -> Vec<String> {
        self.inner.remote_links.lock().iter().cloned().collect()
    }
}

impl BusInner {
    fn notify(&self, event: &str, payload: Value) -> usize {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(event) else {
            return 0;
        };
        list.retain(|l| l.tx.send(payload.clone()).is_ok());
        list.len()
    }

    fn detach(&self, event: &str, id: u64) {
        let emptied = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(event) {
                Some(list) => {
                    list.retain(|l| l.id != id);
                    if list.is_empty() {
                        listeners.remove(event);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        let Some(remote) = event.strip_prefix(REMOTE_PREFIX) else {
            return;
        };
        if !emptied {
            return;
        }

        let mut links = self.remote_links.lock();
        // a subscriber may have arrived since the list emptied
        if self.listeners.lock().contains_key(event) || !links.remove(event) {
            return;
        }
        if let Err(e) = self.transport.unsubscribe(remote) {
            warn!("Failed to unsubscribe '{}' from transport: {}", remote, e);
        } else {
            debug!("Unlinked '{}' from transport", event);
        }
    }
}

/// Live attachment to one event; dropping it detaches
pub struct Subscription {
    inner: Arc<BusInner>,
    event: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next payload published under this event
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.detach(&self.event, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
