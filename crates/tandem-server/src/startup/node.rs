//! Node assembly
//!
//! Wires cluster identity, storage, the event bus and the lock stack together
//! from configuration.

use std::sync::Arc;

use tandem_common::{StorageBackend, TandemResult};
use tandem_consistency::{LocalLockManager, LockService, RemoteLockCoordinator, SyncProtocol};
use tandem_core::{ClusterContext, ClusterStorage, EventBus, TransportRegistry};
use tandem_persistence::PersistenceRegistry;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{config::Configuration, lifecycle::RequestLifecycle};

/// A running node and its background listeners
pub struct Node {
    pub context: Arc<ClusterContext>,
    pub bus: EventBus,
    pub storage: ClusterStorage,
    pub locks: Arc<LockService>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Load cluster keys as configured and start the node
    pub fn start(configuration: &Configuration) -> TandemResult<Self> {
        let context = ClusterContext::load(
            &configuration.cluster_private_key(),
            &configuration.cluster_public_key(),
        )?;
        Self::with_context(context, configuration)
    }

    /// Start a node around an existing cluster context
    pub fn with_context(context: ClusterContext, configuration: &Configuration) -> TandemResult<Self> {
        let mut context = context.with_spill_threshold(configuration.spill_threshold());
        if let Some(name) = configuration.node_name() {
            context = context.with_node_id(name);
        }
        if let Some(dir) = configuration.spill_dir() {
            context = context.with_spill_dir(dir);
        }
        let context = Arc::new(context);

        let (backend_name, backend_options) = configuration.persistence();
        let backend: Arc<dyn StorageBackend> =
            PersistenceRegistry::with_builtins().create(&backend_name, &backend_options)?;

        let (transport_name, transport_options) = configuration.events();
        let transport = TransportRegistry::with_builtins().create(
            &transport_name,
            context.node_id(),
            &transport_options,
        )?;
        let bus = EventBus::new(context.node_id(), transport);

        let mut tasks = Vec::new();

        let sync = SyncProtocol::new(context.clone(), bus.clone(), backend.clone())
            .with_fetch_timeout(configuration.sync_fetch_timeout());
        tasks.push(sync.start_content_server()?);

        let local_locks = LocalLockManager::new();
        let remote_locks = RemoteLockCoordinator::new(bus.clone(), local_locks.clone(), sync);
        tasks.extend(remote_locks.start()?);

        let locks = Arc::new(
            LockService::new(local_locks, remote_locks)
                .with_acquire_timeout(configuration.lock_acquire_timeout()),
        );
        tasks.extend(RequestLifecycle::new(bus.clone(), locks.clone()).start()?);

        info!(
            "Node {} started with '{}' storage over '{}' transport ({} peers)",
            context.node_id(),
            backend_name,
            transport_name,
            bus.peer_count()
        );

        Ok(Self {
            storage: ClusterStorage::new(backend, bus.clone()),
            context,
            bus,
            locks,
            tasks,
        })
    }

    pub fn node_id(&self) -> &str {
        self.context.node_id()
    }

    /// Stop all listeners
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("Node {} stopped", self.context.node_id());
    }
}
