//! Remote transports and their registry

pub mod memory;

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tandem_common::{RemoteTransport, TandemError, TandemResult};
use tracing::info;

pub use memory::{MEMORY_TRANSPORT, MemoryHub, MemoryTransport};

/// Hub joined by the `memory` transport when none is configured
pub const DEFAULT_HUB: &str = "default";

/// Builds a transport for `node_id` from its configuration section
pub type TransportConstructor = fn(&str, &Value) -> TandemResult<Arc<dyn RemoteTransport>>;

/// Static registry of transports keyed by configuration name
pub struct TransportRegistry {
    constructors: BTreeMap<&'static str, TransportConstructor>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY_TRANSPORT, |node_id, options| {
            let hub = MemoryHub::named(
                options
                    .get("hub")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_HUB),
            );
            if let Some(loopback) = options.get("loopback").and_then(Value::as_bool) {
                hub.set_loopback(loopback);
            }
            Ok(Arc::new(hub.connect(node_id)))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: TransportConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn create(
        &self,
        name: &str,
        node_id: &str,
        options: &Value,
    ) -> TandemResult<Arc<dyn RemoteTransport>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            TandemError::Config(format!(
                "unknown event transport '{}', expected one of {:?}",
                name,
                self.names()
            ))
        })?;
        let transport = constructor(node_id, options)?;
        info!("Event transport '{}' initialized for node {}", name, node_id);
        Ok(transport)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
