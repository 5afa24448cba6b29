//! Tandem Core - event federation, cluster identity and storage facade
//!
//! This crate provides:
//! - `EventBus`: local publish/subscribe bridged to a remote transport
//! - In-process `MemoryHub` transport and the transport registry
//! - `ClusterContext`: node identity, token signing and stream encryption
//! - `ClusterStorage`: package-level storage operations announced on the bus

pub mod context;
pub mod event_bus;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use context::ClusterContext;
pub use event_bus::{EventBus, Subscription};
pub use storage::{ClusterStorage, target_path};
pub use transport::{MemoryHub, MemoryTransport, TransportRegistry};
