//! Tandem Persistence - content-storage backends
//!
//! Backends implement `tandem_common::StorageBackend`:
//! - `memory`: process-local, used by tests and single-node setups
//! - `filesystem`: files below a root directory, with atomic replacement

pub mod filesystem;
pub mod memory;
pub mod metadata;
pub mod registry;

pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;
pub use registry::PersistenceRegistry;
