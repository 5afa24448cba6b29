//! Tandem server - one node of a cooperatively locked registry cluster

pub mod config; // Configuration management
pub mod lifecycle; // Request lock lifecycle
pub mod startup; // Logging, node assembly and shutdown

pub use config::{Cli, Configuration};
pub use startup::Node;
