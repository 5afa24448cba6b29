//! Cluster-wide package locking
//!
//! This module provides:
//! - Lock data model and wire messages
//! - Local FIFO read/write queues
//! - Lock target resolution for registry requests
//! - Remote lock mirroring with sync on release
//! - Per-request acquire/release bundles

mod local;
mod model;
mod remote;
mod service;
mod targets;

pub use local::*;
pub use model::*;
pub use remote::*;
pub use service::*;
pub use targets::*;
