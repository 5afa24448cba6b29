//! Tandem Common - Shared types, traits, and the envelope codec
//!
//! This crate provides the foundations used across all Tandem components:
//! - Error taxonomy
//! - Streaming hybrid encryption and content hashing
//! - Storage backend and remote transport traits
//! - Event names shared on the wire

pub mod crypto;
pub mod error;
pub mod traits;

// Re-exports for convenience
pub use error::{TandemError, TandemResult};
pub use traits::*;

/// Prefix of cluster-scope event names
pub const REMOTE_PREFIX: &str = "remote:";

/// Prefix under which local events are mirrored to the transport
pub const LOCAL_MIRROR_PREFIX: &str = "local:";

/// Target prefixes
pub const PACKAGE_TARGET_PREFIX: &str = "Package:";
pub const AUTHENTICATION_TARGET_PREFIX: &str = "Authentication:";

/// Cluster lock protocol events (transport names, without `remote:`)
pub const LOCK_EVENT: &str = "lock";
pub const UNLOCK_EVENT: &str = "unlock";
pub const CONTENT_REQUEST_EVENT: &str = "content:request";

/// `lock:<requestId>:confirmed`, `unlock:<requestId>:error`, ...
pub fn reply_event(kind: &str, request_id: &str, outcome: &str) -> String {
    format!("{}:{}:{}", kind, request_id, outcome)
}

pub fn remote(event: &str) -> String {
    format!("{}{}", REMOTE_PREFIX, event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(reply_event(LOCK_EVENT, "r1", "confirmed"), "lock:r1:confirmed");
        assert_eq!(remote(UNLOCK_EVENT), "remote:unlock");
    }
}
