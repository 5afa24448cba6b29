//! Lock data model

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tandem_common::{AUTHENTICATION_TARGET_PREFIX, PACKAGE_TARGET_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Held in this node's queues only
    Local,
    /// Mirrored on every peer
    Remote,
}

/// Queue entry as seen from the outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockQueueEntry {
    pub request_id: String,
    pub lock_type: LockType,
    pub state: EntryState,
}

/// One target an operation has to hold
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockTarget {
    pub target: String,
    pub scope: LockScope,
    pub lock_type: LockType,
    pub request_id: String,
}

/// Inbound operation to derive lock targets from
#[derive(Debug, Clone, Default)]
pub struct OperationDescriptor {
    pub request_id: String,
    pub method: String,
    /// Request path, query string included
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl OperationDescriptor {
    pub fn new(request_id: &str, method: &str, path: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
        }
    }
}

pub mod target_for {
    use super::*;

    pub fn package(name: &str) -> String {
        format!("{}{}", PACKAGE_TARGET_PREFIX, name)
    }

    pub fn authentication(user: &str) -> String {
        format!("{}{}", AUTHENTICATION_TARGET_PREFIX, user)
    }
}

// ============================================================================
// Wire payloads
// ============================================================================

/// `remote:lock` / `remote:unlock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLockMessage {
    pub target: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Node that issued the request
    pub node_id: String,
}

/// `remote:lock:<id>:confirmed` / `remote:unlock:<id>:confirmed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfirmation {
    pub request_id: String,
    /// Confirming peer
    pub node_id: String,
}

/// `remote:unlock:<id>:error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockErrorMessage {
    pub request_id: String,
    pub node_id: String,
    pub kind: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_names() {
        assert_eq!(target_for::package("@scope/pkg"), "Package:@scope/pkg");
        assert_eq!(target_for::authentication("alice"), "Authentication:alice");
    }

    #[test]
    fn test_remote_lock_message_wire_shape() {
        let msg = RemoteLockMessage {
            target: "Package:foo".to_string(),
            request_id: "r1".to_string(),
            token: None,
            node_id: "n1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({ "target": "Package:foo", "requestId": "r1", "nodeId": "n1" })
        );
    }
}
