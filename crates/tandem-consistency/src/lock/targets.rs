//! Lock targets implied by an inbound registry request

use std::sync::LazyLock;

use dashmap::DashMap;
use regex::Regex;

use super::model::{LockScope, LockTarget, LockType, OperationDescriptor, target_for};

const READ_METHODS: &[&str] = &["GET", "HEAD"];
const MUTATING_METHODS: &[&str] = &["PUT", "POST", "DELETE", "PATCH"];

const STATIC_PREFIXES: &[&str] = &["/-/static", "/-/verdaccio/logo"];

const USER_UPDATE_PREFIX: &str = "/-/user/org.couchdb.user:";

static PACKAGE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/-/package/|/package/readme/|/sidebar/|/)(@[^/]+/[^/]+|[^/]+)")
        .expect("Invalid package path pattern")
});

static RESERVED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/?(?:search/|(?:whoami|packages)$)").expect("Invalid reserved path pattern")
});

/// Package named by a request path, if any
pub fn package_name(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let path = path.replace("%2f", "/").replace("%2F", "/");

    if RESERVED_PATH.is_match(&path) {
        return None;
    }

    let name = PACKAGE_PATH.captures(&path)?.get(1)?.as_str();
    if name.starts_with('-') {
        return None;
    }
    Some(name.to_string())
}

fn is_static(path: &str) -> bool {
    path == "/" || STATIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Derives lock targets per request and remembers them until released
#[derive(Default)]
pub struct LockTargetResolver {
    bundles: DashMap<String, Vec<LockTarget>>,
}

impl LockTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets `op` has to hold, stored under its request id
    pub fn resolve(&self, op: &OperationDescriptor) -> Vec<LockTarget> {
        let targets = targets_for(op);
        self.bundles.insert(op.request_id.clone(), targets.clone());
        targets
    }

    pub fn for_request(&self, request_id: &str) -> Option<Vec<LockTarget>> {
        self.bundles.get(request_id).map(|b| b.value().clone())
    }

    pub fn forget(&self, request_id: &str) -> Option<Vec<LockTarget>> {
        self.bundles.remove(request_id).map(|(_, targets)| targets)
    }

    /// Put `targets` back under `request_id`, merging with anything still stored
    pub fn remember(&self, request_id: &str, targets: Vec<LockTarget>) {
        if targets.is_empty() {
            return;
        }
        self.bundles
            .entry(request_id.to_string())
            .or_default()
            .extend(targets);
    }

    pub fn pending_requests(&self) -> usize {
        self.bundles.len()
    }
}

fn targets_for(op: &OperationDescriptor) -> Vec<LockTarget> {
    let method = op.method.to_ascii_uppercase();
    let path = op.path.as_str();

    let local_and_remote = |target: String| {
        vec![
            LockTarget {
                target: target.clone(),
                scope: LockScope::Local,
                lock_type: LockType::Write,
                request_id: op.request_id.clone(),
            },
            LockTarget {
                target,
                scope: LockScope::Remote,
                lock_type: LockType::Write,
                request_id: op.request_id.clone(),
            },
        ]
    };

    if READ_METHODS.contains(&method.as_str()) {
        if is_static(path) {
            return Vec::new();
        }
        return package_name(path)
            .map(|name| {
                vec![LockTarget {
                    target: target_for::package(&name),
                    scope: LockScope::Local,
                    lock_type: LockType::Read,
                    request_id: op.request_id.clone(),
                }]
            })
            .unwrap_or_default();
    }

    if !MUTATING_METHODS.contains(&method.as_str()) {
        return Vec::new();
    }

    if method == "PUT"
        && let Some(user) = path.strip_prefix(USER_UPDATE_PREFIX)
    {
        let user = user.split(['?', '/']).next().unwrap_or_default();
        if user.is_empty() {
            return Vec::new();
        }
        return local_and_remote(target_for::authentication(user));
    }

    package_name(path)
        .map(|name| local_and_remote(target_for::package(&name)))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(method: &str, path: &str) -> Vec<LockTarget> {
        LockTargetResolver::new().resolve(&OperationDescriptor::new("req-1", method, path))
    }

    fn names(targets: &[LockTarget]) -> Vec<(String, LockScope, LockType)> {
        targets
            .iter()
            .map(|t| (t.target.clone(), t.scope, t.lock_type))
            .collect()
    }

    #[test]
    fn test_package_name_parsing() {
        assert_eq!(package_name("/foo"), Some("foo".to_string()));
        assert_eq!(package_name("/foo/1.0.0"), Some("foo".to_string()));
        assert_eq!(package_name("/foo/-/foo-1.0.0.tgz"), Some("foo".to_string()));
        assert_eq!(package_name("/@scope/pkg"), Some("@scope/pkg".to_string()));
        assert_eq!(package_name("/@scope%2fpkg"), Some("@scope/pkg".to_string()));
        assert_eq!(
            package_name("/-/package/@scope/pkg/dist-tags"),
            Some("@scope/pkg".to_string())
        );
        assert_eq!(package_name("/package/readme/foo"), Some("foo".to_string()));
        assert_eq!(package_name("/sidebar/@a/b"), Some("@a/b".to_string()));
        assert_eq!(package_name("/foo?write=true"), Some("foo".to_string()));
    }

    #[test]
    fn test_package_name_rejections() {
        assert_eq!(package_name("/-/all"), None);
        assert_eq!(package_name("/-/user/org.couchdb.user:bob"), None);
        assert_eq!(package_name("/search/foo"), None);
        assert_eq!(package_name("/whoami"), None);
        assert_eq!(package_name("/packages"), None);
        assert_eq!(package_name("/"), None);
    }

    #[test]
    fn test_read_gets_local_read_lock() {
        assert_eq!(
            names(&resolve("GET", "/foo")),
            vec![("Package:foo".to_string(), LockScope::Local, LockType::Read)]
        );
        assert_eq!(resolve("HEAD", "/@a/b").len(), 1);
    }

    #[test]
    fn test_static_and_unknown_routes() {
        assert!(resolve("GET", "/").is_empty());
        assert!(resolve("GET", "/-/static/main.js").is_empty());
        assert!(resolve("GET", "/-/verdaccio/logo").is_empty());
        assert!(resolve("GET", "/-/all").is_empty());
        assert!(resolve("OPTIONS", "/foo").is_empty());
        assert!(resolve("POST", "/-/v1/login").is_empty());
    }

    #[test]
    fn test_write_gets_local_and_remote() {
        assert_eq!(
            names(&resolve("PUT", "/foo")),
            vec![
                ("Package:foo".to_string(), LockScope::Local, LockType::Write),
                ("Package:foo".to_string(), LockScope::Remote, LockType::Write),
            ]
        );
        assert_eq!(resolve("DELETE", "/foo/-rev/3-abc").len(), 2);
    }

    #[test]
    fn test_user_update() {
        assert_eq!(
            names(&resolve("PUT", "/-/user/org.couchdb.user:alice")),
            vec![
                ("Authentication:alice".to_string(), LockScope::Local, LockType::Write),
                ("Authentication:alice".to_string(), LockScope::Remote, LockType::Write),
            ]
        );
    }

    #[test]
    fn test_bundle_lifecycle() {
        let resolver = LockTargetResolver::new();
        let op = OperationDescriptor::new("r9", "put", "/bar");
        let targets = resolver.resolve(&op);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.request_id == "r9"));

        assert_eq!(resolver.for_request("r9"), Some(targets.clone()));
        assert_eq!(resolver.forget("r9"), Some(targets));
        assert_eq!(resolver.for_request("r9"), None);
        assert_eq!(resolver.pending_requests(), 0);
    }

    #[test]
    fn test_remember_restores_bundle() {
        let resolver = LockTargetResolver::new();
        let targets = resolver.resolve(&OperationDescriptor::new("r1", "PUT", "/foo"));
        resolver.forget("r1");

        resolver.remember("r1", Vec::new());
        assert_eq!(resolver.pending_requests(), 0);

        let remote: Vec<LockTarget> = targets
            .into_iter()
            .filter(|t| t.scope == LockScope::Remote)
            .collect();
        resolver.remember("r1", remote.clone());
        assert_eq!(resolver.for_request("r1"), Some(remote));
    }
}
