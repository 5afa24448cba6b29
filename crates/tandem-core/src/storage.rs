//! Storage facade
//!
//! Package-level operations over a `StorageBackend`. Each call is announced on
//! the bus as `<op>` and `<op>:start` (for example `write-tarball` and
//! `write-tarball:start`) and settled with `<op>:complete` or `<op>:error`.
//! All four carry the same `correlationId` next to the call's arguments.

use std::{future::Future, sync::Arc};

use serde_json::{Map, Value, json};
use tandem_common::{
    AUTHENTICATION_TARGET_PREFIX, PACKAGE_TARGET_PREFIX, ReadStream, StorageBackend, TandemError,
    TandemResult, WriteOptions, WriteStream,
};
use tandem_persistence::metadata::{added_patch, package_list, removed_patch};
use tracing::debug;

use crate::event_bus::EventBus;

/// Document of a package inside the storage
pub const PACKAGE_DOCUMENT: &str = "package.json";

pub fn package_path(name: &str) -> String {
    format!("{}/{}", name, PACKAGE_DOCUMENT)
}

pub fn user_path(user: &str) -> String {
    format!("-/users/{}.json", user)
}

/// Storage path holding the content guarded by `target`
pub fn target_path(target: &str) -> String {
    if let Some(name) = target.strip_prefix(PACKAGE_TARGET_PREFIX) {
        package_path(name)
    } else if let Some(user) = target.strip_prefix(AUTHENTICATION_TARGET_PREFIX) {
        user_path(user)
    } else {
        target.to_string()
    }
}

#[derive(Clone)]
pub struct ClusterStorage {
    backend: Arc<dyn StorageBackend>,
    bus: EventBus,
}

impl ClusterStorage {
    pub fn new(backend: Arc<dyn StorageBackend>, bus: EventBus) -> Self {
        Self { backend, bus }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ========================================================================
    // Package list
    // ========================================================================

    pub async fn add_package(&self, name: &str) -> TandemResult<()> {
        let patch = added_patch(chrono::Utc::now().timestamp_millis());
        self.observe("add-package", json!({ "package": name }), async {
            self.backend.patch_metadata(name, patch).await
        })
        .await
    }

    pub async fn remove_package(&self, name: &str) -> TandemResult<()> {
        self.observe("remove-package", json!({ "package": name }), async {
            self.backend.patch_metadata(name, removed_patch()).await
        })
        .await
    }

    /// Listed packages, oldest first
    pub async fn list_packages(&self) -> TandemResult<Vec<String>> {
        self.observe("list-packages", json!({}), async {
            Ok(package_list(self.backend.list_metadata().await?))
        })
        .await
    }

    // ========================================================================
    // Package documents
    // ========================================================================

    pub async fn read_package(&self, name: &str) -> TandemResult<Value> {
        let path = package_path(name);
        self.observe("read-package", json!({ "package": name, "filename": path }), async {
            let bytes = self
                .backend
                .read_bytes(&path)
                .await?
                .ok_or(TandemError::NotFound(path))?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .await
    }

    pub async fn save_package(&self, name: &str, document: &Value) -> TandemResult<()> {
        let path = package_path(name);
        self.observe("write-package", json!({ "package": name, "filename": path }), async {
            let bytes = serde_json::to_vec(document)?;
            self.backend
                .write_bytes(&path, &bytes, WriteOptions::default())
                .await
        })
        .await
    }

    /// Store the first document of a package; `AlreadyExists` if it has one
    pub async fn create_package(&self, name: &str, document: &Value) -> TandemResult<()> {
        self.observe("create-package", json!({ "package": name }), async {
            let bytes = serde_json::to_vec(document)?;
            self.backend
                .write_bytes(&package_path(name), &bytes, WriteOptions::create_only())
                .await
                .map_err(|e| match e {
                    TandemError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                        TandemError::AlreadyExists(name.to_string())
                    }
                    other => other,
                })
        })
        .await
    }

    pub async fn delete_package(&self, name: &str) -> TandemResult<()> {
        self.observe("delete-package", json!({ "package": name }), async {
            self.backend.remove(&package_path(name)).await
        })
        .await
    }

    // ========================================================================
    // Tarballs
    // ========================================================================

    pub async fn write_tarball(&self, name: &str, filename: &str) -> TandemResult<WriteStream> {
        self.observe(
            "write-tarball",
            json!({ "package": name, "filename": filename }),
            async {
                self.backend
                    .write(&format!("{}/{}", name, filename), WriteOptions::create_only())
                    .await
            },
        )
        .await
    }

    pub async fn read_tarball(&self, name: &str, filename: &str) -> TandemResult<ReadStream> {
        self.observe(
            "read-tarball",
            json!({ "package": name, "filename": filename }),
            async { self.backend.read(&format!("{}/{}", name, filename)).await },
        )
        .await
    }

    async fn observe<T, F>(&self, op: &str, args: Value, work: F) -> TandemResult<T>
    where
        F: Future<Output = TandemResult<T>>,
    {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let payload = |extra: Option<(&str, Value)>| {
            let mut payload = match &args {
                Value::Object(fields) => fields.clone(),
                _ => Map::new(),
            };
            payload.insert("correlationId".to_string(), json!(correlation_id));
            if let Some((key, value)) = extra {
                payload.insert(key.to_string(), value);
            }
            Value::Object(payload)
        };

        self.bus.emit(op, payload(None)).await?;
        self.bus
            .emit(&format!("{}:start", op), payload(None))
            .await?;

        let result = work.await;
        match &result {
            Ok(_) => {
                self.bus
                    .emit(&format!("{}:complete", op), payload(None))
                    .await?;
            }
            Err(e) => {
                debug!("Storage operation {} failed: {}", op, e);
                self.bus
                    .emit(
                        &format!("{}:error", op),
                        payload(Some(("error", json!(e.to_string())))),
                    )
                    .await?;
            }
        }
        result
    }
}
