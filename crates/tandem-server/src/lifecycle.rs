//! Request lifecycle driver
//!
//! The host server announces each inbound request on the local bus and holds
//! it until the locks it needs are ready:
//!
//! | Event                      | Direction | Payload                          |
//! |----------------------------|-----------|----------------------------------|
//! | `request`                  | in        | `{id, method, url, headers}`     |
//! | `request:<id>:locks-ready` | out       | `{id, targets}`                  |
//! | `request:<id>:error`       | out       | `{id, kind, error}`              |
//! | `request:finish`           | in        | `{id, status?}`                  |
//! | `request:close`            | in        | `{id}`                           |
//! | `request:error`            | in        | `{id, error?}`                   |
//!
//! Any of the last three releases the request's locks; repeats are harmless.
//! An end event that arrives while the locks are still being prepared is
//! remembered, and the locks are released as soon as preparing finishes.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tandem_common::TandemResult;
use tandem_consistency::{LockService, OperationDescriptor};
use tandem_core::EventBus;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const REQUEST_EVENT: &str = "request";
pub const REQUEST_FINISH_EVENT: &str = "request:finish";
pub const REQUEST_CLOSE_EVENT: &str = "request:close";
pub const REQUEST_ERROR_EVENT: &str = "request:error";

pub fn locks_ready_event(id: &str) -> String {
    format!("request:{}:locks-ready", id)
}

pub fn request_failed_event(id: &str) -> String {
    format!("request:{}:error", id)
}

#[derive(Debug, Deserialize)]
struct RequestStarted {
    id: String,
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

impl RequestStarted {
    fn into_operation(self) -> OperationDescriptor {
        let mut op = OperationDescriptor::new(&self.id, &self.method, &self.url);
        op.headers = self
            .headers
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::String(s) => Some((name, s)),
                Value::Array(values) => Some((
                    name,
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                )),
                _ => None,
            })
            .collect();
        op
    }
}

#[derive(Debug, Deserialize)]
struct RequestEnded {
    id: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct RequestLifecycle {
    bus: EventBus,
    locks: Arc<LockService>,
    /// Requests whose locks are still being prepared, flagged once they end
    preparing: Arc<DashMap<String, bool>>,
}

impl RequestLifecycle {
    pub fn new(bus: EventBus, locks: Arc<LockService>) -> Self {
        Self {
            bus,
            locks,
            preparing: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to request events and drive their locks
    ///
    /// All request events are handled by one task so a request is always
    /// registered before an end event for it is looked at.
    pub fn start(&self) -> TandemResult<Vec<JoinHandle<()>>> {
        let mut requests = self.bus.subscribe(REQUEST_EVENT)?;
        let mut finished = self.bus.subscribe(REQUEST_FINISH_EVENT)?;
        let mut closed = self.bus.subscribe(REQUEST_CLOSE_EVENT)?;
        let mut failed = self.bus.subscribe(REQUEST_ERROR_EVENT)?;

        let lifecycle = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Some(payload) = requests.recv() => lifecycle.on_request(payload),
                    Some(payload) = finished.recv() => lifecycle.on_end(REQUEST_FINISH_EVENT, payload),
                    Some(payload) = closed.recv() => lifecycle.on_end(REQUEST_CLOSE_EVENT, payload),
                    Some(payload) = failed.recv() => lifecycle.on_end(REQUEST_ERROR_EVENT, payload),
                    else => break,
                }
            }
        });

        info!("Request lifecycle listener started on node {}", self.bus.node_id());
        Ok(vec![task])
    }

    fn on_request(&self, payload: Value) {
        match serde_json::from_value::<RequestStarted>(payload) {
            Ok(request) => {
                self.preparing.insert(request.id.clone(), false);
                let lifecycle = self.clone();
                tokio::spawn(async move { lifecycle.prepare(request).await });
            }
            Err(e) => warn!("Ignoring malformed request event: {}", e),
        }
    }

    async fn prepare(&self, request: RequestStarted) {
        let op = request.into_operation();
        debug!("Preparing locks for {} {} ({})", op.method, op.path, op.request_id);

        let prepared = self.locks.prepare(&op).await;
        let ended = self
            .preparing
            .remove(&op.request_id)
            .is_some_and(|(_, ended)| ended);
        if ended {
            debug!("Request {} ended while its locks were prepared", op.request_id);
            self.release(&op.request_id).await;
            return;
        }

        let (event, payload) = match prepared {
            Ok(targets) => (
                locks_ready_event(&op.request_id),
                json!({ "id": op.request_id, "targets": targets }),
            ),
            Err(e) => {
                error!("Failed to lock {} for {}: {}", op.path, op.request_id, e);
                (
                    request_failed_event(&op.request_id),
                    json!({ "id": op.request_id, "kind": e.kind(), "error": e.to_string() }),
                )
            }
        };
        if let Err(e) = self.bus.emit(&event, payload).await {
            warn!("Failed to send {}: {}", event, e);
        }
    }

    fn on_end(&self, event: &str, payload: Value) {
        let request: RequestEnded = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed {} event: {}", event, e);
                return;
            }
        };
        if let Some(error) = &request.error {
            warn!("Request {} failed: {}", request.id, error);
        }

        // still preparing: the prepare task releases once it is done
        if let Some(mut ended) = self.preparing.get_mut(&request.id) {
            *ended = true;
            return;
        }

        let lifecycle = self.clone();
        tokio::spawn(async move { lifecycle.release(&request.id).await });
    }

    async fn release(&self, request_id: &str) {
        match self.locks.release(request_id).await {
            Ok(()) => debug!("Locks of {} released", request_id),
            Err(e) => error!("Failed to release locks of {}: {}", request_id, e),
        }
    }
}
