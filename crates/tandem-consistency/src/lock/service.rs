//! Per-request lock bundles
//!
//! Resolves the targets of an operation, acquires all of them in parallel under
//! a deadline and releases them again once the operation is over.

use std::time::Duration;

use futures::future::try_join_all;
use tandem_common::{TandemError, TandemResult};
use tracing::{debug, info, warn};

use super::{
    local::LocalLockManager,
    model::{LockScope, LockTarget, OperationDescriptor},
    remote::RemoteLockCoordinator,
    targets::LockTargetResolver,
};

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(30_000);

pub struct LockService {
    resolver: LockTargetResolver,
    locks: LocalLockManager,
    remote: RemoteLockCoordinator,
    acquire_timeout: Duration,
}

impl LockService {
    pub fn new(locks: LocalLockManager, remote: RemoteLockCoordinator) -> Self {
        Self {
            resolver: LockTargetResolver::new(),
            locks,
            remote,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &LockTargetResolver {
        &self.resolver
    }

    pub fn local_locks(&self) -> &LocalLockManager {
        &self.locks
    }

    /// Hold every target `op` needs
    ///
    /// On failure or timeout whatever was queued is released again before the
    /// error is returned.
    pub async fn prepare(&self, op: &OperationDescriptor) -> TandemResult<Vec<LockTarget>> {
        let targets = self.resolver.resolve(op);
        if targets.is_empty() {
            self.resolver.forget(&op.request_id);
            return Ok(targets);
        }
        debug!("Acquiring {} lock targets for {}", targets.len(), op.request_id);

        let acquisitions = try_join_all(targets.iter().map(|t| self.acquire(t)));
        let failure = match tokio::time::timeout(self.acquire_timeout, acquisitions).await {
            Ok(Ok(_)) => {
                info!("Locks ready for {}", op.request_id);
                return Ok(targets);
            }
            Ok(Err(e)) => e,
            Err(_) => TandemError::Timeout {
                request_id: op.request_id.clone(),
                after_ms: self.acquire_timeout.as_millis() as u64,
            },
        };

        warn!("Could not lock targets for {}: {}", op.request_id, failure);
        if let Err(e) = self.release(&op.request_id).await {
            warn!("Cleanup after failed lock of {} also failed: {}", op.request_id, e);
        }
        Err(failure)
    }

    async fn acquire(&self, target: &LockTarget) -> TandemResult<()> {
        match target.scope {
            LockScope::Local => {
                let granted = self
                    .locks
                    .acquire(&target.target, &target.request_id, target.lock_type)
                    .await;
                if granted {
                    Ok(())
                } else {
                    Err(TandemError::NotFound(format!(
                        "lock on {} for {} was withdrawn",
                        target.target, target.request_id
                    )))
                }
            }
            LockScope::Remote => self.remote.lock(&target.target, &target.request_id).await,
        }
    }

    /// Release everything held for `request_id`
    ///
    /// Remote targets go first so peers sync while this node still excludes
    /// local writers. Releasing an unknown request does nothing. Remote targets
    /// that fail to release stay registered so the release can be retried.
    pub async fn release(&self, request_id: &str) -> TandemResult<()> {
        let Some(targets) = self.resolver.forget(request_id) else {
            return Ok(());
        };

        let mut failed = Vec::new();
        let mut first_error = None;
        for target in targets.iter().filter(|t| t.scope == LockScope::Remote) {
            let unlocked = tokio::time::timeout(
                self.acquire_timeout,
                self.remote.unlock(&target.target, request_id),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TandemError::Timeout {
                    request_id: request_id.to_string(),
                    after_ms: self.acquire_timeout.as_millis() as u64,
                })
            });
            if let Err(e) = unlocked {
                warn!("Remote release of {} for {} failed: {}", target.target, request_id, e);
                failed.push(target.clone());
                first_error.get_or_insert(e);
            }
        }

        for target in targets.iter().filter(|t| t.scope == LockScope::Local) {
            self.locks.release(&target.target, request_id).await;
        }

        match first_error {
            None => {
                debug!("Released all locks of {}", request_id);
                Ok(())
            }
            Some(e) => {
                self.resolver.remember(request_id, failed);
                Err(e)
            }
        }
    }
}
