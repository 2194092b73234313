//! Background sync handlers.
//!
//! `background-sync` replays operations queued by the page while offline;
//! `cache-update` re-fetches the static manifest. Neither retries on its own:
//! a failed sync event is retried by the host.

use async_trait::async_trait;
use dashboard_net::Request;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::strategy::StrategyExecutor;
use crate::{Result, ServiceWorkerError};

/// Tag of a sync event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTag {
    BackgroundSync,
    CacheUpdate,
    Other(String),
}

impl SyncTag {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "background-sync" => SyncTag::BackgroundSync,
            "cache-update" => SyncTag::CacheUpdate,
            other => SyncTag::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SyncTag::BackgroundSync => "background-sync",
            SyncTag::CacheUpdate => "cache-update",
            SyncTag::Other(tag) => tag,
        }
    }
}

impl std::fmt::Display for SyncTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation queued by the page while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub last_modified: u64,
}

/// Failure replaying one operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// This operation is skipped; the batch continues.
    #[error("Recoverable replay error: {0}")]
    Recoverable(String),

    /// The batch stops and the sync event fails.
    #[error("Fatal replay error: {0}")]
    Fatal(String),
}

/// Source of queued operations (the page's persistence layer).
#[async_trait]
pub trait PendingOperations: Send + Sync {
    /// Operations waiting to be replayed, oldest first.
    async fn pending(&self) -> std::result::Result<Vec<PendingOperation>, ReplayError>;

    /// Send one operation to the server.
    async fn replay(&self, operation: &PendingOperation) -> std::result::Result<(), ReplayError>;
}

/// Empty queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPendingOperations;

#[async_trait]
impl PendingOperations for NoPendingOperations {
    async fn pending(&self) -> std::result::Result<Vec<PendingOperation>, ReplayError> {
        Ok(Vec::new())
    }

    async fn replay(&self, _operation: &PendingOperation) -> std::result::Result<(), ReplayError> {
        Ok(())
    }
}

/// Outcome of a replay batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub replayed: usize,
    pub skipped: usize,
}

/// Replay queued operations one at a time, stopping at the first fatal error.
pub async fn replay_pending(operations: &dyn PendingOperations) -> Result<SyncReport> {
    let queue = operations
        .pending()
        .await
        .map_err(|e| ServiceWorkerError::Sync(e.to_string()))?;
    debug!(count = queue.len(), "Replaying pending operations");

    let mut report = SyncReport::default();
    for operation in &queue {
        match operations.replay(operation).await {
            Ok(()) => report.replayed += 1,
            Err(ReplayError::Recoverable(reason)) => {
                warn!(id = %operation.id, kind = %operation.kind, reason = %reason, "Skipping operation");
                report.skipped += 1;
            }
            Err(ReplayError::Fatal(reason)) => {
                warn!(
                    id = %operation.id,
                    replayed = report.replayed,
                    reason = %reason,
                    "Stopping replay batch"
                );
                return Err(ServiceWorkerError::Sync(format!(
                    "operation {} failed: {reason}",
                    operation.id
                )));
            }
        }
    }

    info!(replayed = report.replayed, skipped = report.skipped, "Background sync complete");
    Ok(report)
}

/// Re-fetch `assets` into `partition`, overwriting existing entries. Returns
/// how many were refreshed; failures are logged and skipped.
pub async fn refresh_assets(executor: &StrategyExecutor, partition: &str, assets: &[Url]) -> usize {
    let mut refreshed = 0;
    for asset in assets {
        match executor.fetch_into(partition, Request::get(asset.clone())).await {
            Ok(()) => refreshed += 1,
            Err(e) => warn!(url = %asset, error = %e, "Cache update skipped asset"),
        }
    }
    info!(refreshed, total = assets.len(), partition, "Cache update complete");
    refreshed
}
