//! # Dashboard Service Worker
//!
//! Cache lifecycle manager for the Dashboard Pro progressive web app.
//!
//! ## Features
//!
//! - **Cache Registry**: `static`, `dynamic` and `api` partitions per generation
//! - **Lifecycle**: install (precache), activate (drop stale partitions, claim clients)
//! - **Routing**: ordered rules classify every request into exactly one partition
//! - **Strategies**: cache-first, network-first, stale-while-revalidate
//! - **Control Channel**: `SKIP_WAITING`, `GET_VERSION`, `CLEAR_CACHE`, `PRELOAD_RESOURCES`
//! - **Background**: sync replay, cache refresh, push notifications
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     └── ServiceWorkerRegistration
//!             ├── installing / waiting / active (ServiceWorker)
//!             └── CacheLifecycleManager (one per generation)
//!                     ├── Router ──────────► Route { role, strategy }
//!                     ├── StrategyExecutor ─► Fetcher + CacheStorage
//!                     ├── Clients
//!                     └── Notifications
//!
//! CacheStorage (shared by every generation)
//!     └── "<app>-<role>-<version>"
//!             └── Request → Response
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashboard_common::DashboardError;
use dashboard_net::NetError;
use thiserror::Error;

pub mod background;
pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod control;
pub mod event;
pub mod lifecycle;
pub mod notify;
pub mod router;
pub mod strategy;
pub mod worker;

pub use background::{
    NoPendingOperations, PendingOperation, PendingOperations, ReplayError, SyncReport, SyncTag,
};
pub use cache::{Cache, CacheEntry, CacheError, CacheStorage, CacheSummary};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{
    InstallPolicy, NotificationConfig, PartitionPolicy, Partitions, Role, StrategyKind,
    SyncConfig, WorkerConfig,
};
pub use container::{MessageTarget, ServiceWorkerContainer, ServiceWorkerEvent};
pub use control::{ControlMessage, ControlReply, MessageChannel, PartitionStats, ReplyPort};
pub use event::{EventKind, ExtendableEvent};
pub use lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
pub use notify::{Notification, NotificationAction, NotificationId, NotificationOptions, Notifications};
pub use router::{Route, RoutePredicate, Router, RoutingRule};
pub use strategy::{offline_response, StrategyExecutor, OFFLINE_MESSAGE};
pub use worker::{CacheLifecycleManager, EventOutcome, WorkerContext, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{event} event rejected by {count} extension(s)")]
    Rejected { event: EventKind, count: usize },

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Message error: {0}")]
    Message(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DashboardError> for ServiceWorkerError {
    fn from(error: DashboardError) -> Self {
        match error {
            DashboardError::Timeout(after) => Self::Timeout(after),
            DashboardError::NotFound(what) => Self::NotFound(what),
            DashboardError::Config { message, .. } => Self::Config(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<NetError> for ServiceWorkerError {
    fn from(error: NetError) -> Self {
        Self::Network(error.to_string())
    }
}

/// Result type for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

// ==================== Helpers ====================

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
