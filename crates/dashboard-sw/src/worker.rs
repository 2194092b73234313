//! The cache lifecycle manager: one worker generation and its event handlers.
//!
//! Events are delivered through [`CacheLifecycleManager::dispatch`], a table
//! keyed by event kind. Fetch events produce a response directly; every other
//! event registers its asynchronous work on an [`ExtendableEvent`] which is
//! settled (bounded by the termination timeout) before dispatch returns.
//! Handler errors and panics end up in [`EventOutcome::Failed`], never in the
//! caller's lap.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashboard_common::DashboardError;
use dashboard_net::{Fetcher, Request, Response};
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::background::{self, NoPendingOperations, PendingOperations, SyncTag};
use crate::cache::CacheStorage;
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::config::{InstallPolicy, Role, WorkerConfig};
use crate::control::{ControlMessage, ControlReply, PartitionStats, ReplyPort};
use crate::event::{EventKind, ExtendableEvent};
use crate::lifecycle::ServiceWorkerId;
use crate::notify::{NotificationId, NotificationOptions, Notifications, DISMISS_ACTION};
use crate::router::Router;
use crate::strategy::StrategyExecutor;
use crate::{now_millis, Result, ServiceWorkerError};

/// An event delivered to a worker generation.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message {
        message: ControlMessage,
        reply: Option<ReplyPort>,
    },
    Sync {
        tag: String,
    },
    Push {
        data: Option<String>,
    },
    NotificationClick {
        notification: NotificationId,
        action: Option<String>,
    },
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message { .. } => EventKind::Message,
            WorkerEvent::Sync { .. } => EventKind::Sync,
            WorkerEvent::Push { .. } => EventKind::Push,
            WorkerEvent::NotificationClick { .. } => EventKind::NotificationClick,
        }
    }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum EventOutcome {
    /// The event and all its extensions settled successfully.
    Completed,
    /// A fetch was answered by the worker.
    Response(Response),
    /// The request is not intercepted; the host fetches it itself.
    Passthrough(Request),
    /// A handler or one of its extensions failed.
    Failed(ServiceWorkerError),
}

impl EventOutcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            EventOutcome::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, EventOutcome::Completed)
    }
}

/// Everything a generation needs from its host.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    /// Origin root that manifest paths and notification URLs resolve against.
    pub scope: Url,
    pub fetcher: Arc<dyn Fetcher>,
    pub caches: CacheStorage,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<Notifications>>,
    pub pending: Arc<dyn PendingOperations>,
}

impl WorkerContext {
    /// Context with fresh storage, no clients and an empty operation queue.
    pub fn new(config: WorkerConfig, scope: Url, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            scope,
            fetcher,
            caches: CacheStorage::new(),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            pending: Arc::new(NoPendingOperations),
        }
    }

    pub fn with_caches(mut self, caches: CacheStorage) -> Self {
        self.caches = caches;
        self
    }

    pub fn with_pending_operations(mut self, pending: Arc<dyn PendingOperations>) -> Self {
        self.pending = pending;
        self
    }
}

/// One worker generation.
pub struct CacheLifecycleManager {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    scope: Url,
    router: Router,
    executor: StrategyExecutor,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<Notifications>>,
    pending: Arc<dyn PendingOperations>,
    skip_waiting: AtomicBool,
}

impl std::fmt::Debug for CacheLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLifecycleManager")
            .field("id", &self.id)
            .field("version", &self.config.version_tag)
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}

impl CacheLifecycleManager {
    /// Build a generation. Fails if the configuration is inconsistent.
    pub fn new(context: WorkerContext) -> Result<Self> {
        context.config.validate()?;
        context.caches.set_quota(context.config.storage_quota_bytes);

        let router = Router::from_config(&context.config);
        let executor = StrategyExecutor::new(context.fetcher, context.caches);

        Ok(Self {
            id: ServiceWorkerId::new(),
            config: Arc::new(context.config),
            scope: context.scope,
            router,
            executor,
            clients: context.clients,
            notifications: context.notifications,
            pending: context.pending,
            skip_waiting: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version_tag
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn executor(&self) -> &StrategyExecutor {
        &self.executor
    }

    pub fn caches(&self) -> &CacheStorage {
        self.executor.caches()
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    pub fn notifications(&self) -> &Arc<RwLock<Notifications>> {
        &self.notifications
    }

    /// Ask the host to promote this generation without waiting.
    pub fn skip_waiting(&self) {
        debug!(worker = %self.id, "skipWaiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    // ==================== Dispatch ====================

    /// Deliver one event.
    pub async fn dispatch(self: &Arc<Self>, event: WorkerEvent) -> EventOutcome {
        match event {
            WorkerEvent::Fetch(request) => self.dispatch_fetch(request).await,
            other => self.dispatch_extendable(other).await,
        }
    }

    async fn dispatch_fetch(&self, request: Request) -> EventOutcome {
        let fallback = request.clone();
        match AssertUnwindSafe(self.handle_fetch(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(worker = %self.id, url = %fallback.url, "Fetch handler panicked, passing through");
                EventOutcome::Passthrough(fallback)
            }
        }
    }

    async fn dispatch_extendable(self: &Arc<Self>, event: WorkerEvent) -> EventOutcome {
        let kind = event.kind();
        let extendable = ExtendableEvent::new(kind);

        let registered =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.handle(event, &extendable)));
        if registered.is_err() {
            let failure = DashboardError::internal(format!("{kind} handler panicked"));
            error!(
                worker = %self.id,
                event = %kind,
                category = failure.category(),
                "Event handler panicked"
            );
            return EventOutcome::Failed(failure.into());
        }

        match extendable.settle(self.config.termination_timeout()).await {
            Ok(()) => EventOutcome::Completed,
            Err(e) => {
                warn!(worker = %self.id, event = %kind, error = %e, "Event failed");
                EventOutcome::Failed(e)
            }
        }
    }

    fn handle(self: &Arc<Self>, event: WorkerEvent, extendable: &ExtendableEvent) {
        match event {
            WorkerEvent::Install => self.on_install(extendable),
            WorkerEvent::Activate => self.on_activate(extendable),
            WorkerEvent::Message { message, reply } => self.on_message(message, reply, extendable),
            WorkerEvent::Sync { tag } => self.on_sync(SyncTag::parse(&tag), extendable),
            WorkerEvent::Push { data } => self.on_push(data, extendable),
            WorkerEvent::NotificationClick {
                notification,
                action,
            } => self.on_notification_click(notification, action, extendable),
            WorkerEvent::Fetch(request) => {
                debug!(url = %request.url, "Fetch is not an extendable event");
            }
        }
    }

    // ==================== Fetch ====================

    #[instrument(level = "debug", skip(self, request), fields(url = %request.url))]
    async fn handle_fetch(&self, request: Request) -> EventOutcome {
        let Some(route) = self.router.classify(&request) else {
            return EventOutcome::Passthrough(request);
        };
        let partition = self.config.partition_name(route.role);
        EventOutcome::Response(self.executor.execute(request, &partition, route.strategy).await)
    }

    // ==================== Lifecycle ====================

    fn on_install(self: &Arc<Self>, event: &ExtendableEvent) {
        info!(worker = %self.id, version = %self.config.version_tag, "Installing");
        let this = Arc::clone(self);
        event.wait_until(async move { this.precache().await });

        if self.config.skip_waiting_on_install {
            self.skip_waiting();
        }
    }

    fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.config
            .static_assets
            .iter()
            .map(|path| {
                self.scope
                    .join(path)
                    .map_err(|e| ServiceWorkerError::InstallFailed(format!("{path}: {e}")))
            })
            .collect()
    }

    async fn precache(&self) -> Result<()> {
        let partition = self.config.partition_name(Role::Static);
        let urls = self.manifest_urls()?;

        match self.config.install_policy {
            InstallPolicy::Lenient => {
                self.caches().open(&partition).await;
                let results = join_all(
                    urls.iter()
                        .map(|url| self.executor.fetch_into(&partition, Request::get(url.clone()))),
                )
                .await;

                let mut cached = 0;
                for (url, result) in urls.iter().zip(results) {
                    match result {
                        Ok(()) => cached += 1,
                        Err(e) => warn!(url = %url, error = %e, "Precache skipped asset"),
                    }
                }
                info!(cached, total = urls.len(), partition = %partition, "Precache complete");
                Ok(())
            }
            InstallPolicy::Strict => {
                let requests: Vec<Request> = urls.into_iter().map(Request::get).collect();
                let results =
                    join_all(requests.iter().map(|r| self.executor.fetch_ok(r.clone()))).await;

                let mut fetched = Vec::with_capacity(requests.len());
                for (request, result) in requests.iter().zip(results) {
                    match result {
                        Ok(response) => fetched.push((request, response)),
                        Err(e) => {
                            return Err(ServiceWorkerError::InstallFailed(format!(
                                "{}: {e}",
                                request.url
                            )))
                        }
                    }
                }
                for (request, response) in &fetched {
                    self.caches().put(&partition, request, response).await?;
                }
                info!(cached = fetched.len(), partition = %partition, "Precache complete");
                Ok(())
            }
        }
    }

    fn on_activate(self: &Arc<Self>, event: &ExtendableEvent) {
        info!(worker = %self.id, version = %self.config.version_tag, "Activating");
        let this = Arc::clone(self);
        event.wait_until(async move {
            this.delete_stale_partitions().await;
            let claimed = this.clients.write().await.claim(this.id);
            debug!(worker = %this.id, claimed = claimed.len(), "Claimed clients");
            Ok(())
        });
    }

    /// Delete every partition that is not one of this generation's three.
    pub async fn delete_stale_partitions(&self) -> Vec<String> {
        let keep = self.config.partition_names();
        let mut deleted = Vec::new();
        for name in self.caches().keys().await {
            if keep.contains(&name) {
                continue;
            }
            if self.caches().delete(&name).await {
                info!(partition = %name, "Deleted stale partition");
                deleted.push(name);
            }
        }
        deleted
    }

    // ==================== Messages ====================

    fn on_message(
        self: &Arc<Self>,
        message: ControlMessage,
        reply: Option<ReplyPort>,
        event: &ExtendableEvent,
    ) {
        debug!(worker = %self.id, message = message.name(), "Control message");
        let post = |reply: Option<ReplyPort>, value: ControlReply| {
            if let Some(port) = reply {
                port.post(value);
            }
        };

        match message {
            ControlMessage::SkipWaiting => self.skip_waiting(),
            ControlMessage::GetVersion => post(
                reply,
                ControlReply::Version {
                    version: self.config.version_tag.clone(),
                    timestamp: now_millis(),
                },
            ),
            ControlMessage::ClearCache => {
                let this = Arc::clone(self);
                event.wait_until(async move {
                    let removed = this.caches().clear().await;
                    info!(removed, "Cleared all partitions");
                    post(reply, ControlReply::Success { success: true });
                    Ok(())
                });
            }
            ControlMessage::PreloadResources { payload } => {
                let this = Arc::clone(self);
                event.wait_until(async move {
                    this.preload(&payload.urls).await;
                    post(reply, ControlReply::Success { success: true });
                    Ok(())
                });
            }
            ControlMessage::GetCacheStats => {
                let this = Arc::clone(self);
                event.wait_until(async move {
                    let partitions = this.cache_stats().await;
                    post(reply, ControlReply::CacheStats { partitions });
                    Ok(())
                });
            }
        }
    }

    /// Fetch `urls` into the dynamic partition. Returns how many were stored.
    pub async fn preload(&self, urls: &[String]) -> usize {
        let partition = self.config.partition_name(Role::Dynamic);
        let partition = &partition;
        let results = join_all(urls.iter().map(|raw| async move {
            let url = self
                .scope
                .join(raw)
                .map_err(|e| ServiceWorkerError::Message(format!("{raw}: {e}")))?;
            self.executor.fetch_into(partition, Request::get(url)).await
        }))
        .await;

        let mut stored = 0;
        for (raw, result) in urls.iter().zip(results) {
            match result {
                Ok(()) => stored += 1,
                Err(e) => warn!(url = %raw, error = %e, "Preload failed"),
            }
        }
        info!(stored, total = urls.len(), "Preload settled");
        stored
    }

    /// Per-partition statistics joined with the owning role's policy.
    pub async fn cache_stats(&self) -> Vec<PartitionStats> {
        self.caches()
            .summaries()
            .await
            .into_iter()
            .map(|summary| {
                let policy = self
                    .config
                    .role_of(&summary.name)
                    .map(|role| self.config.partitions.get(role));
                PartitionStats {
                    max_entries: policy.map(|p| p.max_entries),
                    max_age_seconds: policy.map(|p| p.max_age_seconds),
                    name: summary.name,
                    entries: summary.entries,
                    bytes: summary.bytes,
                }
            })
            .collect()
    }

    // ==================== Background ====================

    fn on_sync(self: &Arc<Self>, tag: SyncTag, event: &ExtendableEvent) {
        info!(worker = %self.id, tag = %tag, "Sync event");
        let this = Arc::clone(self);
        match tag {
            SyncTag::BackgroundSync => event.wait_until(async move {
                background::replay_pending(this.pending.as_ref()).await.map(|_| ())
            }),
            SyncTag::CacheUpdate => event.wait_until(async move {
                let partition = this.config.partition_name(Role::Static);
                let assets = this.manifest_urls()?;
                background::refresh_assets(&this.executor, &partition, &assets).await;
                Ok(())
            }),
            SyncTag::Other(other) => debug!(tag = %other, "Ignoring unknown sync tag"),
        }
    }

    fn on_push(self: &Arc<Self>, data: Option<String>, event: &ExtendableEvent) {
        let this = Arc::clone(self);
        event.wait_until(async move {
            let config = &this.config.notifications;
            let options = NotificationOptions::for_push(config, data.as_deref(), now_millis());
            let id = this.notifications.write().await.show(&config.title, options);
            info!(notification = ?id, "Showing push notification");
            Ok(())
        });
    }

    fn on_notification_click(
        self: &Arc<Self>,
        notification: NotificationId,
        action: Option<String>,
        event: &ExtendableEvent,
    ) {
        let this = Arc::clone(self);
        event.wait_until(async move {
            let closed = this.notifications.write().await.close(notification);
            if closed.is_none() {
                debug!(notification = ?notification, "Clicked notification was already closed");
            }
            if action.as_deref() == Some(DISMISS_ACTION) {
                return Ok(());
            }
            this.focus_or_open().await
        });
    }

    /// Focus a window already showing the notification URL, or open one.
    async fn focus_or_open(&self) -> Result<()> {
        let target = self
            .scope
            .join(&self.config.notifications.default_url)
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;

        let mut clients = self.clients.write().await;
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        };
        let existing = clients
            .match_all(&options)
            .into_iter()
            .find(|client| client.url == target)
            .map(|client| client.id.clone());

        match existing {
            Some(id) => {
                clients.focus(&id)?;
                debug!(client = %id, "Focused existing window");
            }
            None => {
                let client = clients.open_window(target);
                debug!(client = %client.id, "Opened new window");
            }
        }
        Ok(())
    }
}
