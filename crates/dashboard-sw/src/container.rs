//! Host side of the worker (`navigator.serviceWorker`).
//!
//! The container sequences generations through the registration, routes
//! page fetches to the controlling generation, delivers messages and
//! background events, and retries failed sync events with backoff.
//! Registration and activation jobs run one at a time; fetches and messages
//! are never blocked by a running install.

use std::sync::Arc;

use dashboard_common::{retry_with_backoff, OptionExt};
use dashboard_net::{Fetcher, Request, Response};
use hashbrown::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::background::{NoPendingOperations, PendingOperations};
use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::control::{ControlMessage, ControlReply, MessageChannel};
use crate::lifecycle::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};
use crate::notify::{Notification, NotificationId, Notifications};
use crate::worker::{CacheLifecycleManager, EventOutcome, WorkerContext, WorkerEvent};
use crate::{Result, ServiceWorkerError};

/// Events observed by the page.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A new generation started installing.
    UpdateFound { version: String },
    /// A generation changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A generation is installed and waiting behind the current controller.
    UpdateAvailable { version: String },
}

/// Which generation a message is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Active,
    Waiting,
}

#[derive(Debug)]
struct ContainerState {
    registration: ServiceWorkerRegistration,
    workers: HashMap<ServiceWorkerId, Arc<CacheLifecycleManager>>,
}

impl ContainerState {
    /// Drop managers of generations no longer in a registration slot.
    fn prune(&mut self) {
        let registration = &self.registration;
        let live: Vec<ServiceWorkerId> = [&registration.installing, &registration.waiting, &registration.active]
            .into_iter()
            .flatten()
            .map(|worker| worker.id)
            .collect();
        self.workers.retain(|id, _| live.contains(id));
    }
}

/// Service worker container for one scope.
pub struct ServiceWorkerContainer {
    scope: Url,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<Notifications>>,
    pending: Arc<dyn PendingOperations>,
    state: RwLock<ContainerState>,
    jobs: Mutex<()>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container for `scope`. Every generation fetches through
    /// `fetcher` and shares one cache storage.
    pub fn new(
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let container = Self {
            state: RwLock::new(ContainerState {
                registration: ServiceWorkerRegistration::new(scope.clone()),
                workers: HashMap::new(),
            }),
            scope,
            fetcher,
            caches: CacheStorage::new(),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            pending: Arc::new(NoPendingOperations),
            jobs: Mutex::new(()),
            event_tx,
        };
        (container, event_rx)
    }

    /// Use `pending` as the source of operations for background sync.
    pub fn with_pending_operations(mut self, pending: Arc<dyn PendingOperations>) -> Self {
        self.pending = pending;
        self
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        debug!(?event, "Container event");
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: ServiceWorkerId, version: &str, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker,
            version: version.to_string(),
            new_state,
        });
    }

    // ==================== Registration ====================

    /// Install a new generation built from `config`. It activates right away
    /// when nothing controls the scope or when it asked to skip waiting;
    /// otherwise it waits. A failed install leaves the current controller in
    /// place.
    pub async fn register(&self, config: WorkerConfig) -> Result<ServiceWorkerId> {
        let _job = self.jobs.lock().await;
        let version = config.version_tag.clone();

        let context = WorkerContext {
            config,
            scope: self.scope.clone(),
            fetcher: Arc::clone(&self.fetcher),
            caches: self.caches.clone(),
            clients: Arc::clone(&self.clients),
            notifications: Arc::clone(&self.notifications),
            pending: Arc::clone(&self.pending),
        };
        let manager = Arc::new(CacheLifecycleManager::new(context)?);
        let id = manager.id();

        {
            let mut state = self.state.write().await;
            state
                .registration
                .begin_install(ServiceWorker::new(id, &version))?;
            state.workers.insert(id, Arc::clone(&manager));
        }
        info!(worker = %id, version = %version, "Registering generation");
        self.emit(ServiceWorkerEvent::UpdateFound {
            version: version.clone(),
        });
        self.emit_state(id, &version, ServiceWorkerState::Installing);

        if let Err(e) = manager.dispatch(WorkerEvent::Install).await.into_result() {
            self.discard_partitions(&manager).await;
            let mut state = self.state.write().await;
            state.registration.install_failed(&e.to_string());
            state.prune();
            drop(state);
            warn!(worker = %id, error = %e, "Install failed");
            self.emit_state(id, &version, ServiceWorkerState::Redundant);
            return Err(ServiceWorkerError::InstallFailed(e.to_string()));
        }

        let has_controller = {
            let mut state = self.state.write().await;
            state.registration.install_complete()?;
            state.prune();
            state.registration.controller().is_some()
        };
        self.emit_state(id, &version, ServiceWorkerState::Installed);

        if !has_controller || manager.skip_waiting_requested() {
            self.activate_locked().await?;
        } else {
            info!(worker = %id, "Generation waiting for activation");
            self.emit(ServiceWorkerEvent::UpdateAvailable { version });
        }
        Ok(id)
    }

    /// Promote the waiting generation.
    pub async fn activate_waiting(&self) -> Result<ServiceWorkerId> {
        let _job = self.jobs.lock().await;
        self.activate_locked().await
    }

    async fn activate_locked(&self) -> Result<ServiceWorkerId> {
        let (id, manager, retired) = {
            let mut state = self.state.write().await;
            let retired = state.registration.active.as_ref().map(|w| (w.id, w.version.clone()));
            let id = state.registration.begin_activate()?;
            let manager = state
                .workers
                .get(&id)
                .cloned()
                .ok_or_not_found(format!("worker {id}"))?;
            state.prune();
            (id, manager, retired)
        };

        if let Some((old, old_version)) = retired {
            self.emit_state(old, &old_version, ServiceWorkerState::Redundant);
        }
        self.emit_state(id, manager.version(), ServiceWorkerState::Activating);

        if let EventOutcome::Failed(e) = manager.dispatch(WorkerEvent::Activate).await {
            warn!(worker = %id, error = %e, "Activate handler failed, activating anyway");
        }

        self.state.write().await.registration.activate_complete()?;
        info!(worker = %id, version = %manager.version(), "Generation activated");
        self.emit_state(id, manager.version(), ServiceWorkerState::Activated);

        let controlled: Vec<String> = self
            .clients
            .read()
            .await
            .match_all(&Default::default())
            .into_iter()
            .filter(|client| client.controller == Some(id))
            .map(|client| client.id.clone())
            .collect();
        for client_id in controlled {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: id,
            });
        }
        Ok(id)
    }

    /// Unregister every generation. Partitions are left alone.
    pub async fn unregister(&self) -> bool {
        let _job = self.jobs.lock().await;
        let mut state = self.state.write().await;
        let had_workers = !state.workers.is_empty();
        state.registration.unregister();
        state.workers.clear();
        had_workers
    }

    /// Delete what a failed generation wrote, sparing every partition the
    /// active generation also owns.
    async fn discard_partitions(&self, failed: &CacheLifecycleManager) {
        let active_owned = {
            let state = self.state.read().await;
            state
                .registration
                .active
                .as_ref()
                .and_then(|worker| state.workers.get(&worker.id))
                .map(|active| active.config().partition_names())
                .unwrap_or_default()
        };
        for name in failed.config().partition_names() {
            if !active_owned.contains(&name) && self.caches.delete(&name).await {
                debug!(worker = %failed.id(), partition = %name, "Discarded partition of failed install");
            }
        }
    }

    /// Read the registration.
    pub async fn registration<R>(&self, read: impl FnOnce(&ServiceWorkerRegistration) -> R) -> R {
        read(&self.state.read().await.registration)
    }

    /// The fully activated generation, if any.
    pub async fn controller(&self) -> Option<Arc<CacheLifecycleManager>> {
        let state = self.state.read().await;
        let active = state.registration.controller()?;
        state.workers.get(&active.id).cloned()
    }

    async fn require_controller(&self) -> Result<Arc<CacheLifecycleManager>> {
        Ok(self.controller().await.ok_or_not_found("controller")?)
    }

    async fn worker_for(&self, target: MessageTarget) -> Option<Arc<CacheLifecycleManager>> {
        let state = self.state.read().await;
        let worker = match target {
            MessageTarget::Active => state.registration.active.as_ref(),
            MessageTarget::Waiting => state.registration.waiting.as_ref(),
        }?;
        state.workers.get(&worker.id).cloned()
    }

    // ==================== Page API ====================

    /// A page loaded in scope. It is controlled by the current controller.
    pub async fn connect_client(&self, url: Url) -> Client {
        let mut client = Client::window(url);
        client.controller = self.controller().await.map(|m| m.id());
        self.clients.write().await.add(client.clone());
        client
    }

    /// Fetch on behalf of the page: through the controller when there is
    /// one, otherwise straight from the network.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let Some(manager) = self.controller().await else {
            return Ok(self.fetcher.fetch(request).await?);
        };

        let fallback = request.clone();
        match manager.dispatch(WorkerEvent::Fetch(request)).await {
            EventOutcome::Response(response) => Ok(response),
            EventOutcome::Passthrough(request) => Ok(self.fetcher.fetch(request).await?),
            other => {
                warn!(outcome = ?other, "Unexpected fetch outcome, going to network");
                Ok(self.fetcher.fetch(fallback).await?)
            }
        }
    }

    /// Post a control message and wait for the reply, if the message has one.
    /// `SKIP_WAITING` posted to the waiting generation promotes it.
    pub async fn post_message(
        &self,
        target: MessageTarget,
        message: ControlMessage,
    ) -> Result<Option<ControlReply>> {
        let manager = self
            .worker_for(target)
            .await
            .ok_or_not_found(format!("{target:?} worker"))?;

        let expects_reply = message != ControlMessage::SkipWaiting;
        let MessageChannel { port, reply } = MessageChannel::new();
        if let EventOutcome::Failed(e) = manager
            .dispatch(WorkerEvent::Message {
                message,
                reply: Some(port),
            })
            .await
        {
            warn!(worker = %manager.id(), error = %e, "Message handler failed");
        }

        if target == MessageTarget::Waiting && manager.skip_waiting_requested() {
            self.activate_waiting().await?;
        }

        if !expects_reply {
            return Ok(None);
        }
        reply
            .await
            .map(Some)
            .map_err(|_| ServiceWorkerError::Message("worker did not reply".to_string()))
    }

    /// Post a raw JSON message. Malformed and unknown messages are logged and
    /// ignored.
    pub async fn post_raw_message(&self, target: MessageTarget, json: &str) -> Result<Option<ControlReply>> {
        match ControlMessage::from_json(json) {
            Ok(message) => self.post_message(target, message).await,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed message");
                Ok(None)
            }
        }
    }

    // ==================== Background ====================

    /// Deliver a sync event, retrying with backoff while it fails.
    pub async fn sync(&self, tag: &str) -> Result<()> {
        let manager = self.require_controller().await?;
        let retry = manager.config().sync.retry_config();

        retry_with_backoff(&retry, || {
            let manager = Arc::clone(&manager);
            let tag = tag.to_string();
            async move { manager.dispatch(WorkerEvent::Sync { tag }).await.into_result() }
        })
        .await
    }

    /// Deliver a push message.
    pub async fn push(&self, data: Option<&str>) -> Result<()> {
        let manager = self.require_controller().await?;
        manager
            .dispatch(WorkerEvent::Push {
                data: data.map(str::to_string),
            })
            .await
            .into_result()
    }

    /// The user clicked a notification (or one of its actions).
    pub async fn click_notification(&self, notification: NotificationId, action: Option<&str>) -> Result<()> {
        let manager = self.require_controller().await?;
        manager
            .dispatch(WorkerEvent::NotificationClick {
                notification,
                action: action.map(str::to_string),
            })
            .await
            .into_result()
    }

    /// Notifications currently shown, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .open()
            .into_iter()
            .cloned()
            .collect()
    }
}
