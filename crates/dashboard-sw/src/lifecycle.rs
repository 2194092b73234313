//! Worker generations and their registration.
//!
//! ```text
//! Parsed → Installing → Installed → Activating → Activated
//!              │            │            │            │
//!              └────────────┴────────────┴────────────┴──► Redundant
//! ```
//!
//! No transition skips a state. A generation that fails to install becomes
//! redundant without ever touching the active slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting to take over.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, failed to install, or unregistered.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether `next` directly follows this state.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

// ==================== Service Worker ====================

/// One worker generation as seen by the host.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Version tag of the generation.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(id: ServiceWorkerId, version: &str) -> Self {
        Self {
            id,
            version: version.to_string(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Move to `next`, rejecting transitions that skip a state.
    pub fn transition(&mut self, next: ServiceWorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceWorkerError::State(format!(
                "{} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        debug!(worker = %self.id, from = %self.state, to = %next, "State change");
        self.state = next;
        self.state_changed_at = Instant::now();
        Ok(())
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    fn retire(&mut self) {
        if !self.is_redundant() {
            self.state = ServiceWorkerState::Redundant;
            self.state_changed_at = Instant::now();
        }
    }
}

// ==================== Registration ====================

/// Installing, waiting and active generations for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Generations that became redundant, oldest first.
    pub retired: Vec<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            retired: Vec::new(),
        }
    }

    /// The worker that controls pages, once fully activated.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|worker| worker.is_active())
    }

    fn retire(&mut self, mut worker: ServiceWorker) {
        worker.retire();
        self.retired.push(worker);
    }

    /// Start installing `worker`, replacing any generation still installing.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Result<()> {
        worker.transition(ServiceWorkerState::Installing)?;
        if let Some(previous) = self.installing.replace(worker) {
            self.retire(previous);
        }
        Ok(())
    }

    /// Transition installing to waiting. A generation already waiting is
    /// replaced.
    pub fn install_complete(&mut self) -> Result<ServiceWorkerId> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| ServiceWorkerError::State("no installing worker".to_string()))?;
        worker.transition(ServiceWorkerState::Installed)?;
        let id = worker.id;
        if let Some(previous) = self.waiting.replace(worker) {
            self.retire(previous);
        }
        Ok(id)
    }

    /// Discard the installing generation. The active one is untouched.
    pub fn install_failed(&mut self, error: &str) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        info!(worker = %worker.id, error, "Install failed, generation is redundant");
        worker.error = Some(error.to_string());
        let id = worker.id;
        self.retire(worker);
        Some(id)
    }

    /// Move the waiting generation into the active slot as `Activating`,
    /// retiring the previous active one.
    pub fn begin_activate(&mut self) -> Result<ServiceWorkerId> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::State("no waiting worker".to_string()))?;
        worker.transition(ServiceWorkerState::Activating)?;
        let id = worker.id;
        if let Some(previous) = self.active.replace(worker) {
            self.retire(previous);
        }
        Ok(id)
    }

    /// Finish activation of the active slot.
    pub fn activate_complete(&mut self) -> Result<ServiceWorkerId> {
        let worker = self
            .active
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::State("no active worker".to_string()))?;
        worker.transition(ServiceWorkerState::Activated)?;
        Ok(worker.id)
    }

    /// Unregister: every generation becomes redundant.
    pub fn unregister(&mut self) {
        for worker in [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
        {
            self.retire(worker);
        }
    }
}
