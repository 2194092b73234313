//! Extendable events.
//!
//! A handler registers every asynchronous operation it starts with
//! [`ExtendableEvent::wait_until`]; the host then settles the event, waiting
//! for all of them (bounded by the termination timeout) before treating the
//! event as finished. Extensions still running when the timeout fires are
//! cancelled, so a timed-out event leaves no work behind.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashboard_common::with_timeout;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::{Result, ServiceWorkerError};

/// Kinds of events delivered to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Sync,
    Push,
    NotificationClick,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::Install => "install",
            EventKind::Activate => "activate",
            EventKind::Fetch => "fetch",
            EventKind::Message => "message",
            EventKind::Sync => "sync",
            EventKind::Push => "push",
            EventKind::NotificationClick => "notificationclick",
        })
    }
}

/// An event whose lifetime can be extended by pending work.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: EventKind,
    tracker: TaskTracker,
    cancel: CancellationToken,
    rejected: Arc<AtomicUsize>,
}

impl ExtendableEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            rejected: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Number of extensions still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Keep the event alive until `future` settles. An error or a panic in
    /// `future` is logged and marks the event as rejected. A cancelled
    /// `future` is dropped at its next await point.
    pub fn wait_until<F>(&self, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let kind = self.kind;
        let rejected = Arc::clone(&self.rejected);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(event = %kind, "Event extension cancelled");
                    return;
                }
                outcome = AssertUnwindSafe(future).catch_unwind() => outcome,
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event = %kind, error = %e, "Event extension rejected");
                    rejected.fetch_add(1, Ordering::SeqCst);
                }
                Err(_) => {
                    error!(event = %kind, "Event extension panicked");
                    rejected.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    /// Wait for every extension to settle, up to `timeout`. On timeout the
    /// remaining extensions are cancelled and awaited before returning.
    pub async fn settle(self, timeout: Duration) -> Result<()> {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            debug!(event = %self.kind, pending, "Waiting for event extensions");
        }

        let tracker = self.tracker.clone();
        if let Err(e) = with_timeout(timeout, || async move { tracker.wait().await }).await {
            warn!(
                event = %self.kind,
                pending = self.tracker.len(),
                "Termination timeout reached, cancelling extensions"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
            return Err(e.into());
        }

        match self.rejected.load(Ordering::SeqCst) {
            0 => Ok(()),
            count => Err(ServiceWorkerError::Rejected {
                event: self.kind,
                count,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_settle_waits_for_extensions() {
        let event = ExtendableEvent::new(EventKind::Install);
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        event.wait_until(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        event.settle(Duration::from_secs(5)).await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rejected_extension_fails_event() {
        let event = ExtendableEvent::new(EventKind::Sync);
        event.wait_until(async { Ok(()) });
        event.wait_until(async { Err(ServiceWorkerError::Sync("server down".to_string())) });

        let result = event.settle(Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(ServiceWorkerError::Rejected {
                event: EventKind::Sync,
                count: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_panicking_extension_is_contained() {
        let event = ExtendableEvent::new(EventKind::Push);
        let explode = || -> Result<()> { panic!("handler bug") };
        event.wait_until(async move { explode() });

        let result = event.settle(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ServiceWorkerError::Rejected { count: 1, .. })));
    }

    #[tokio::test]
    async fn test_settle_times_out() {
        let event = ExtendableEvent::new(EventKind::Activate);
        event.wait_until(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let result = event.settle(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ServiceWorkerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timeout_cancels_outstanding_work() {
        let event = ExtendableEvent::new(EventKind::Install);
        let wrote = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&wrote);
        event.wait_until(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let result = event.settle(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ServiceWorkerError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!wrote.load(Ordering::SeqCst));
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::NotificationClick.to_string(), "notificationclick");
    }
}
