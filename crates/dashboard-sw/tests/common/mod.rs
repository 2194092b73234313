//! Shared harness for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use dashboard_net::{Request, StubFetcher};
use dashboard_sw::{ServiceWorkerContainer, ServiceWorkerEvent, WorkerConfig};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const ORIGIN: &str = "http://localhost:3000/";

pub struct Harness {
    pub origin: Arc<StubFetcher>,
    pub container: ServiceWorkerContainer,
    pub events: UnboundedReceiver<ServiceWorkerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let scope = Url::parse(ORIGIN).unwrap();
        let origin = Arc::new(StubFetcher::new(scope.clone()));
        let (container, events) = ServiceWorkerContainer::new(scope, origin.clone());
        Self {
            origin,
            container,
            events,
        }
    }

    pub fn request(&self, path: &str) -> Request {
        Request::parse(&self.origin.resolve(path).unwrap()).unwrap()
    }

    pub fn key(&self, path: &str) -> String {
        self.origin.resolve(path).unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Default configuration with a two-entry manifest.
pub fn small_config() -> WorkerConfig {
    WorkerConfig {
        static_assets: vec!["/".to_string(), "/app.js".to_string()],
        ..Default::default()
    }
}
