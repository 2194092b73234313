//! Request classification.
//!
//! Rules are evaluated top to bottom and the first match wins. The fallback
//! route makes classification total for every HTTP(S) request.

use dashboard_net::{Request, UrlPattern};
use hashbrown::HashSet;
use tracing::trace;
use url::Url;

use crate::config::{Role, StrategyKind, WorkerConfig};

/// Target partition role and strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub role: Role,
    pub strategy: StrategyKind,
}

impl Route {
    pub fn new(role: Role, strategy: StrategyKind) -> Self {
        Self { role, strategy }
    }
}

/// Condition a routing rule tests against the request URL.
#[derive(Debug, Clone)]
pub enum RoutePredicate {
    /// Path is one of the precached manifest paths.
    Manifest(HashSet<String>),
    /// Path matches a URL pattern.
    Pattern(UrlPattern),
}

impl RoutePredicate {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            RoutePredicate::Manifest(paths) => paths.contains(url.path()),
            RoutePredicate::Pattern(pattern) => pattern.matches(url),
        }
    }
}

/// One ordered routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub predicate: RoutePredicate,
    pub route: Route,
}

/// Ordered rule table built from a [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RoutingRule>,
    fallback: Route,
}

impl Router {
    /// Build the rule table: static manifest and static patterns, then
    /// dynamic patterns, then API patterns.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let mut rules = Vec::new();

        let static_route = Route::new(Role::Static, config.partitions.get(Role::Static).strategy);
        rules.push(RoutingRule {
            predicate: RoutePredicate::Manifest(config.static_assets.iter().cloned().collect()),
            route: static_route,
        });

        let groups = [
            (&config.static_patterns, Role::Static),
            (&config.dynamic_patterns, Role::Dynamic),
            (&config.api_patterns, Role::Api),
        ];
        for (patterns, role) in groups {
            let route = Route::new(role, config.partitions.get(role).strategy);
            rules.extend(patterns.iter().map(|pattern| RoutingRule {
                predicate: RoutePredicate::Pattern(pattern.clone()),
                route,
            }));
        }

        Self {
            rules,
            fallback: Route::new(Role::Dynamic, config.fallback_strategy),
        }
    }

    /// Classify an intercepted request. `None` means the request is not
    /// intercepted and goes straight to the network.
    pub fn classify(&self, request: &Request) -> Option<Route> {
        if !request.is_http() {
            trace!(url = %request.url, "Non-HTTP request passes through");
            return None;
        }
        Some(self.route_for(&request.url))
    }

    /// Route for an HTTP(S) URL.
    pub fn route_for(&self, url: &Url) -> Route {
        self.rules
            .iter()
            .find(|rule| rule.predicate.matches(url))
            .map(|rule| rule.route)
            .unwrap_or(self.fallback)
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn fallback(&self) -> Route {
        self.fallback
    }
}
