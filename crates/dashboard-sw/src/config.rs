//! Worker configuration.
//!
//! A [`WorkerConfig`] is built once per generation and shared read-only by
//! the router, the strategy executor, and every event handler.

use std::path::Path;
use std::time::Duration;

use dashboard_common::{DashboardError, RetryConfig};
use dashboard_net::UrlPattern;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::notify::NotificationAction;

/// Image extensions served stale-while-revalidate.
const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".svg", ".gif", ".webp", ".ico"];

/// Logical role of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Static,
    Dynamic,
    Api,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Static, Role::Dynamic, Role::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Static => "static",
            Role::Dynamic => "dynamic",
            Role::Api => "api",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetch/cache algorithm applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StrategyKind::CacheFirst => "cache-first",
            StrategyKind::NetworkFirst => "network-first",
            StrategyKind::StaleWhileRevalidate => "stale-while-revalidate",
        })
    }
}

/// What install does when one manifest asset cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Log the failure, cache everything else, finish installing.
    #[default]
    Lenient,
    /// Cache nothing and fail the install.
    Strict,
}

/// Policy attached to one partition. Limits are advisory and only reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPolicy {
    pub max_entries: usize,
    pub max_age_seconds: u64,
    pub strategy: StrategyKind,
}

/// Policies for the three partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partitions {
    #[serde(rename = "static")]
    pub static_cache: PartitionPolicy,
    pub dynamic: PartitionPolicy,
    pub api: PartitionPolicy,
}

impl Partitions {
    pub fn get(&self, role: Role) -> &PartitionPolicy {
        match role {
            Role::Static => &self.static_cache,
            Role::Dynamic => &self.dynamic,
            Role::Api => &self.api,
        }
    }
}

impl Default for Partitions {
    fn default() -> Self {
        Self {
            static_cache: PartitionPolicy {
                max_entries: 50,
                max_age_seconds: 30 * 24 * 60 * 60,
                strategy: StrategyKind::CacheFirst,
            },
            dynamic: PartitionPolicy {
                max_entries: 100,
                max_age_seconds: 7 * 24 * 60 * 60,
                strategy: StrategyKind::StaleWhileRevalidate,
            },
            api: PartitionPolicy {
                max_entries: 50,
                max_age_seconds: 5 * 60,
                strategy: StrategyKind::NetworkFirst,
            },
        }
    }
}

/// Defaults for notifications shown from push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
    pub silent: bool,
    /// Page opened or focused when a notification is clicked.
    pub default_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Dashboard Pro".to_string(),
            default_body: "New notification from Dashboard Pro".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![200, 100, 200],
            actions: vec![
                NotificationAction::new("open", "Open", "/icons/action-open.png"),
                NotificationAction::new("dismiss", "Dismiss", "/icons/action-dismiss.png"),
            ],
            require_interaction: true,
            silent: false,
            default_url: "/".to_string(),
        }
    }
}

/// Host-side retry of failed sync events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries.max(1), Duration::from_millis(self.retry_delay_ms))
    }
}

/// Complete configuration of one worker generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// First component of every partition name.
    pub app: String,
    /// Generation component of every partition name.
    pub cache_version: String,
    /// Reported by `GET_VERSION`.
    pub version_tag: String,
    pub partitions: Partitions,
    /// Root-relative paths precached on install, in order.
    pub static_assets: Vec<String>,
    pub static_patterns: Vec<UrlPattern>,
    pub dynamic_patterns: Vec<UrlPattern>,
    pub api_patterns: Vec<UrlPattern>,
    /// Strategy for requests no rule matches (served from the dynamic partition).
    pub fallback_strategy: StrategyKind,
    pub install_policy: InstallPolicy,
    /// Whether install immediately asks to replace the previous generation.
    pub skip_waiting_on_install: bool,
    /// Upper bound on how long an extended event may keep running.
    pub termination_timeout_ms: u64,
    pub storage_quota_bytes: Option<u64>,
    pub notifications: NotificationConfig,
    pub sync: SyncConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let static_assets = [
            "/",
            "/static/js/bundle.js",
            "/static/css/main.css",
            "/manifest.json",
            "/favicon.ico",
            "/icons/icon-192x192.png",
            "/icons/icon-512x512.png",
            "/dashboard",
            "/table-ronde",
            "/vault",
            "/dashboard-main",
        ];

        let mut dynamic_patterns = vec![
            UrlPattern::prefix("/static/"),
            UrlPattern::prefix("/icons/"),
            UrlPattern::prefix("/screenshots/"),
        ];
        dynamic_patterns.extend(IMAGE_EXTENSIONS.iter().map(|ext| UrlPattern::suffix(ext)));

        Self {
            app: "dashboard".to_string(),
            cache_version: "v1.0.0".to_string(),
            version_tag: "dashboard-pro-v1.0.0".to_string(),
            partitions: Partitions::default(),
            static_assets: static_assets.iter().map(|s| s.to_string()).collect(),
            static_patterns: vec![
                UrlPattern::prefix("/static/"),
                UrlPattern::exact("/manifest.json"),
                UrlPattern::exact("/favicon.ico"),
            ],
            dynamic_patterns,
            api_patterns: vec![UrlPattern::prefix("/api/"), UrlPattern::exact("/health")],
            fallback_strategy: StrategyKind::NetworkFirst,
            install_policy: InstallPolicy::Lenient,
            skip_waiting_on_install: true,
            termination_timeout_ms: 5 * 60 * 1000,
            storage_quota_bytes: None,
            notifications: NotificationConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Same configuration for another generation: bumps the partition
    /// version and the reported version tag together.
    pub fn with_version(mut self, version: &str) -> Self {
        self.cache_version = version.to_string();
        self.version_tag = format!("{}-pro-{}", self.app, version);
        self
    }

    /// Partition name for `role`: `<app>-<role>-<version>`.
    pub fn partition_name(&self, role: Role) -> String {
        format!("{}-{}-{}", self.app, role, self.cache_version)
    }

    /// Names of the three partitions this generation keeps on activation.
    pub fn partition_names(&self) -> Vec<String> {
        Role::ALL.iter().map(|role| self.partition_name(*role)).collect()
    }

    /// Role owning partition `name` in this generation, if any.
    pub fn role_of(&self, name: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| self.partition_name(*role) == name)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> dashboard_common::Result<()> {
        if self.app.is_empty() || self.cache_version.is_empty() {
            return Err(DashboardError::config("app and cache_version must not be empty"));
        }
        if self.termination_timeout_ms == 0 {
            return Err(DashboardError::config("termination_timeout_ms must be positive"));
        }
        if let Some(asset) = self.static_assets.iter().find(|a| !a.starts_with('/')) {
            return Err(DashboardError::config(format!(
                "static asset {asset:?} is not root-relative"
            )));
        }
        let unique: HashSet<&String> = self.static_assets.iter().collect();
        if unique.len() != self.static_assets.len() {
            return Err(DashboardError::config("static asset manifest contains duplicates"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> dashboard_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DashboardError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> dashboard_common::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Write this configuration as pretty JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> dashboard_common::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn to_json(&self) -> dashboard_common::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DashboardError::config_with_source("cannot serialize worker config", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_names() {
        let config = WorkerConfig::default();
        assert_eq!(config.partition_name(Role::Static), "dashboard-static-v1.0.0");
        assert_eq!(config.partition_name(Role::Dynamic), "dashboard-dynamic-v1.0.0");
        assert_eq!(config.partition_name(Role::Api), "dashboard-api-v1.0.0");
        assert_eq!(config.version_tag, "dashboard-pro-v1.0.0");
    }

    #[test]
    fn test_with_version() {
        let config = WorkerConfig::default().with_version("v2");
        assert_eq!(config.partition_name(Role::Api), "dashboard-api-v2");
        assert_eq!(config.version_tag, "dashboard-pro-v2");
        assert_eq!(config.role_of("dashboard-api-v2"), Some(Role::Api));
        assert_eq!(config.role_of("dashboard-api-v1.0.0"), None);
    }

    #[test]
    fn test_default_policies() {
        let partitions = Partitions::default();
        assert_eq!(partitions.get(Role::Static).strategy, StrategyKind::CacheFirst);
        assert_eq!(
            partitions.get(Role::Dynamic).strategy,
            StrategyKind::StaleWhileRevalidate
        );
        assert_eq!(partitions.get(Role::Api).max_age_seconds, 300);
    }

    #[test]
    fn test_default_validates() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_asset() {
        let mut config = WorkerConfig::default();
        config.static_assets.push("app.js".to_string());
        assert!(matches!(
            config.validate(),
            Err(DashboardError::Config { .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = WorkerConfig::from_json_str(
            r#"{"cache_version": "v3", "static_assets": ["/", "/app.js"], "install_policy": "strict"}"#,
        )
        .unwrap();
        assert_eq!(config.static_assets, vec!["/", "/app.js"]);
        assert_eq!(config.install_policy, InstallPolicy::Strict);
        assert_eq!(config.partition_name(Role::Static), "dashboard-static-v3");
        assert_eq!(config.partitions, Partitions::default());
    }

    #[test]
    fn test_strategy_names_match_wire_format() {
        let json = serde_json::to_string(&StrategyKind::StaleWhileRevalidate).unwrap();
        assert_eq!(json, "\"staleWhileRevalidate\"");
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");

        let config = WorkerConfig::default().with_version("v9");
        config.to_json_file(&path).unwrap();

        let loaded = WorkerConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = WorkerConfig::from_json_file("/nonexistent/worker.json");
        assert!(matches!(result, Err(DashboardError::Io(_))));
    }

    #[test]
    fn test_sync_retry_config() {
        let retry = SyncConfig::default().retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
    }
}
