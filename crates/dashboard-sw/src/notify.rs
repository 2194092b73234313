//! Notifications shown by push events.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

/// Action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

impl NotificationAction {
    pub fn new(action: &str, title: &str, icon: &str) -> Self {
        Self {
            action: action.to_string(),
            title: title.to_string(),
            icon: icon.to_string(),
        }
    }
}

/// Action id that closes a notification without opening anything.
pub const DISMISS_ACTION: &str = "dismiss";

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Payload carried by a notification and read back on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    pub url: String,
    pub timestamp: u64,
}

/// Display options of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
    pub data: NotificationData,
    pub require_interaction: bool,
    pub silent: bool,
}

impl NotificationOptions {
    /// Options for a push payload; an absent or blank payload uses the
    /// configured default body.
    pub fn for_push(config: &NotificationConfig, payload: Option<&str>, timestamp: u64) -> Self {
        let body = payload
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&config.default_body)
            .to_string();

        Self {
            body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            actions: config.actions.clone(),
            data: NotificationData {
                url: config.default_url.clone(),
                timestamp,
            },
            require_interaction: config.require_interaction,
            silent: config.silent,
        }
    }
}

/// A notification shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: HashMap<NotificationId, Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification.
    pub fn show(&mut self, title: &str, options: NotificationOptions) -> NotificationId {
        let id = NotificationId::new();
        self.shown.insert(
            id,
            Notification {
                id,
                title: title.to_string(),
                options,
            },
        );
        id
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Close a notification, returning it if it was open.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    /// All open notifications, oldest first.
    pub fn open(&self) -> Vec<&Notification> {
        let mut open: Vec<&Notification> = self.shown.values().collect();
        open.sort_by_key(|n| n.id.0);
        open
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_options_use_payload() {
        let config = NotificationConfig::default();
        let options = NotificationOptions::for_push(&config, Some("Deadline tomorrow"), 7);

        assert_eq!(options.body, "Deadline tomorrow");
        assert_eq!(options.vibrate, vec![200, 100, 200]);
        assert_eq!(options.data.timestamp, 7);
        let actions: Vec<&str> = options.actions.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec!["open", DISMISS_ACTION]);
    }

    #[test]
    fn test_push_options_default_body() {
        let config = NotificationConfig::default();
        assert_eq!(
            NotificationOptions::for_push(&config, None, 0).body,
            config.default_body
        );
        assert_eq!(
            NotificationOptions::for_push(&config, Some("  "), 0).body,
            config.default_body
        );
    }

    #[test]
    fn test_show_and_close() {
        let config = NotificationConfig::default();
        let mut notifications = Notifications::new();

        let first = notifications.show("A", NotificationOptions::for_push(&config, None, 1));
        let second = notifications.show("B", NotificationOptions::for_push(&config, None, 2));
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications.open()[0].title, "A");

        assert!(notifications.close(first).is_some());
        assert!(notifications.close(first).is_none());
        assert_eq!(notifications.get(second).unwrap().title, "B");
    }
}
