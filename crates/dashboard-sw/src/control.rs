//! Page → worker control messages.
//!
//! Messages arrive as JSON objects tagged by `type`; replies go back over a
//! one-shot [`ReplyPort`].

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{Result, ServiceWorkerError};

/// Payload of `PRELOAD_RESOURCES`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadPayload {
    #[serde(default)]
    pub urls: Vec<String>,
}

/// A message posted by the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Promote the waiting generation now. No reply.
    SkipWaiting,
    /// Reply with the version tag and a timestamp.
    GetVersion,
    /// Delete every partition.
    ClearCache,
    /// Fetch the URLs into the dynamic partition.
    PreloadResources {
        #[serde(default)]
        payload: PreloadPayload,
    },
    /// Reply with per-partition statistics.
    GetCacheStats,
}

impl ControlMessage {
    /// Preload message for `urls`.
    pub fn preload<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PreloadResources {
            payload: PreloadPayload {
                urls: urls.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Parse a raw JSON message.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::Message(e.to_string()))
    }

    /// Wire name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::SkipWaiting => "SKIP_WAITING",
            ControlMessage::GetVersion => "GET_VERSION",
            ControlMessage::ClearCache => "CLEAR_CACHE",
            ControlMessage::PreloadResources { .. } => "PRELOAD_RESOURCES",
            ControlMessage::GetCacheStats => "GET_CACHE_STATS",
        }
    }
}

/// Statistics for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
    /// Advisory limit from the owning role's policy; absent for partitions
    /// of other generations.
    pub max_entries: Option<usize>,
    pub max_age_seconds: Option<u64>,
}

/// Reply sent back to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version { version: String, timestamp: u64 },
    Success { success: bool },
    CacheStats { partitions: Vec<PartitionStats> },
}

impl ControlReply {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ServiceWorkerError::Message(e.to_string()))
    }
}

/// Sending half of a reply channel.
#[derive(Debug)]
pub struct ReplyPort {
    sender: oneshot::Sender<ControlReply>,
}

impl ReplyPort {
    /// Send the reply. Returns false if the page stopped listening.
    pub fn post(self, reply: ControlReply) -> bool {
        match self.sender.send(reply) {
            Ok(()) => true,
            Err(_) => {
                debug!("Reply port closed before reply was posted");
                false
            }
        }
    }
}

/// A reply port and the receiver the page waits on.
#[derive(Debug)]
pub struct MessageChannel {
    pub port: ReplyPort,
    pub reply: oneshot::Receiver<ControlReply>,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (sender, reply) = oneshot::channel();
        Self {
            port: ReplyPort { sender },
            reply,
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            ControlMessage::from_json(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
            ControlMessage::SkipWaiting
        );
        assert_eq!(
            ControlMessage::from_json(r#"{"type":"GET_VERSION"}"#).unwrap(),
            ControlMessage::GetVersion
        );
        assert_eq!(
            ControlMessage::from_json(
                r#"{"type":"PRELOAD_RESOURCES","payload":{"urls":["/a.png","/b.png"]}}"#
            )
            .unwrap(),
            ControlMessage::preload(["/a.png", "/b.png"])
        );
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(matches!(
            ControlMessage::from_json(r#"{"type":"REBOOT"}"#),
            Err(ServiceWorkerError::Message(_))
        ));
        assert!(ControlMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        let version = ControlReply::Version {
            version: "dashboard-pro-v1.0.0".to_string(),
            timestamp: 42,
        };
        assert_eq!(
            version.to_json().unwrap(),
            r#"{"version":"dashboard-pro-v1.0.0","timestamp":42}"#
        );
        assert_eq!(
            ControlReply::Success { success: true }.to_json().unwrap(),
            r#"{"success":true}"#
        );
    }

    #[tokio::test]
    async fn test_reply_port() {
        let channel = MessageChannel::new();
        assert!(channel.port.post(ControlReply::Success { success: true }));
        assert_eq!(
            channel.reply.await.unwrap(),
            ControlReply::Success { success: true }
        );
    }

    #[test]
    fn test_closed_reply_port() {
        let MessageChannel { port, reply } = MessageChannel::new();
        drop(reply);
        assert!(!port.post(ControlReply::Success { success: false }));
    }
}
