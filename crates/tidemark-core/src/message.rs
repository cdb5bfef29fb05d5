//! Derived events produced by the record processor.
//!
//! Messages are handed to an external sink after the transaction that produced
//! them commits. Delivery is at-least-once; sinks must be idempotent.

use crate::uri::AtUri;
use serde::{Deserialize, Serialize};

/// Why a notification was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationReason {
    Like,
    Follow,
}

impl NotificationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationReason::Like => "like",
            NotificationReason::Follow => "follow",
        }
    }
}

/// A notification for `user_did` about an action taken by `author`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_did: String,
    pub author: String,
    pub record_uri: AtUri,
    pub record_cid: String,
    pub reason: NotificationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_subject: Option<AtUri>,
}

/// An event for the downstream sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Create a notification.
    Notification(Notification),
    /// Delete every notification derived from `record_uri`.
    #[serde(rename_all = "camelCase")]
    DeleteNotifications { record_uri: AtUri },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Notification(_) => "notification",
            Message::DeleteNotifications { .. } => "delete_notifications",
        }
    }
}

/// Build a notification message.
pub fn create_notification(
    user_did: impl Into<String>,
    author: impl Into<String>,
    record_uri: AtUri,
    record_cid: impl Into<String>,
    reason: NotificationReason,
    reason_subject: Option<AtUri>,
) -> Message {
    Message::Notification(Notification {
        user_did: user_did.into(),
        author: author.into(),
        record_uri,
        record_cid: record_cid.into(),
        reason,
        reason_subject,
    })
}

/// Build a message retracting notifications derived from `record_uri`.
pub fn delete_notifications(record_uri: AtUri) -> Message {
    Message::DeleteNotifications { record_uri }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_json_shape() {
        let msg = create_notification(
            "did:plc:alice",
            "did:plc:bob",
            AtUri::make("did:plc:bob", "app.bsky.feed.like", "1"),
            "bafycid",
            NotificationReason::Like,
            Some(AtUri::make("did:plc:alice", "app.bsky.feed.post", "p")),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["userDid"], "did:plc:alice");
        assert_eq!(value["author"], "did:plc:bob");
        assert_eq!(value["reason"], "like");
        assert_eq!(
            value["reasonSubject"],
            "at://did:plc:alice/app.bsky.feed.post/p"
        );
    }

    #[test]
    fn test_delete_notifications_json_shape() {
        let msg = delete_notifications(AtUri::make("did:plc:bob", "app.bsky.feed.like", "1"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "deleteNotifications");
        assert_eq!(value["recordUri"], "at://did:plc:bob/app.bsky.feed.like/1");
        assert_eq!(msg.kind(), "delete_notifications");
    }
}
