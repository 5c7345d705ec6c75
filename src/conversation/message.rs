use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::UserId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    /// `data` holds the inline-encoded content, usually a `data:` URL.
    Attachment { name: String, data: String },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn attachment(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Attachment {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Attachment { data, .. } if data.starts_with("data:image/"))
    }

    /// One-line rendering used by the terminal view.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Attachment { name, .. } if self.is_image() => format!("[image: {}]", name),
            Self::Attachment { name, .. } => format!("[file: {}]", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unread,
    Read,
    #[serde(untagged)]
    Other(String),
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Unread
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub body: MessageBody,
    /// `None` while the write is pending acknowledgement by the store.
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        sender: UserId,
        body: MessageBody,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: MessageId::new(id),
            sender,
            body,
            timestamp,
            status: MessageStatus::Unread,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.timestamp.is_none()
    }
}

/// A message as handed to the store for writing; the store assigns id and
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender: UserId,
    pub body: MessageBody,
}

impl MessageDraft {
    pub fn text(sender: UserId, text: impl Into<String>) -> Self {
        Self {
            sender,
            body: MessageBody::text(text),
        }
    }

    pub fn into_message(self, id: MessageId, timestamp: Option<DateTime<Utc>>) -> Message {
        Message {
            id,
            sender: self.sender,
            body: self.body,
            timestamp,
            status: MessageStatus::Unread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_attachments_are_detected_by_data_url_prefix() {
        assert!(MessageBody::attachment("cat.png", "data:image/png;base64,AAAA").is_image());
        assert!(!MessageBody::attachment("notes.pdf", "data:application/pdf;base64,AAAA").is_image());
        assert!(!MessageBody::text("data:image/png").is_image());
    }

    #[test]
    fn preview_labels_attachments() {
        assert_eq!(MessageBody::text("hi").preview(), "hi");
        assert_eq!(
            MessageBody::attachment("a.pdf", "data:application/pdf;base64,").preview(),
            "[file: a.pdf]"
        );
        assert_eq!(
            MessageBody::attachment("a.png", "data:image/png;base64,").preview(),
            "[image: a.png]"
        );
    }

    #[test]
    fn unknown_status_round_trips_through_json() {
        let status: MessageStatus = serde_json::from_str("\"delivered\"").unwrap();
        assert_eq!(status, MessageStatus::Other("delivered".to_string()));
        let status: MessageStatus = serde_json::from_str("\"unread\"").unwrap();
        assert_eq!(status, MessageStatus::Unread);
    }
}
