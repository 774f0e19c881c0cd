//! Wire records exchanged with the store and the change feed

use serde::{Deserialize, Serialize};
use url::Url;

use super::message::{Message, MessageKind, Sender};
use crate::sync::SyncError;

/// Serialized form of a message as stored in a conversation.
///
/// Exactly one of `content` / `image_ref` is set by [`MessageRecord::from_message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub sender_id: String,
    pub display_name: String,
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl MessageRecord {
    /// Serialize a message for persistence.
    ///
    /// Image messages must carry a remote reference; a local-only preview
    /// cannot be persisted.
    pub fn from_message(message: &Message) -> Result<Self, SyncError> {
        let (content, image_ref) = match &message.kind {
            MessageKind::Text(text) => (Some(text.clone()), None),
            MessageKind::Image {
                remote: Some(url), ..
            } => (None, Some(url.to_string())),
            MessageKind::Image { remote: None, .. } => {
                return Err(SyncError::PersistenceFailure(
                    "image message has no uploaded reference".to_string(),
                ));
            }
        };

        Ok(Self {
            sender_id: message.sender.sender_id.clone(),
            display_name: message.sender.display_name.clone(),
            created: message.created,
            content,
            image_ref,
        })
    }

    /// Rebuild a message from a stored record. Content wins over an image reference.
    pub fn into_message(self, id: Option<String>) -> Result<Message, SyncError> {
        let sender = Sender::new(self.sender_id, self.display_name);
        let kind = match (self.content, self.image_ref) {
            (Some(text), _) => MessageKind::Text(text),
            (None, Some(image_ref)) => {
                let url = Url::parse(&image_ref).map_err(|e| {
                    SyncError::MalformedRecord(format!("bad imageRef {:?}: {}", image_ref, e))
                })?;
                MessageKind::Image {
                    preview: None,
                    remote: Some(url),
                }
            }
            (None, None) => {
                return Err(SyncError::MalformedRecord(
                    "record has neither content nor imageRef".to_string(),
                ));
            }
        };

        Ok(Message {
            id,
            sender,
            created: self.created,
            kind,
        })
    }
}

/// Kind of document change reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One "document changed" notification from a conversation subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub document_id: String,
    /// Opaque key-value document body.
    pub record: serde_json::Map<String, serde_json::Value>,
}

impl ChangeEvent {
    pub fn added(document_id: impl Into<String>, record: &MessageRecord) -> Self {
        let record = match serde_json::to_value(record) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                tracing::warn!("Record for {} is not an object: {}", record.sender_id, other);
                serde_json::Map::new()
            }
            Err(e) => {
                tracing::warn!("Failed to serialize record from {}: {}", record.sender_id, e);
                serde_json::Map::new()
            }
        };
        Self {
            kind: ChangeKind::Added,
            document_id: document_id.into(),
            record,
        }
    }

    /// Parse the record body into a message carrying the document id.
    pub fn to_message(&self) -> Result<Message, SyncError> {
        let record: MessageRecord =
            serde_json::from_value(serde_json::Value::Object(self.record.clone()))
                .map_err(|e| SyncError::MalformedRecord(e.to_string()))?;
        record.into_message(Some(self.document_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(record: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Added,
            document_id: "doc-1".to_string(),
            record: record.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_record_wire_shape() {
        let msg = Message::text(Sender::new("a", "Alice"), 100, "hi");
        let record = MessageRecord::from_message(&msg).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"senderId": "a", "displayName": "Alice", "created": 100, "content": "hi"})
        );
    }

    #[test]
    fn test_image_record_requires_reference() {
        let local_only = Message::image(Sender::new("a", "Alice"), 1, Some(vec![1].into()), None);
        assert!(matches!(
            MessageRecord::from_message(&local_only),
            Err(SyncError::PersistenceFailure(_))
        ));
    }

    #[test]
    fn test_parse_text_event() {
        let ev = event(json!({"senderId": "a", "displayName": "Alice", "created": 100, "content": "hi"}));
        let msg = ev.to_message().unwrap();
        assert_eq!(msg.id.as_deref(), Some("doc-1"));
        assert_eq!(msg.created, 100);
        assert_eq!(msg.kind, MessageKind::Text("hi".to_string()));
    }

    #[test]
    fn test_parse_image_event_needs_download() {
        let ev = event(json!({
            "senderId": "b",
            "displayName": "Bob",
            "created": 7,
            "imageRef": "https://files.example.com/c1/pic"
        }));
        let msg = ev.to_message().unwrap();
        assert_eq!(
            msg.pending_download().map(Url::as_str),
            Some("https://files.example.com/c1/pic")
        );
    }

    #[test]
    fn test_content_wins_over_image_ref() {
        let ev = event(json!({
            "senderId": "b",
            "displayName": "Bob",
            "created": 7,
            "content": "caption",
            "imageRef": "https://files.example.com/c1/pic"
        }));
        assert_eq!(
            ev.to_message().unwrap().kind,
            MessageKind::Text("caption".to_string())
        );
    }

    #[test]
    fn test_malformed_records() {
        let missing_body = event(json!({"senderId": "a", "displayName": "A", "created": 1}));
        assert!(matches!(
            missing_body.to_message(),
            Err(SyncError::MalformedRecord(_))
        ));

        let missing_created = event(json!({"senderId": "a", "displayName": "A", "content": "x"}));
        assert!(matches!(
            missing_created.to_message(),
            Err(SyncError::MalformedRecord(_))
        ));

        let bad_url = event(json!({"senderId": "a", "displayName": "A", "created": 1, "imageRef": "not a url"}));
        assert!(matches!(
            bad_url.to_message(),
            Err(SyncError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_change_event_wire_shape() {
        let text = r#"{"kind":"removed","documentId":"d9","record":{}}"#;
        let ev: ChangeEvent = serde_json::from_str(text).unwrap();
        assert_eq!(ev.kind, ChangeKind::Removed);
        assert_eq!(ev.document_id, "d9");
    }

    #[test]
    fn test_added_carries_full_record() {
        let record = MessageRecord {
            sender_id: "a".to_string(),
            display_name: "Alice".to_string(),
            created: 7,
            content: None,
            image_ref: Some("https://files.example.com/c/1".to_string()),
        };
        let ev = ChangeEvent::added("d1", &record);
        assert_eq!(ev.kind, ChangeKind::Added);
        assert_eq!(ev.record.len(), 4);
        assert_eq!(ev.record["imageRef"], json!("https://files.example.com/c/1"));

        let msg = ev.to_message().unwrap();
        assert_eq!(msg.id.as_deref(), Some("d1"));
        assert_eq!(MessageRecord::from_message(&msg).unwrap(), record);
    }
}
