//! Message entity: identity, ordering key, and content variants

use std::fmt;
use std::sync::Arc;

use url::Url;

/// Authoring participant of a message.
///
/// Equality compares `sender_id` only; the display name is presentation data
/// and may change between sessions.
#[derive(Debug, Clone)]
pub struct Sender {
    pub sender_id: String,
    pub display_name: String,
}

impl Sender {
    pub fn new(sender_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            display_name: display_name.into(),
        }
    }
}

impl PartialEq for Sender {
    fn eq(&self, other: &Self) -> bool {
        self.sender_id == other.sender_id
    }
}

impl Eq for Sender {}

/// Resolved image bytes held in memory.
///
/// Cheap to clone; snapshots handed to the front-end share the buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData(Arc<[u8]>);

impl ImageData {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageData({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for ImageData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Message content.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Text(String),
    Image {
        /// Local or downloaded bitmap.
        preview: Option<ImageData>,
        /// Reference into attachment storage.
        remote: Option<Url>,
    },
}

/// Identity key of a message: who sent it and when, plus the store id
/// when one is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender_id: String,
    pub created: i64,
    pub id: Option<String>,
}

/// A single chat message.
///
/// Two messages are equal iff their sender and `created` timestamp match.
/// Content and store id are not part of equality.
#[derive(Debug, Clone)]
pub struct Message {
    /// Store-assigned document id, `None` until persisted.
    pub id: Option<String>,
    pub sender: Sender,
    /// Milliseconds since the Unix epoch.
    pub created: i64,
    pub kind: MessageKind,
}

impl Message {
    pub fn text(sender: Sender, created: i64, content: impl Into<String>) -> Self {
        Self {
            id: None,
            sender,
            created,
            kind: MessageKind::Text(content.into()),
        }
    }

    pub fn image(sender: Sender, created: i64, preview: Option<ImageData>, remote: Option<Url>) -> Self {
        Self {
            id: None,
            sender,
            created,
            kind: MessageKind::Image { preview, remote },
        }
    }

    #[cfg(test)]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender_id: self.sender.sender_id.clone(),
            created: self.created,
            id: self.id.clone(),
        }
    }

    /// Remote image reference that still has to be fetched before display.
    pub fn pending_download(&self) -> Option<&Url> {
        match &self.kind {
            MessageKind::Image {
                preview: None,
                remote: Some(url),
            } => Some(url),
            _ => None,
        }
    }

    /// Short single-line rendering for terminal output.
    pub fn summary(&self) -> String {
        match &self.kind {
            MessageKind::Text(text) => text.clone(),
            MessageKind::Image {
                preview: Some(img), ..
            } => format!("[image, {} bytes]", img.len()),
            MessageKind::Image {
                preview: None,
                remote: Some(url),
            } => format!("[image {}]", url),
            MessageKind::Image { .. } => "[image]".to_string(),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender && self.created == other.created
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Sender {
        Sender::new("a", "Alice")
    }

    #[test]
    fn test_equality_ignores_content_and_id() {
        let m1 = Message::text(alice(), 100, "hi").with_id("doc-1");
        let m2 = Message::text(Sender::new("a", "Alice (renamed)"), 100, "different");
        assert_eq!(m1, m2);

        let m3 = Message::text(alice(), 101, "hi");
        assert_ne!(m1, m3);

        let m4 = Message::text(Sender::new("b", "Alice"), 100, "hi");
        assert_ne!(m1, m4);
    }

    #[test]
    fn test_pending_download() {
        let url = Url::parse("https://files.example.com/c1/abc").unwrap();
        let remote_only = Message::image(alice(), 1, None, Some(url.clone()));
        assert_eq!(remote_only.pending_download(), Some(&url));

        let resolved = Message::image(alice(), 1, Some(vec![1, 2, 3].into()), Some(url));
        assert!(resolved.pending_download().is_none());

        let text = Message::text(alice(), 1, "x");
        assert!(text.pending_download().is_none());
    }

    #[test]
    fn test_summary() {
        assert_eq!(Message::text(alice(), 1, "hi").summary(), "hi");
        assert_eq!(Message::image(alice(), 1, None, None).summary(), "[image]");
        let url = Url::parse("https://files.example.com/c/1").unwrap();
        assert_eq!(
            Message::image(alice(), 1, None, Some(url)).summary(),
            "[image https://files.example.com/c/1]"
        );
    }

    #[test]
    fn test_image_data_debug_hides_bytes() {
        let img = ImageData::from(vec![0u8; 42]);
        assert_eq!(format!("{:?}", img), "ImageData(42 bytes)");
    }
}
