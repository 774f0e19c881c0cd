//! External collaborators: change feed, persistence and attachment storage
//!
//! The session only talks to these traits. Concrete implementations:
//! [`client::StoreClient`] (HTTP), [`feed::WsChangeFeed`] (WebSocket) and
//! [`memory::MemoryBackend`] (in-process).

pub mod client;
pub mod feed;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::models::{ChangeEvent, MessageRecord};
use crate::sync::SyncError;

/// Opaque conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by [`ChangeFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Ordered "document changed" notifications for a conversation.
///
/// Events for one subscription are delivered into `sink` in FIFO order.
/// After `unsubscribe` returns no further events are sent.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, SyncError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Append-only message store.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append(
        &self,
        conversation: &ConversationId,
        record: MessageRecord,
    ) -> Result<(), SyncError>;
}

/// Blob storage for image attachments.
#[async_trait]
pub trait AttachmentService: Send + Sync {
    async fn upload(&self, conversation: &ConversationId, bytes: Vec<u8>) -> Result<Url, SyncError>;

    /// Fetch the bytes behind `url`, failing if they exceed `max_bytes`.
    async fn download(&self, url: &Url, max_bytes: usize) -> Result<Vec<u8>, SyncError>;
}

/// The three collaborators a session is wired to.
#[derive(Clone)]
pub struct Backends {
    pub feed: Arc<dyn ChangeFeed>,
    pub store: Arc<dyn Persistence>,
    pub attachments: Arc<dyn AttachmentService>,
}

impl Backends {
    /// Use one in-memory backend for all three roles.
    pub fn memory(backend: Arc<memory::MemoryBackend>) -> Self {
        Self {
            feed: backend.clone(),
            store: backend.clone(),
            attachments: backend,
        }
    }
}

/// Attachment object name: a fresh UUID followed by the upload time in seconds.
pub(crate) fn attachment_name() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4(),
        chrono::Utc::now().timestamp()
    )
}
