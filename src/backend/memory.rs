//! In-process implementation of all three collaborators.
//!
//! Appends are echoed to every subscriber of the conversation as `added`
//! events, the way a live document listener reports its own writes. Used by
//! the `replay` command and by the session tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::{attachment_name, AttachmentService, ChangeFeed, ConversationId, Persistence, SubscriptionHandle};
use crate::models::{ChangeEvent, MessageRecord};
use crate::sync::SyncError;

/// One registered listener. Events are queued unbounded under the backend
/// lock and moved into the subscriber's bounded sink by a forwarding task,
/// so delivery order matches append order without blocking writers.
struct Subscriber {
    conversation: ConversationId,
    queue: mpsc::UnboundedSender<ChangeEvent>,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    /// Stored change history per conversation, in append order.
    history: HashMap<ConversationId, Vec<ChangeEvent>>,
    subscribers: HashMap<SubscriptionHandle, Subscriber>,
    blobs: HashMap<Url, Vec<u8>>,
    next_handle: u64,
    fail_uploads: bool,
    fail_appends: bool,
    /// Artificial delay applied to uploads and downloads.
    latency: Option<Duration>,
    download_count: usize,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event and deliver it to the conversation's subscribers.
    pub async fn inject(&self, conversation: &ConversationId, event: ChangeEvent) {
        let mut inner = self.inner.lock().await;
        inner
            .history
            .entry(conversation.clone())
            .or_default()
            .push(event.clone());

        for sub in inner
            .subscribers
            .values()
            .filter(|sub| &sub.conversation == conversation)
        {
            if sub.queue.send(event.clone()).is_err() {
                tracing::debug!("Dropping event for closed subscriber of {}", conversation);
            }
        }
    }

    /// Store a blob directly, returning its reference.
    pub async fn put_blob(&self, conversation: &ConversationId, bytes: Vec<u8>) -> Result<Url, SyncError> {
        let url = blob_url(conversation, &attachment_name())?;
        self.inner.lock().await.blobs.insert(url.clone(), bytes);
        Ok(url)
    }

    /// Records appended to a conversation so far.
    pub async fn records(&self, conversation: &ConversationId) -> Vec<MessageRecord> {
        let inner = self.inner.lock().await;
        inner
            .history
            .get(conversation)
            .map(|events| {
                events
                    .iter()
                    .filter_map(|ev| {
                        serde_json::from_value(serde_json::Value::Object(ev.record.clone())).ok()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    pub async fn set_fail_uploads(&self, fail: bool) {
        self.inner.lock().await.fail_uploads = fail;
    }

    pub async fn set_fail_appends(&self, fail: bool) {
        self.inner.lock().await.fail_appends = fail;
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().await.latency = latency;
    }

    /// Number of download requests served so far.
    pub async fn download_count(&self) -> usize {
        self.inner.lock().await.download_count
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Move queued events into the subscriber's sink until either side closes.
async fn forward(mut queue: mpsc::UnboundedReceiver<ChangeEvent>, sink: mpsc::Sender<ChangeEvent>) {
    while let Some(event) = queue.recv().await {
        if sink.send(event).await.is_err() {
            break;
        }
    }
}

fn blob_url(conversation: &ConversationId, name: &str) -> Result<Url, SyncError> {
    let e = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    let raw = format!("memory://store/{}/{}", e(conversation.as_str()), e(name));
    Url::parse(&raw).map_err(|err| SyncError::UploadFailure(format!("bad blob URL {}: {}", raw, err)))
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, SyncError> {
        let mut inner = self.inner.lock().await;
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);

        let (queue, queue_rx) = mpsc::unbounded_channel();
        // Initial snapshot: existing documents arrive as additions.
        for event in inner.history.get(conversation).into_iter().flatten() {
            let _ = queue.send(event.clone());
        }
        let forwarder = tokio::spawn(forward(queue_rx, sink));
        inner.subscribers.insert(
            handle,
            Subscriber {
                conversation: conversation.clone(),
                queue,
                forwarder,
            },
        );

        tracing::debug!("Memory feed subscription {} for {}", handle.0, conversation);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(sub) = self.inner.lock().await.subscribers.remove(&handle) {
            sub.forwarder.abort();
        }
    }
}

#[async_trait]
impl Persistence for MemoryBackend {
    async fn append(&self, conversation: &ConversationId, record: MessageRecord) -> Result<(), SyncError> {
        if self.inner.lock().await.fail_appends {
            return Err(SyncError::PersistenceFailure("store unavailable".to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.inject(conversation, ChangeEvent::added(id, &record)).await;
        Ok(())
    }
}

#[async_trait]
impl AttachmentService for MemoryBackend {
    async fn upload(&self, conversation: &ConversationId, bytes: Vec<u8>) -> Result<Url, SyncError> {
        self.simulate_latency().await;
        if self.inner.lock().await.fail_uploads {
            return Err(SyncError::UploadFailure("storage unavailable".to_string()));
        }
        self.put_blob(conversation, bytes).await
    }

    async fn download(&self, url: &Url, max_bytes: usize) -> Result<Vec<u8>, SyncError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.download_count += 1;
        let bytes = inner
            .blobs
            .get(url)
            .ok_or_else(|| SyncError::DownloadFailure(format!("no object at {}", url)))?;
        if bytes.is_empty() {
            return Err(SyncError::DownloadFailure(format!("{} is empty", url)));
        }
        if bytes.len() > max_bytes {
            return Err(SyncError::DownloadFailure(format!(
                "{} is {} bytes, limit is {}",
                url,
                bytes.len(),
                max_bytes
            )));
        }
        Ok(bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;

    fn record(created: i64) -> MessageRecord {
        MessageRecord {
            sender_id: "a".to_string(),
            display_name: "A".to_string(),
            created,
            content: Some(format!("m{}", created)),
            image_ref: None,
        }
    }

    #[tokio::test]
    async fn test_append_echoes_to_subscribers() {
        let backend = MemoryBackend::new();
        let conv = ConversationId::new("c1");
        let other = ConversationId::new("c2");
        let (tx, mut rx) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        backend.subscribe(&conv, tx).await.unwrap();
        backend.subscribe(&other, tx2).await.unwrap();

        backend.append(&conv, record(1)).await.unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, ChangeKind::Added);
        assert!(!ev.document_id.is_empty());
        assert!(rx2.try_recv().is_err());
        assert_eq!(backend.records(&conv).await, vec![record(1)]);
    }

    #[tokio::test]
    async fn test_subscribe_replays_history() {
        let backend = MemoryBackend::new();
        let conv = ConversationId::new("c1");
        backend.append(&conv, record(1)).await.unwrap();
        backend.append(&conv, record(2)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        backend.subscribe(&conv, tx).await.unwrap();
        let first = rx.recv().await.unwrap().to_message().unwrap();
        let second = rx.recv().await.unwrap().to_message().unwrap();
        assert_eq!((first.created, second.created), (1, 2));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let backend = MemoryBackend::new();
        let conv = ConversationId::new("c1");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = backend.subscribe(&conv, tx).await.unwrap();
        backend.unsubscribe(handle).await;
        assert_eq!(backend.subscriber_count().await, 0);

        backend.append(&conv, record(1)).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_limits() {
        let backend = MemoryBackend::new();
        let conv = ConversationId::new("c1");
        let url = backend.upload(&conv, vec![1, 2, 3]).await.unwrap();
        assert_eq!(url.scheme(), "memory");

        let bytes = tokio_test::assert_ok!(backend.download(&url, 16).await);
        assert_eq!(bytes, vec![1, 2, 3]);

        tokio_test::assert_err!(backend.download(&url, 2).await);

        let empty = backend.put_blob(&conv, Vec::new()).await.unwrap();
        tokio_test::assert_err!(backend.download(&empty, 16).await);
    }
}
