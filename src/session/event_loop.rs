//! The serialized mutation point of a session.
//!
//! Feed events, front-end commands and transfer completions all arrive over
//! channels and are handled one at a time. Uploads, downloads and appends
//! run as spawned tasks and report back through the completion channel; once
//! the loop has exited that channel is closed and late results are dropped.

use std::collections::HashMap;

use tokio::sync::mpsc;
use url::Url;

use super::{SessionCommand, SessionConfig, SessionUpdate};
use crate::backend::{Backends, ConversationId, SubscriptionHandle};
use crate::models::{ChangeEvent, ImageData, Message, MessageKind, MessageRecord};
use crate::sync::{
    classify, AttachOutcome, ChangeAction, IgnoreReason, ReconciliationState, SyncError,
};

/// Results of spawned transfer tasks.
enum Completion {
    Downloaded {
        url: Url,
        result: Result<Vec<u8>, SyncError>,
    },
    Uploaded {
        bytes: ImageData,
        result: Result<Url, SyncError>,
    },
    Appended(Result<(), SyncError>),
}

pub(super) struct SessionLoop {
    conversation: ConversationId,
    config: SessionConfig,
    backends: Backends,
    subscription: SubscriptionHandle,
    state: ReconciliationState,
    viewport_at_bottom: bool,
    upload_in_flight: bool,
    /// Messages waiting on each in-flight image download.
    downloads: HashMap<Url, Vec<Message>>,
    updates: mpsc::Sender<SessionUpdate>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: Option<mpsc::Receiver<Completion>>,
}

impl SessionLoop {
    pub(super) fn new(
        conversation: ConversationId,
        config: SessionConfig,
        backends: Backends,
        subscription: SubscriptionHandle,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            conversation,
            state: ReconciliationState::new(config.identity),
            config,
            backends,
            subscription,
            viewport_at_bottom: true,
            upload_in_flight: false,
            downloads: HashMap::new(),
            updates,
            completion_tx,
            completion_rx: Some(completion_rx),
        }
    }

    pub(super) async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<ChangeEvent>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let Some(mut completion_rx) = self.completion_rx.take() else {
            return;
        };
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;
                Some(done) = completion_rx.recv() => self.on_completion(done).await,
                // Commands first so viewport changes apply before later feed events.
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Close) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                event = feed_rx.recv(), if feed_open => match event {
                    Some(event) => self.on_change(event).await,
                    None => {
                        tracing::warn!("Change feed for {} ended", self.conversation);
                        feed_open = false;
                    }
                },
            }
        }

        self.backends.feed.unsubscribe(self.subscription).await;
        tracing::debug!(
            "Session loop for {} stopped with {} messages, {} downloads pending",
            self.conversation,
            self.state.len(),
            self.downloads.len()
        );
        self.emit(SessionUpdate::Closed).await;
    }

    async fn on_change(&mut self, event: ChangeEvent) {
        match classify(&event, &self.state) {
            ChangeAction::Insert(message) => self.insert(message).await,
            ChangeAction::Resolve { message, url } => self.start_download(message, url),
            ChangeAction::Ignore(IgnoreReason::Malformed(e)) => {
                tracing::warn!("Dropping malformed record {}: {}", event.document_id, e);
            }
            ChangeAction::Ignore(reason) => {
                tracing::debug!("Ignoring {:?} {}: {:?}", event.kind, event.document_id, reason);
            }
        }
    }

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendText(text) => {
                if text.trim().is_empty() {
                    return;
                }
                let message = Message::text(self.config.sender.clone(), now_millis(), text);
                self.persist(message).await;
            }
            SessionCommand::SendImage(bytes) => self.start_upload(bytes).await,
            SessionCommand::ViewportAtBottom(at_bottom) => self.viewport_at_bottom = at_bottom,
            // Handled by the run loop.
            SessionCommand::Close => {}
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Downloaded { url, result } => {
                let waiters = self.downloads.remove(&url).unwrap_or_default();
                match result {
                    Ok(bytes) if !bytes.is_empty() => {
                        let image = ImageData::from(bytes);
                        for message in waiters {
                            self.resolve(message, image.clone()).await;
                        }
                    }
                    Ok(_) => tracing::warn!(
                        "Dropping {} image message(s): {} is empty",
                        waiters.len(),
                        url
                    ),
                    Err(e) => {
                        tracing::warn!("Dropping {} image message(s): {}", waiters.len(), e)
                    }
                }
            }
            Completion::Uploaded { bytes, result } => {
                self.upload_in_flight = false;
                self.emit(SessionUpdate::ImageSendEnabled(true)).await;
                match result {
                    Ok(url) => {
                        let message = Message::image(
                            self.config.sender.clone(),
                            now_millis(),
                            Some(bytes),
                            Some(url),
                        );
                        self.persist(message).await;
                    }
                    Err(e) => {
                        tracing::warn!("Image upload to {} failed: {}", self.conversation, e);
                        self.emit(SessionUpdate::SendFailed(e)).await;
                    }
                }
            }
            Completion::Appended(Ok(())) => {}
            Completion::Appended(Err(e)) => {
                tracing::warn!("Failed to persist message in {}: {}", self.conversation, e);
                self.emit(SessionUpdate::SendFailed(e)).await;
            }
        }
    }

    async fn insert(&mut self, message: Message) {
        let outcome = self.state.insert(message.clone());
        if !outcome.changed() {
            return;
        }
        let scroll_to_bottom = self.state.should_auto_scroll(&message, self.viewport_at_bottom);
        tracing::debug!(
            "Inserted message from {} at {} ({:?}, scroll={})",
            message.sender.sender_id,
            message.created,
            outcome,
            scroll_to_bottom
        );
        self.render(scroll_to_bottom).await;
    }

    /// Show an image message now that its bitmap is known.
    async fn resolve(&mut self, mut message: Message, image: ImageData) {
        // Normally absent: image messages wait for their bitmap.
        match self.state.attach_resolved_image(&message.key(), image.clone()) {
            AttachOutcome::Attached { .. } => self.render(false).await,
            AttachOutcome::NotAnImage => {
                tracing::debug!(
                    "Resolved image for {}@{} matched a text message",
                    message.sender.sender_id,
                    message.created
                );
            }
            AttachOutcome::Absent => {
                if let MessageKind::Image { preview, .. } = &mut message.kind {
                    *preview = Some(image);
                }
                self.insert(message).await;
            }
        }
    }

    async fn render(&self, scroll_to_bottom: bool) {
        self.emit(SessionUpdate::Render {
            messages: self.state.messages().to_vec(),
            scroll_to_bottom,
        })
        .await;
    }

    /// Hand a local message to the store. The feed echo inserts it, unless
    /// optimistic send already did.
    async fn persist(&mut self, message: Message) {
        let record = match MessageRecord::from_message(&message) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Cannot persist message: {}", e);
                self.emit(SessionUpdate::SendFailed(e)).await;
                return;
            }
        };

        if self.config.optimistic_send {
            self.insert(message).await;
        }

        let store = self.backends.store.clone();
        let conversation = self.conversation.clone();
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = store.append(&conversation, record).await;
            if done.send(Completion::Appended(result)).await.is_err() {
                tracing::debug!("Append finished after {} closed", conversation);
            }
        });
    }

    /// Fetch an image once per reference; every message waiting on it is
    /// resolved when the download completes.
    fn start_download(&mut self, message: Message, url: Url) {
        let identity = self.config.identity;
        if let Some(waiters) = self.downloads.get_mut(&url) {
            if waiters.iter().any(|w| identity.same(w, &message)) {
                tracing::debug!("Download for this message already in flight: {}", url);
            } else {
                tracing::debug!("Joining in-flight download of {}", url);
                waiters.push(message);
            }
            return;
        }
        self.downloads.insert(url.clone(), vec![message]);

        let attachments = self.backends.attachments.clone();
        let max_bytes = self.config.max_download_bytes;
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = attachments.download(&url, max_bytes).await;
            if done.send(Completion::Downloaded { url, result }).await.is_err() {
                tracing::debug!("Download finished after session closed, discarding");
            }
        });
    }

    async fn start_upload(&mut self, bytes: Vec<u8>) {
        if self.upload_in_flight {
            tracing::debug!("Rejecting image send: upload already in flight");
            self.emit(SessionUpdate::SendFailed(SyncError::UploadInProgress))
                .await;
            return;
        }
        self.upload_in_flight = true;
        self.emit(SessionUpdate::ImageSendEnabled(false)).await;

        let attachments = self.backends.attachments.clone();
        let conversation = self.conversation.clone();
        let done = self.completion_tx.clone();
        tokio::spawn(async move {
            let preview = ImageData::from(bytes.clone());
            let result = attachments.upload(&conversation, bytes).await;
            let completion = Completion::Uploaded {
                bytes: preview,
                result,
            };
            if done.send(completion).await.is_err() {
                tracing::debug!("Upload finished after {} closed, discarding", conversation);
            }
        });
    }

    async fn emit(&self, update: SessionUpdate) {
        if self.updates.send(update).await.is_err() {
            tracing::trace!("No listener for session updates");
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
