//! Chat session controller
//!
//! One [`ChatSession`] per open conversation. The session subscribes to the
//! change feed on open and spawns a single event loop task that owns the
//! canonical message list. The front-end sends [`SessionCommand`] values and
//! receives [`SessionUpdate`] values; all state changes happen inside the loop.

mod event_loop;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Backends, ConversationId};
use crate::config::Config;
use crate::models::{Message, Sender};
use crate::sync::{IdentityRule, SyncError};

use event_loop::SessionLoop;

/// Per-session settings, taken from [`Config`] at open time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sender: Sender,
    pub max_download_bytes: usize,
    pub channel_capacity: usize,
    pub identity: IdentityRule,
    pub optimistic_send: bool,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sender: config.sender(),
            max_download_bytes: config.sync.max_download_bytes,
            channel_capacity: config.sync.channel_capacity.max(1),
            identity: config.sync.identity,
            optimistic_send: config.sync.optimistic_send,
        }
    }
}

/// Commands sent from the front-end to the session loop.
#[derive(Debug)]
pub enum SessionCommand {
    SendText(String),
    SendImage(Vec<u8>),
    /// Whether the message view is currently scrolled to the bottom.
    ViewportAtBottom(bool),
    Close,
}

/// Updates from the session loop to the front-end.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// The canonical list changed; redraw it.
    Render {
        messages: Vec<Message>,
        scroll_to_bottom: bool,
    },
    /// The image-send affordance toggled (disabled while an upload runs).
    ImageSendEnabled(bool),
    /// A local send did not reach the store.
    SendFailed(SyncError),
    Closed,
}

/// Handle for one open conversation.
pub struct ChatSession {
    conversation: ConversationId,
    cmd_tx: mpsc::Sender<SessionCommand>,
    update_rx: mpsc::Receiver<SessionUpdate>,
    task: JoinHandle<()>,
}

impl ChatSession {
    /// Subscribe to the conversation and start the session loop.
    pub async fn open(
        conversation: ConversationId,
        config: SessionConfig,
        backends: Backends,
    ) -> Result<Self, SyncError> {
        let capacity = config.channel_capacity.max(1);
        let (feed_tx, feed_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (update_tx, update_rx) = mpsc::channel(capacity);

        let subscription = backends.feed.subscribe(&conversation, feed_tx).await?;
        tracing::info!("Opened conversation {}", conversation);

        let session_loop = SessionLoop::new(
            conversation.clone(),
            config,
            backends,
            subscription,
            update_tx,
        );
        let task = tokio::spawn(session_loop.run(feed_rx, cmd_rx));

        Ok(Self {
            conversation,
            cmd_tx,
            update_rx,
            task,
        })
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Send a command to the session loop.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), SyncError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.send(SessionCommand::SendText(text.into())).await
    }

    pub async fn send_image(&self, bytes: Vec<u8>) -> Result<(), SyncError> {
        self.send(SessionCommand::SendImage(bytes)).await
    }

    pub async fn set_viewport_at_bottom(&self, at_bottom: bool) -> Result<(), SyncError> {
        self.send(SessionCommand::ViewportAtBottom(at_bottom)).await
    }

    /// Receive the next update.
    ///
    /// Returns `None` once the loop has exited. Designed to be used inside
    /// `tokio::select!`.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.update_rx.recv().await
    }

    /// Unsubscribe and stop the loop. In-flight transfers are left to finish
    /// on their own; their results are discarded.
    pub async fn close(self) {
        let Self {
            conversation,
            cmd_tx,
            update_rx,
            task,
        } = self;

        // Nobody reads updates any more; keep the loop from blocking on them.
        drop(update_rx);
        if cmd_tx.send(SessionCommand::Close).await.is_err() {
            tracing::debug!("Session loop for {} already stopped", conversation);
        }
        if let Err(e) = task.await {
            tracing::warn!("Session loop for {} ended abnormally: {}", conversation, e);
        }
        tracing::info!("Closed conversation {}", conversation);
    }
}
