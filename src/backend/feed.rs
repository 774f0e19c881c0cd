//! WebSocket change feed
//!
//! Each subscription owns one connection task. The server sends one JSON
//! [`ChangeEvent`] per text frame, replaying the conversation history as
//! `added` events on every (re)connect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{ChangeFeed, ConversationId, SubscriptionHandle};
use crate::config::Config;
use crate::models::ChangeEvent;
use crate::sync::SyncError;

/// Longest wait between reconnect attempts.
const MAX_BACKOFF_SECS: u64 = 64;

/// A connection that stayed up this long resets the backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Reason one connection ended.
enum DisconnectReason {
    /// The subscriber dropped its receiver. Do not reconnect.
    SinkClosed,
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

pub struct WsChangeFeed {
    base: Url,
    next_handle: AtomicU64,
    tasks: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl WsChangeFeed {
    pub fn new(config: &Config) -> Result<Self> {
        let raw = config
            .backend
            .feed_url
            .as_deref()
            .or(config.backend.store_url.as_deref())
            .context("No feed URL configured. Run 'chat-sync config --feed-url <url>'.")?;
        Self::with_base(raw)
    }

    pub fn with_base(base: &str) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("Invalid feed URL {}", base))?;
        Ok(Self {
            base,
            next_handle: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// WebSocket URL for a conversation's change stream.
    pub fn changes_url(&self, conversation: &ConversationId) -> String {
        let base = self
            .base
            .as_str()
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        format!("{}/conversations/{}/changes", base, conversation)
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> Result<SubscriptionHandle, SyncError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let url = self.changes_url(conversation);
        if let Err(e) = Url::parse(&url) {
            return Err(SyncError::Subscription(format!("bad feed URL {}: {}", url, e)));
        }
        tracing::info!("Subscribing to {} (handle {})", url, handle.0);

        let task = tokio::spawn(run_subscription(url, sink));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, task);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        match task {
            Some(task) => {
                task.abort();
                tracing::info!("Unsubscribed change feed (handle {})", handle.0);
            }
            None => tracing::debug!("Unsubscribe for unknown handle {}", handle.0),
        }
    }
}

/// Reconnect delay: 1s doubling up to 64s, reset after a stable connection.
#[derive(Debug)]
struct Backoff {
    secs: u64,
}

impl Backoff {
    fn new() -> Self {
        Self { secs: 1 }
    }

    /// Delay before the next attempt. `uptime` is how long the last
    /// connection stayed up, or `None` if it never connected.
    fn next_delay(&mut self, uptime: Option<Duration>) -> Duration {
        if uptime.is_some_and(|up| up >= STABLE_AFTER) {
            self.secs = 1;
        }
        let delay = Duration::from_secs(self.secs);
        self.secs = (self.secs * 2).min(MAX_BACKOFF_SECS);
        delay
    }
}

/// Keep a subscription alive until the sink closes.
async fn run_subscription(url: String, sink: mpsc::Sender<ChangeEvent>) {
    let mut backoff = Backoff::new();

    loop {
        let uptime = match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                tracing::info!("Change feed connected (status={})", response.status());
                let connected_at = Instant::now();
                match forward_frames(stream, &sink).await {
                    DisconnectReason::SinkClosed => {
                        tracing::debug!("Change feed sink closed, stopping {}", url);
                        return;
                    }
                    DisconnectReason::Error(e) => {
                        tracing::warn!("Change feed disconnected: {:#}", e);
                    }
                }
                Some(connected_at.elapsed())
            }
            Err(e) => {
                tracing::warn!("WebSocket connection to {} failed: {}", url, e);
                None
            }
        };

        let delay = backoff.next_delay(uptime);
        tracing::info!("Reconnecting change feed in {}s...", delay.as_secs());
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = sink.closed() => return,
        }
    }
}

/// Forward frames from one connection until it drops or the sink closes.
async fn forward_frames<S>(mut stream: S, sink: &mpsc::Sender<ChangeEvent>) -> DisconnectReason
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = sink.closed() => return DisconnectReason::SinkClosed,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let Some(event) = parse_frame(&text) else {
                    continue;
                };
                if sink.send(event).await.is_err() {
                    return DisconnectReason::SinkClosed;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return DisconnectReason::Error(anyhow::anyhow!("Closed by server: {:?}", frame));
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => return DisconnectReason::Error(anyhow::Error::new(e)),
            None => return DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server")),
        }
    }
}

/// Decode one text frame; unparseable frames are logged and skipped.
fn parse_frame(text: &str) -> Option<ChangeEvent> {
    match serde_json::from_str::<ChangeEvent>(text) {
        Ok(event) => {
            tracing::debug!("Feed event {:?} {}", event.kind, event.document_id);
            Some(event)
        }
        Err(e) => {
            tracing::warn!("Skipping unparseable feed frame ({}): {}", e, text);
            None
        }
    }
}
