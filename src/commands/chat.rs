//! Live chat against the configured store and change feed

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::format_line;
use crate::backend::client::StoreClient;
use crate::backend::feed::WsChangeFeed;
use crate::backend::{AttachmentService, Backends, ConversationId, Persistence};
use crate::config::Config;
use crate::models::{Message, MessageRecord};
use crate::session::{ChatSession, SessionConfig, SessionUpdate};

/// Lines of history shown on each redraw.
const HISTORY_LINES: usize = 20;

/// Build the HTTP/WebSocket collaborators from config.
fn remote_backends(config: &Config) -> Result<Backends> {
    let client = Arc::new(StoreClient::new(config)?);
    let feed = Arc::new(WsChangeFeed::new(config)?);
    Ok(Backends {
        feed,
        store: client.clone(),
        attachments: client,
    })
}

/// Open a conversation, print it on every change and send what is typed.
///
/// A line starting with `/image ` sends the named file as an image.
/// EOF or Ctrl-C closes the conversation.
pub async fn chat(conversation: &str) -> Result<()> {
    let config = Config::load_or_init()?;
    let backends = remote_backends(&config)?;
    let conversation = ConversationId::new(conversation);

    let mut session = ChatSession::open(
        conversation.clone(),
        SessionConfig::from_config(&config),
        backends,
    )
    .await
    .with_context(|| format!("Failed to open conversation {}", conversation))?;

    println!(
        "Joined {} as {}. Type to send, /image <path> to send a picture, Ctrl-C to leave.",
        conversation, config.user.display_name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut image_enabled = true;

    loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(SessionUpdate::Render { messages, scroll_to_bottom }) => {
                    redraw(&messages, scroll_to_bottom);
                }
                Some(SessionUpdate::ImageSendEnabled(enabled)) => {
                    image_enabled = enabled;
                    if !enabled {
                        println!("(uploading image...)");
                    }
                }
                Some(SessionUpdate::SendFailed(e)) => {
                    tracing::warn!("Send failed: {}", e);
                }
                Some(SessionUpdate::Closed) | None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if let Some(path) = line.strip_prefix("/image ") {
                    if !image_enabled {
                        println!("(an image is still uploading)");
                        continue;
                    }
                    match tokio::fs::read(path.trim()).await {
                        Ok(bytes) => session.send_image(bytes).await?,
                        Err(e) => println!("Cannot read {}: {}", path.trim(), e),
                    }
                } else {
                    session.send_text(line).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Leaving {}...", session.conversation());
    session.close().await;
    Ok(())
}

fn redraw(messages: &[Message], scroll_to_bottom: bool) {
    let start = messages.len().saturating_sub(HISTORY_LINES);
    println!("{:-<60}", "");
    for message in &messages[start..] {
        println!("{}", format_line(message));
    }
    if !scroll_to_bottom {
        println!("(earlier message arrived)");
    }
}

/// Send a single text message without opening a session.
pub async fn send_message(to: &str, message: &str) -> Result<()> {
    let config = Config::load_or_init()?;
    let client = StoreClient::new(&config)?;
    let conversation = ConversationId::new(to);

    let msg = Message::text(config.sender(), chrono::Utc::now().timestamp_millis(), message);
    let record = MessageRecord::from_message(&msg)?;
    client.append(&conversation, record).await?;
    println!("Message sent.");
    Ok(())
}

/// Upload an image and send it without opening a session.
pub async fn send_image(to: &str, path: &Path) -> Result<()> {
    let config = Config::load_or_init()?;
    let client = StoreClient::new(&config)?;
    let conversation = ConversationId::new(to);

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    tracing::info!("Uploading {} ({} bytes)...", path.display(), bytes.len());
    let url = client.upload(&conversation, bytes).await?;

    let msg = Message::image(
        config.sender(),
        chrono::Utc::now().timestamp_millis(),
        None,
        Some(url),
    );
    let record = MessageRecord::from_message(&msg)?;
    client.append(&conversation, record).await?;
    println!("Image sent.");
    Ok(())
}
