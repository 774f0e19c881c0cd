//! Offline replay of a recorded change feed through an in-memory session

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use super::format_line;
use crate::backend::memory::MemoryBackend;
use crate::backend::{Backends, ConversationId};
use crate::config::Config;
use crate::models::{ChangeEvent, Message};
use crate::session::{ChatSession, SessionConfig, SessionUpdate};

/// The replay is considered settled after this long without an update.
const SETTLE: Duration = Duration::from_millis(250);

/// One redraw observed during a replay.
#[derive(Debug)]
pub struct Redraw {
    pub messages: Vec<Message>,
    pub scroll_to_bottom: bool,
}

/// Replay a JSON-lines file of change events and print what the reconciler makes of it.
pub async fn replay(path: &Path, detached: bool) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let events = parse_events(&text)?;
    tracing::info!("Replaying {} events from {}", events.len(), path.display());

    let config = Config::load_or_init()?;
    let redraws = replay_events(events, SessionConfig::from_config(&config), !detached).await?;

    for (n, redraw) in redraws.iter().enumerate() {
        let last = redraw.messages.last().map(format_line).unwrap_or_default();
        println!(
            "#{:<3} {} messages, scroll={}  last: {}",
            n + 1,
            redraw.messages.len(),
            redraw.scroll_to_bottom,
            last
        );
    }

    println!("\nFinal conversation:");
    println!("{:-<60}", "");
    match redraws.last() {
        Some(redraw) => {
            for message in &redraw.messages {
                println!("{}", format_line(message));
            }
        }
        None => println!("(no messages)"),
    }
    Ok(())
}

/// Parse one event per line; blank lines and `#` comments are skipped.
pub fn parse_events(text: &str) -> Result<Vec<ChangeEvent>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", n + 1))
        })
        .collect()
}

/// Feed events through a fresh session and collect every redraw until it settles.
pub async fn replay_events(
    events: Vec<ChangeEvent>,
    config: SessionConfig,
    viewport_at_bottom: bool,
) -> Result<Vec<Redraw>> {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = ConversationId::new("replay");
    let mut session = ChatSession::open(
        conversation.clone(),
        config,
        Backends::memory(backend.clone()),
    )
    .await?;
    session.set_viewport_at_bottom(viewport_at_bottom).await?;

    for event in events {
        backend.inject(&conversation, event).await;
    }

    let mut redraws = Vec::new();
    loop {
        match tokio::time::timeout(SETTLE, session.next_update()).await {
            Ok(Some(SessionUpdate::Render {
                messages,
                scroll_to_bottom,
            })) => redraws.push(Redraw {
                messages,
                scroll_to_bottom,
            }),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    session.close().await;
    Ok(redraws)
}
