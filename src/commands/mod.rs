//! CLI command implementations

mod chat;
mod replay;

pub use chat::{chat, send_image, send_message};
pub use replay::replay;

use anyhow::Result;

use crate::config::Config;
use crate::models::Message;

/// Show or update the stored configuration.
pub fn configure(
    sender_id: Option<String>,
    display_name: Option<String>,
    store_url: Option<String>,
    feed_url: Option<String>,
) -> Result<()> {
    let mut config = Config::load_or_init()?;
    let changed = apply_settings(&mut config, sender_id, display_name, store_url, feed_url);
    if changed {
        config.save()?;
        tracing::info!("Configuration saved");
    }

    println!("Config file: {}", Config::config_path()?.display());
    println!("  sender_id:          {}", config.user.sender_id);
    println!("  display_name:       {}", config.user.display_name);
    println!(
        "  store_url:          {}",
        config.backend.store_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  feed_url:           {}",
        config.backend.feed_url.as_deref().unwrap_or("(not set)")
    );
    println!("  max_download_bytes: {}", config.sync.max_download_bytes);
    println!("  identity:           {:?}", config.sync.identity);
    println!("  optimistic_send:    {}", config.sync.optimistic_send);
    Ok(())
}

fn apply_settings(
    config: &mut Config,
    sender_id: Option<String>,
    display_name: Option<String>,
    store_url: Option<String>,
    feed_url: Option<String>,
) -> bool {
    let mut changed = false;
    if let Some(id) = sender_id {
        config.user.sender_id = id;
        changed = true;
    }
    if let Some(name) = display_name {
        config.user.display_name = name;
        changed = true;
    }
    if let Some(url) = store_url {
        config.backend.store_url = Some(url);
        changed = true;
    }
    if let Some(url) = feed_url {
        config.backend.feed_url = Some(url);
        changed = true;
    }
    changed
}

/// One message as a terminal line: `[time] sender: content`.
fn format_line(message: &Message) -> String {
    let time = chrono::DateTime::from_timestamp_millis(message.created)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| message.created.to_string());
    format!(
        "[{}] {}: {}",
        time,
        message.sender.display_name,
        message.summary()
    )
}
