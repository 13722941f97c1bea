//! Telegram Bot API channel adapter.
//!
//! Runs long polling in a background task and delivers inbound group
//! messages over a channel; outbound sends go straight to the API.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChatTransport, TransportMessage};

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// User IDs allowed to interact with the bot. Empty means everyone.
    pub allow_from: Vec<i64>,
}

// ── Telegram API types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    first_name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    title: Option<String>,
}

/// The running Telegram adapter.
pub struct TelegramTransport {
    client: reqwest::Client,
    bot_token: String,
}

impl TelegramTransport {
    /// Start the adapter. Returns the transport handle and the inbound
    /// message stream.
    pub fn start(config: TelegramConfig) -> (Self, mpsc::UnboundedReceiver<TransportMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let client = reqwest::Client::new();
        let transport = Self {
            client: client.clone(),
            bot_token: config.bot_token.clone(),
        };

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            info!("Telegram adapter started (long polling)");

            loop {
                match get_updates(&client, &config.bot_token, offset, 30).await {
                    Ok(updates) => {
                        for update in updates {
                            offset = update.update_id + 1;
                            let Some(msg) = update.message else { continue };

                            let user_id = msg.from.as_ref().map(|u| u.id).unwrap_or(0);
                            if !config.allow_from.is_empty()
                                && !config.allow_from.contains(&user_id)
                            {
                                debug!(
                                    "Telegram: ignoring message from unauthorized user {user_id}"
                                );
                                continue;
                            }

                            let Some(text) = msg.text else { continue };
                            if text.is_empty() {
                                continue;
                            }

                            let sender = msg
                                .from
                                .as_ref()
                                .and_then(|u| {
                                    u.username.clone().or_else(|| u.first_name.clone())
                                })
                                .unwrap_or_else(|| user_id.to_string());
                            let timestamp = DateTime::<Utc>::from_timestamp(msg.date, 0)
                                .unwrap_or_else(Utc::now)
                                .to_rfc3339();

                            let inbound = TransportMessage {
                                chat_id: msg.chat.id.to_string(),
                                sender,
                                text,
                                timestamp,
                            };
                            debug!(chat = %msg.chat.title.as_deref().unwrap_or("?"),
                                   "Telegram inbound message");
                            if inbound_tx.send(inbound).is_err() {
                                error!("Telegram inbound channel closed");
                                return;
                            }
                        }
                    }
                    Err(e) if is_auth_error(&e) => {
                        // Credentials went bad. Polling cannot recover;
                        // the operator has to supply a fresh token.
                        error!("Telegram authentication failed, stopping poller: {e}");
                        return;
                    }
                    Err(e) => {
                        warn!("Telegram polling error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });

        (transport, inbound_rx)
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let id: i64 = chat_id.parse()?;
        send_message(&self.client, &self.bot_token, id, text).await
    }

    async fn set_typing(&self, chat_id: &str, on: bool) -> Result<()> {
        // Telegram chat actions expire on their own after ~5s, so "off"
        // has nothing to clear.
        if !on {
            return Ok(());
        }
        let id: i64 = chat_id.parse()?;
        send_chat_action(&self.client, &self.bot_token, id, "typing").await;
        Ok(())
    }
}

// ── API calls ───────────────────────────────────────────────────────────

fn is_auth_error(e: &anyhow::Error) -> bool {
    e.to_string().contains("HTTP 401")
}

async fn get_updates(
    client: &reqwest::Client,
    token: &str,
    offset: i64,
    timeout: u64,
) -> Result<Vec<TgUpdate>> {
    let url = format!("https://api.telegram.org/bot{token}/getUpdates");
    let resp = client
        .get(&url)
        .query(&[
            ("offset", offset.to_string()),
            ("timeout", timeout.to_string()),
            ("allowed_updates", r#"["message"]"#.to_string()),
        ])
        .timeout(std::time::Duration::from_secs(timeout + 10))
        .send()
        .await?;

    if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(anyhow::anyhow!("Telegram API error: HTTP 401"));
    }
    let resp: TgResponse<Vec<TgUpdate>> = resp.json().await?;

    if !resp.ok {
        return Err(anyhow::anyhow!(
            "Telegram API error: {}",
            resp.description.unwrap_or_default()
        ));
    }
    Ok(resp.result.unwrap_or_default())
}

async fn send_message(
    client: &reqwest::Client,
    token: &str,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");

    // Telegram has a 4096 char limit. Split if needed.
    let chunks = split_message(text, 4096);
    for chunk in chunks {
        let params = serde_json::json!({
            "chat_id": chat_id,
            "text": chunk,
            "parse_mode": "Markdown",
        });

        let resp: TgResponse<serde_json::Value> =
            client.post(&url).json(&params).send().await?.json().await?;

        if !resp.ok {
            // Retry without Markdown if parse fails
            let params = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            client.post(&url).json(&params).send().await?;
        }
    }
    Ok(())
}

/// Send a chat action (e.g. "typing") to a Telegram chat.
/// Failures are logged as warnings and never propagated.
async fn send_chat_action(client: &reqwest::Client, token: &str, chat_id: i64, action: &str) {
    let url = format!("https://api.telegram.org/bot{token}/sendChatAction");
    let params = serde_json::json!({
        "chat_id": chat_id,
        "action": action,
    });
    match client.post(&url).json(&params).send().await {
        Ok(resp) => {
            if !resp.status().is_success() {
                warn!("sendChatAction failed: HTTP {}", resp.status());
            }
        }
        Err(e) => {
            warn!("sendChatAction error: {e}");
        }
    }
}

fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        // The cut must land on a char boundary, never inside a
        // multi-byte character.
        let mut end = (start + max_len).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // One character wider than the limit; emit it whole.
            let width = text[start..]
                .chars()
                .next()
                .map(|c| c.len_utf8())
                .unwrap_or(text.len() - start);
            end = start + width;
        }
        // Try to split at a newline
        let split_at = if end < text.len() {
            text[start..end].rfind('\n').map(|i| start + i + 1).unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..split_at]);
        start = split_at;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 4096), vec!["hello"]);
    }

    #[test]
    fn long_message_splits_at_newlines() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn long_message_without_newlines_hard_splits() {
        let text = "x".repeat(30);
        let chunks = split_message(&text, 12);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        // 2-byte chars with a limit that lands mid-character.
        let text = "é".repeat(10);
        let chunks = split_message(&text, 5);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= 5);
            assert!(!chunk.is_empty());
        }

        let text = "🦀".repeat(3);
        let chunks = split_message(&text, 6);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= 6);
        }
    }

    #[test]
    fn character_wider_than_limit_is_emitted_whole() {
        let text = "🦀🦀";
        let chunks = split_message(text, 2);
        assert_eq!(chunks, vec!["🦀", "🦀"]);
    }
}
