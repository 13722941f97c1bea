//! Streaming LLM engine session.
//!
//! One `EngineSession` per sandbox lifetime. The transcript lives under
//! `.sessions/<id>.json` in the working directory, so resuming with the
//! same session id restores the conversation.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const MAX_TOKENS: u32 = 8192;
const SESSIONS_DIR: &str = ".sessions";

const SYSTEM_PROMPT: &str = "You are a helpful assistant embedded in a group chat. \
You receive the recent conversation as timestamped lines and reply for the whole \
group to read. Keep replies short and conversational. If nothing needs saying, \
reply with an empty message.";

// ── Credentials ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
}

fn credentials_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot determine home directory")?;
    Ok(home.join(".hutch-agent").join("credentials.toml"))
}

/// Persist the API key from the turn input so it never has to live in
/// the process environment.
pub fn write_credentials(secrets: &HashMap<String, String>) -> Result<()> {
    let Some(api_key) = secrets.get("ANTHROPIC_API_KEY") else {
        return Ok(());
    };
    let path = credentials_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let creds = Credentials { api_key: api_key.clone() };
    std::fs::write(&path, toml::to_string_pretty(&creds)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn load_credentials() -> Result<Credentials> {
    let path = credentials_path()?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("No credentials at {}", path.display()))?;
    toml::from_str(&raw).context("Malformed credentials file")
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [TranscriptMessage],
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SseEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: SseDelta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SseDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

// ── Session ─────────────────────────────────────────────────────────────

pub struct EngineSession {
    id: String,
    client: reqwest::Client,
    api_key: String,
    model: String,
    workdir: PathBuf,
    transcript: Vec<TranscriptMessage>,
}

impl EngineSession {
    /// Open a session in `workdir`. An existing id resumes its stored
    /// transcript; no id starts a fresh session.
    pub fn open(workdir: &Path, session_id: Option<String>, api_key: String) -> Result<Self> {
        let (id, transcript) = match session_id {
            Some(id) => {
                let transcript = load_transcript(workdir, &id)?;
                (id, transcript)
            }
            None => (Uuid::new_v4().to_string(), Vec::new()),
        };
        Ok(Self {
            id,
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            workdir: workdir.to_path_buf(),
            transcript,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one turn: send the prompt with the full transcript, stream the
    /// response, persist both sides. Empty response text resolves to
    /// `None` (the agent chose to stay silent).
    pub async fn run_turn(&mut self, prompt: &str) -> Result<Option<String>> {
        self.transcript.push(TranscriptMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let text = self.stream_completion().await?;

        self.transcript.push(TranscriptMessage {
            role: "assistant".to_string(),
            content: text.clone(),
        });
        self.flush()?;

        if text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }

    async fn stream_completion(&self) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT,
            messages: &self.transcript,
            stream: true,
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error ({status}): {body}");
        }

        let mut stream = response.bytes_stream();
        let mut sse_buffer = String::new();
        let mut text = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading streaming response")?;
            sse_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Complete SSE messages are separated by blank lines.
            while let Some(pos) = sse_buffer.find("\n\n") {
                let message = sse_buffer[..pos].to_string();
                sse_buffer = sse_buffer[pos + 2..].to_string();

                match parse_sse_message(&message) {
                    Some(SseEvent::ContentBlockDelta { delta: SseDelta::TextDelta { text: t } }) => {
                        text.push_str(&t);
                    }
                    Some(SseEvent::ContentBlockDelta { delta: SseDelta::Other }) => {
                        debug!("Ignoring non-text delta");
                    }
                    Some(SseEvent::MessageStop) => break 'outer,
                    Some(SseEvent::Ping) | None => {}
                    Some(SseEvent::Other) => debug!("Ignoring non-text stream event"),
                }
            }
        }

        Ok(text)
    }

    fn transcript_path(&self) -> PathBuf {
        transcript_path(&self.workdir, &self.id)
    }

    pub fn flush(&self) -> Result<()> {
        let path = self.transcript_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&self.transcript)?)
            .with_context(|| format!("Failed to write transcript {}", path.display()))?;
        Ok(())
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush transcript on exit: {e}");
        }
    }
}

fn transcript_path(workdir: &Path, id: &str) -> PathBuf {
    workdir.join(SESSIONS_DIR).join(format!("{id}.json"))
}

fn load_transcript(workdir: &Path, id: &str) -> Result<Vec<TranscriptMessage>> {
    let path = transcript_path(workdir, id);
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed transcript {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Parse one SSE message block ("event: ..." and "data: ..." lines).
fn parse_sse_message(message: &str) -> Option<SseEvent> {
    let mut data_line: Option<&str> = None;
    for line in message.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            data_line = Some(data);
        }
    }
    let data = data_line?;
    if data == "[DONE]" {
        return Some(SseEvent::MessageStop);
    }
    serde_json::from_str(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_delta_event() {
        let msg = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}";
        match parse_sse_message(msg) {
            Some(SseEvent::ContentBlockDelta { delta: SseDelta::TextDelta { text } }) => {
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_event_is_other() {
        let msg = r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use"}}"#;
        assert!(matches!(parse_sse_message(msg), Some(SseEvent::Other)));
    }

    #[test]
    fn parse_done_is_stop() {
        assert!(matches!(
            parse_sse_message("data: [DONE]"),
            Some(SseEvent::MessageStop)
        ));
    }

    #[test]
    fn parse_message_without_data_is_none() {
        assert!(parse_sse_message("event: ping").is_none());
    }

    #[test]
    fn fresh_session_gets_an_id_and_empty_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let session = EngineSession::open(dir.path(), None, "k".into()).unwrap();
        assert!(!session.id().is_empty());
        assert!(session.transcript.is_empty());
    }

    #[test]
    fn transcript_survives_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let mut session = EngineSession::open(dir.path(), None, "k".into()).unwrap();
            id = session.id().to_string();
            session.transcript.push(TranscriptMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            });
            session.flush().unwrap();
        }
        let resumed = EngineSession::open(dir.path(), Some(id.clone()), "k".into()).unwrap();
        assert_eq!(resumed.id(), id);
        assert_eq!(resumed.transcript.len(), 1);
        assert_eq!(resumed.transcript[0].content, "hello");
    }

    #[test]
    fn resuming_unknown_id_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session =
            EngineSession::open(dir.path(), Some("never-seen".into()), "k".into()).unwrap();
        assert_eq!(session.id(), "never-seen");
        assert!(session.transcript.is_empty());
    }

    #[test]
    fn credentials_roundtrip_via_toml() {
        let creds = Credentials { api_key: "sk-abc".into() };
        let raw = toml::to_string_pretty(&creds).unwrap();
        let back: Credentials = toml::from_str(&raw).unwrap();
        assert_eq!(back.api_key, "sk-abc");
    }
}
