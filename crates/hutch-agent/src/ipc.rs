//! Sandbox side of the follow-up channel.
//!
//! The host drops envelope files into `ipc/input/` inside the group
//! directory; the sandbox drains them between turns. A zero-byte
//! `_close` file tells the sandbox to wind down.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

use hutch_types::container::CLOSE_SENTINEL;
use hutch_types::ipc::FollowUpEnvelope;

/// What a follow-up wait resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum FollowUp {
    Messages(Vec<String>),
    Close,
}

/// Drain every pending follow-up file, oldest first. Each file is
/// deleted once read; malformed files are logged and deleted too, never
/// retried.
pub fn drain_inbox(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    let mut files: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "json"))
        .collect();
    files.sort();

    let mut texts = Vec::new();
    for path in files {
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<FollowUpEnvelope>(&bytes) {
                Ok(FollowUpEnvelope::Message { text }) => texts.push(text),
                Err(e) => warn!(file = %path.display(), "Discarding malformed follow-up: {e}"),
            },
            Err(e) => warn!(file = %path.display(), "Failed to read follow-up: {e}"),
        }
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(file = %path.display(), "Failed to delete follow-up: {e}");
        }
    }
    Ok(texts)
}

/// Consume the close sentinel if present. Concurrent consumers are fine;
/// a missing file just means someone else got there first.
pub fn should_close(dir: &Path) -> bool {
    let path = dir.join(CLOSE_SENTINEL);
    match std::fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to consume close sentinel: {e}");
            false
        }
    }
}

/// Poll the inbox at a fixed interval until messages or a close arrive.
/// Pending messages win over a simultaneous close.
pub async fn wait_for_followup(dir: &Path, interval: std::time::Duration) -> Result<FollowUp> {
    loop {
        let texts = drain_inbox(dir)?;
        if !texts.is_empty() {
            return Ok(FollowUp::Messages(texts));
        }
        if should_close(dir) {
            return Ok(FollowUp::Close);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drop_message(dir: &Path, name: &str, text: &str) {
        let body = serde_json::to_vec(&FollowUpEnvelope::Message { text: text.into() }).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn drain_returns_texts_in_name_order_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        drop_message(dir.path(), "002-b.json", "second");
        drop_message(dir.path(), "001-a.json", "first");

        let texts = drain_inbox(dir.path()).unwrap();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn drain_deletes_malformed_files_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "garbage").unwrap();
        drop_message(dir.path(), "good.json", "ok");

        let texts = drain_inbox(dir.path()).unwrap();
        assert_eq!(texts, vec!["ok".to_string()]);
        assert!(!dir.path().join("bad.json").exists());
    }

    #[test]
    fn drain_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(drain_inbox(&gone).unwrap().is_empty());
    }

    #[test]
    fn should_close_consumes_the_sentinel_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CLOSE_SENTINEL), b"").unwrap();
        assert!(should_close(dir.path()));
        assert!(!should_close(dir.path()));
    }

    #[tokio::test]
    async fn wait_returns_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        drop_message(dir.path(), "m.json", "hello");
        let got = wait_for_followup(dir.path(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got, FollowUp::Messages(vec!["hello".to_string()]));
    }

    #[tokio::test]
    async fn wait_returns_close_when_sentinel_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CLOSE_SENTINEL), b"").unwrap();
        let got = wait_for_followup(dir.path(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got, FollowUp::Close);
    }

    #[tokio::test]
    async fn messages_win_over_simultaneous_close() {
        let dir = tempfile::tempdir().unwrap();
        drop_message(dir.path(), "m.json", "late message");
        std::fs::write(dir.path().join(CLOSE_SENTINEL), b"").unwrap();
        let got = wait_for_followup(dir.path(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got, FollowUp::Messages(vec!["late message".to_string()]));
        // The sentinel stays for the post-turn close check.
        assert!(dir.path().join(CLOSE_SENTINEL).exists());
    }
}
