//! The host ↔ sandbox wire contract.
//!
//! Input: one `TurnInput` JSON document on the sandbox's stdin, then EOF.
//! Output: zero or more `TurnOutput` frames on the sandbox's stdout, each
//! a single JSON line between [`OUTPUT_START_MARKER`] and
//! [`OUTPUT_END_MARKER`] lines. Everything else on stdout is diagnostic
//! text and must be ignored by the host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Marker line opening one result frame on the sandbox's stdout.
pub const OUTPUT_START_MARKER: &str = "---HUTCH_OUTPUT_START---";
/// Marker line closing one result frame.
pub const OUTPUT_END_MARKER: &str = "---HUTCH_OUTPUT_END---";

/// Zero-byte marker file in a group's IPC input directory whose presence
/// ends the sandbox's follow-up wait. Idempotent to create.
pub const CLOSE_SENTINEL: &str = "_close";

/// Subdirectory (under a group dir) the sandbox polls for follow-ups.
pub const IPC_INPUT_DIR: &str = "ipc/input";

/// Filename of the read-only scheduled-task projection the host rewrites
/// before each spawn.
pub const TASKS_SNAPSHOT_FILE: &str = "tasks_snapshot.json";

/// Prefix marking a prompt as scheduler-injected rather than live chat.
/// Applied wherever a scheduled prompt enters a sandbox, whether at
/// spawn or as a follow-up to a running one.
pub const SCHEDULED_PROMPT_PREFIX: &str = "[scheduled task]";

/// Everything a sandbox process needs for its lifetime, delivered exactly
/// once via stdin. Secrets ride here and only here, never in the process
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnInput {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// One framed result block. A sandbox emits one per turn, plus a
/// null-result session-advance notification after each turn it survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutput {
    pub status: TurnStatus,
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnOutput {
    pub fn success(result: Option<String>, session_id: Option<String>) -> Self {
        Self {
            status: TurnStatus::Success,
            result,
            new_session_id: session_id,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            status: TurnStatus::Error,
            result: None,
            new_session_id: session_id,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_input_defaults_optional_fields() {
        let input: TurnInput = serde_json::from_str(
            r#"{"prompt":"hi","group_folder":"g","chat_id":"1","is_main":false}"#,
        )
        .unwrap();
        assert!(input.session_id.is_none());
        assert!(!input.is_scheduled);
        assert!(input.secrets.is_empty());
    }

    #[test]
    fn error_output_carries_session_id() {
        let out = TurnOutput::error("engine failed", Some("s-1".into()));
        let json = serde_json::to_string(&out).unwrap();
        let back: TurnOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, TurnStatus::Error);
        assert_eq!(back.new_session_id.as_deref(), Some("s-1"));
        assert!(back.result.is_none());
    }
}
