//! Envelope shapes for the file-based IPC channel.
//!
//! Each envelope is one small JSON file dropped into a watched directory
//! and consumed exactly once: deleted after successful processing, moved
//! to a quarantine directory after a failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host→sandbox: a follow-up message for the group's running session,
/// dropped into the group's `ipc/input/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FollowUpEnvelope {
    Message { text: String },
}

/// Sandbox→host: an outgoing chat message, dropped into `ipc/messages/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEnvelope {
    Message { chat_id: String, text: String },
}

/// Sandbox→host: a scheduled-task mutation, dropped into `ipc/tasks/`.
/// One variant per mutation kind; unknown or ill-formed payloads fail at
/// parse and are quarantined, not inspected ad hoc.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEnvelope {
    ScheduleTask {
        prompt: String,
        schedule: crate::task::ScheduleKind,
        schedule_value: String,
        group_folder: String,
        chat_id: String,
    },
    PauseTask { task_id: String },
    ResumeTask { task_id: String },
    CancelTask { task_id: String },
}

/// Why an envelope file could not be consumed.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("envelope rejected: {0}")]
    Apply(String),
}
