//! Host-side IPC watcher.
//!
//! Sandboxes talk back to the host by dropping JSON envelope files into
//! `ipc/messages/` and `ipc/tasks/`. Each pass consumes every `.json`
//! file exactly once: applied files are deleted, failed files are moved
//! to `ipc/errors/` for inspection.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use hutch_types::ipc::{EnvelopeError, MessageEnvelope, TaskEnvelope};

use crate::channels::ChatTransport;
use crate::scheduler::Scheduler;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IpcPassStats {
    pub applied: usize,
    pub quarantined: usize,
}

/// One watcher pass over both envelope directories.
pub async fn process_ipc_pass(
    messages_dir: &Path,
    tasks_dir: &Path,
    errors_dir: &Path,
    transport: &dyn ChatTransport,
    scheduler: &Scheduler,
    assistant_name: &str,
) -> Result<IpcPassStats> {
    let mut stats = IpcPassStats::default();

    for path in envelope_files(messages_dir)? {
        let outcome = apply_message(&path, transport, assistant_name).await;
        consume(&path, errors_dir, outcome, &mut stats)?;
    }
    for path in envelope_files(tasks_dir)? {
        let outcome = apply_task(&path, scheduler);
        consume(&path, errors_dir, outcome, &mut stats)?;
    }
    Ok(stats)
}

/// `.json` files in lexicographic name order. A missing directory is an
/// empty pass, not an error.
fn envelope_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
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
    Ok(files)
}

fn consume(
    path: &Path,
    errors_dir: &Path,
    outcome: Result<(), EnvelopeError>,
    stats: &mut IpcPassStats,
) -> Result<()> {
    match outcome {
        Ok(()) => {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            stats.applied += 1;
        }
        Err(e) => {
            warn!(file = %path.display(), "Quarantining envelope: {e}");
            std::fs::create_dir_all(errors_dir)?;
            let dest = errors_dir.join(path.file_name().unwrap_or_default());
            std::fs::rename(path, &dest)
                .with_context(|| format!("Failed to quarantine {}", path.display()))?;
            stats.quarantined += 1;
        }
    }
    Ok(())
}

async fn apply_message(
    path: &Path,
    transport: &dyn ChatTransport,
    assistant_name: &str,
) -> Result<(), EnvelopeError> {
    let bytes = std::fs::read(path).map_err(|e| EnvelopeError::Apply(e.to_string()))?;
    let MessageEnvelope::Message { chat_id, text } = serde_json::from_slice(&bytes)?;
    transport
        .send_message(&chat_id, &format!("{assistant_name}: {text}"))
        .await
        .map_err(|e| EnvelopeError::Apply(e.to_string()))?;
    info!(%chat_id, "Delivered sandbox message");
    Ok(())
}

fn apply_task(path: &Path, scheduler: &Scheduler) -> Result<(), EnvelopeError> {
    let bytes = std::fs::read(path).map_err(|e| EnvelopeError::Apply(e.to_string()))?;
    let envelope: TaskEnvelope = serde_json::from_slice(&bytes)?;
    let result = match envelope {
        TaskEnvelope::ScheduleTask {
            prompt,
            schedule,
            schedule_value,
            group_folder,
            chat_id,
        } => scheduler
            .create_task(&group_folder, &chat_id, &prompt, schedule, &schedule_value)
            .map(|_| ()),
        TaskEnvelope::PauseTask { task_id } => scheduler.pause_task(&task_id),
        TaskEnvelope::ResumeTask { task_id } => scheduler.resume_task(&task_id),
        TaskEnvelope::CancelTask { task_id } => scheduler.cancel_task(&task_id),
    };
    result.map_err(|e| EnvelopeError::Apply(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hutch_types::chat::RegisteredGroup;
    use hutch_types::container::TurnInput;
    use hutch_types::task::TaskStatus;
    use std::sync::{Arc, Mutex};

    use crate::db::Database;
    use crate::runner::{RunOutcome, TurnRunner};

    struct NoopRunner;

    #[async_trait]
    impl TurnRunner for NoopRunner {
        async fn run(&self, _group: &RegisteredGroup, _input: TurnInput) -> Result<RunOutcome> {
            Ok(RunOutcome::Queued)
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("transport down");
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn set_typing(&self, _chat_id: &str, _on: bool) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        messages: std::path::PathBuf,
        tasks: std::path::PathBuf,
        errors: std::path::PathBuf,
        db: Arc<Database>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let messages = root.path().join("messages");
        let tasks = root.path().join("tasks");
        let errors = root.path().join("errors");
        std::fs::create_dir_all(&messages).unwrap();
        std::fs::create_dir_all(&tasks).unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(NoopRunner),
            Arc::new(MockTransport::default()),
            "Hutch".to_string(),
            None,
        );
        Fixture { _root: root, messages, tasks, errors, db, scheduler }
    }

    fn drop_file(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn valid_message_is_sent_and_deleted() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(
            &fx.messages,
            "001.json",
            r#"{"type":"message","chat_id":"42","text":"laundry is done"}"#,
        );

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats, IpcPassStats { applied: 1, quarantined: 0 });
        assert!(!fx.messages.join("001.json").exists());
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0], ("42".to_string(), "Hutch: laundry is done".to_string()));
    }

    #[tokio::test]
    async fn malformed_files_are_quarantined_valid_ones_applied() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(&fx.messages, "a.json", "not json at all");
        drop_file(
            &fx.messages,
            "b.json",
            r#"{"type":"message","chat_id":"1","text":"ok"}"#,
        );
        drop_file(&fx.messages, "c.json", r#"{"type":"unknown_kind"}"#);

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats, IpcPassStats { applied: 1, quarantined: 2 });
        assert!(fx.errors.join("a.json").exists());
        assert!(fx.errors.join("c.json").exists());
        assert!(!fx.messages.join("a.json").exists());
        assert!(!fx.messages.join("b.json").exists());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_quarantines_instead_of_deleting() {
        let fx = fixture();
        let transport = MockTransport { fail: true, ..Default::default() };
        drop_file(
            &fx.messages,
            "x.json",
            r#"{"type":"message","chat_id":"1","text":"hi"}"#,
        );

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats, IpcPassStats { applied: 0, quarantined: 1 });
        assert!(fx.errors.join("x.json").exists());
    }

    #[tokio::test]
    async fn schedule_task_envelope_creates_task() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(
            &fx.tasks,
            "t.json",
            r#"{"type":"schedule_task","prompt":"water plants","schedule":"interval",
               "schedule_value":"60000","group_folder":"home","chat_id":"42"}"#,
        );

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats.applied, 1);
        let tasks = fx.db.all_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].prompt, "water plants");
        assert_eq!(tasks[0].status, TaskStatus::Active);
        assert!(tasks[0].next_run.is_some());
    }

    #[tokio::test]
    async fn pause_unknown_task_is_quarantined() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(&fx.tasks, "p.json", r#"{"type":"pause_task","task_id":"nope"}"#);

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats, IpcPassStats { applied: 0, quarantined: 1 });
        assert!(fx.errors.join("p.json").exists());
    }

    #[tokio::test]
    async fn non_json_files_are_left_alone() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(&fx.messages, "notes.txt", "scratch");

        let stats = process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        assert_eq!(stats, IpcPassStats::default());
        assert!(fx.messages.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn files_processed_in_name_order() {
        let fx = fixture();
        let transport = MockTransport::default();
        drop_file(
            &fx.messages,
            "002.json",
            r#"{"type":"message","chat_id":"1","text":"second"}"#,
        );
        drop_file(
            &fx.messages,
            "001.json",
            r#"{"type":"message","chat_id":"1","text":"first"}"#,
        );

        process_ipc_pass(
            &fx.messages, &fx.tasks, &fx.errors, &transport, &fx.scheduler, "Hutch",
        )
        .await
        .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1, "Hutch: first");
        assert_eq!(sent[1].1, "Hutch: second");
    }
}
