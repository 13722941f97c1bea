//! Container agent runner.
//!
//! Spawns one sandboxed agent process per group turn, feeds it the turn
//! input on stdin, and parses framed results from its stdout. At most
//! one sandbox is live per group folder; turns arriving while one is
//! live are handed to it as follow-up envelope files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hutch_types::chat::RegisteredGroup;
use hutch_types::config::ContainerConfig;
use hutch_types::container::{
    TurnInput, TurnOutput, TurnStatus, CLOSE_SENTINEL, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    SCHEDULED_PROMPT_PREFIX, TASKS_SNAPSHOT_FILE,
};
use hutch_types::ipc::FollowUpEnvelope;

use crate::config as paths;
use crate::db::Database;

/// Outcome of asking the runner for a turn.
#[derive(Debug)]
pub enum RunOutcome {
    /// A sandbox ran the turn and this is its first result.
    Completed(TurnOutput),
    /// A sandbox was already live for the group; the prompt was queued
    /// as a follow-up and any reply will arrive via the reply channel.
    Queued,
}

/// Reply produced by a follow-up turn, forwarded to the transport.
#[derive(Debug, Clone)]
pub struct Reply {
    pub chat_id: String,
    pub text: String,
}

#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run(&self, group: &RegisteredGroup, input: TurnInput) -> Result<RunOutcome>;
}

// ── Stdout frame parsing ────────────────────────────────────────────────

/// Incremental parser for marker-framed JSON on the sandbox's stdout.
/// Lines outside a frame are sandbox diagnostics and are ignored.
#[derive(Default)]
pub struct FrameParser {
    in_frame: bool,
    buf: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<Result<TurnOutput, serde_json::Error>> {
        let trimmed = line.trim_end();
        if trimmed == OUTPUT_START_MARKER {
            self.in_frame = true;
            self.buf.clear();
            return None;
        }
        if trimmed == OUTPUT_END_MARKER {
            if !self.in_frame {
                return None;
            }
            self.in_frame = false;
            return Some(serde_json::from_str(&self.buf));
        }
        if self.in_frame {
            self.buf.push_str(line);
            self.buf.push('\n');
        }
        None
    }
}

// ── Runner ──────────────────────────────────────────────────────────────

pub struct ContainerRunner {
    db: Arc<Database>,
    container: ContainerConfig,
    data_dir: PathBuf,
    reply_tx: mpsc::UnboundedSender<Reply>,
    /// Folders with a live sandbox.
    active: Arc<Mutex<HashSet<String>>>,
}

impl ContainerRunner {
    pub fn new(
        db: Arc<Database>,
        container: ContainerConfig,
        data_dir: PathBuf,
        reply_tx: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        Self {
            db,
            container,
            data_dir,
            reply_tx,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn group_dir(&self, folder: &str) -> PathBuf {
        paths::group_dir(&self.data_dir, folder)
    }

    /// Snapshot this group's scheduled tasks into the sandbox workdir so
    /// the agent can list them without host access.
    fn write_tasks_snapshot(&self, folder: &str, group_dir: &Path) -> Result<()> {
        let tasks: Vec<_> = self
            .db
            .all_tasks()?
            .into_iter()
            .filter(|t| t.group_folder == folder)
            .collect();
        let json = serde_json::to_string_pretty(&tasks)?;
        std::fs::write(group_dir.join(TASKS_SNAPSHOT_FILE), json)?;
        Ok(())
    }

    fn build_command(&self, group_dir: &Path) -> Result<tokio::process::Command> {
        let group_dir_str = group_dir.to_string_lossy();
        let mut cmd = if self.container.command.is_empty() {
            tokio::process::Command::new(find_agent_binary()?)
        } else {
            let argv: Vec<String> = self
                .container
                .command
                .iter()
                .map(|a| a.replace("{group_dir}", &group_dir_str))
                .collect();
            let mut cmd = tokio::process::Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };
        cmd.current_dir(group_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // The key travels only inside the turn input on stdin.
            .env_remove("ANTHROPIC_API_KEY");
        Ok(cmd)
    }
}

#[async_trait]
impl TurnRunner for ContainerRunner {
    async fn run(&self, group: &RegisteredGroup, input: TurnInput) -> Result<RunOutcome> {
        let folder = group.folder.clone();
        let group_dir = self.group_dir(&folder);
        let input_dir = paths::group_input_dir(&self.data_dir, &folder);
        std::fs::create_dir_all(&input_dir)
            .with_context(|| format!("Failed to create {}", input_dir.display()))?;

        {
            let mut active = self.active.lock().unwrap();
            if active.contains(&folder) {
                drop(active);
                // A running sandbox only annotates prompts it received at
                // spawn, so scheduled ones must arrive pre-annotated.
                let text = if input.is_scheduled {
                    format!("{SCHEDULED_PROMPT_PREFIX} {}", input.prompt)
                } else {
                    input.prompt.clone()
                };
                write_follow_up(&input_dir, &text)?;
                debug!(%folder, "Sandbox live, queued prompt as follow-up");
                return Ok(RunOutcome::Queued);
            }
            active.insert(folder.clone());
        }

        match self.spawn_turn(group, input, &group_dir, &input_dir).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.active.lock().unwrap().remove(&folder);
                Err(e)
            }
        }
    }
}

impl ContainerRunner {
    async fn spawn_turn(
        &self,
        group: &RegisteredGroup,
        input: TurnInput,
        group_dir: &Path,
        input_dir: &Path,
    ) -> Result<RunOutcome> {
        let folder = group.folder.clone();

        self.write_tasks_snapshot(&folder, group_dir)?;
        // A sentinel left by a previous sandbox must not close this one.
        let _ = std::fs::remove_file(input_dir.join(CLOSE_SENTINEL));

        let mut child = self
            .build_command(group_dir)?
            .spawn()
            .context("Failed to spawn sandbox agent")?;
        info!(%folder, pid = ?child.id(), "Spawned sandbox agent");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Sandbox stdin not available"))?;
        let payload = serde_json::to_vec(&input)?;
        stdin.write_all(&payload).await?;
        stdin.flush().await?;
        // Dropping stdin closes the pipe so the agent's read hits EOF.
        drop(stdin);

        if let Some(stderr) = child.stderr.take() {
            let folder = folder.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%folder, "agent: {line}");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Sandbox stdout not available"))?;
        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<TurnOutput>();
        {
            let db = self.db.clone();
            let folder = folder.clone();
            tokio::spawn(async move {
                let mut parser = FrameParser::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parser.push_line(&line) {
                        Some(Ok(output)) => {
                            // Persist the session id before the output is
                            // observed anywhere else.
                            if let Some(ref sid) = output.new_session_id {
                                if let Err(e) = db.set_session_id(&folder, sid) {
                                    error!(%folder, "Failed to persist session id: {e}");
                                }
                            }
                            if output_tx.send(output).is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(%folder, "Malformed output frame: {e}");
                        }
                        None => {}
                    }
                }
            });
        }

        let first = match output_rx.recv().await {
            Some(output) => output,
            None => {
                let status = child.wait().await;
                self.active.lock().unwrap().remove(&folder);
                let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                anyhow::bail!("Sandbox exited with code {code} before producing output");
            }
        };

        if first.status != TurnStatus::Error {
            maybe_write_close(input_dir);
        }

        // The attendant owns the rest of the sandbox lifetime: replies
        // for follow-up turns, close sentinels, child reaping.
        let reply_tx = self.reply_tx.clone();
        let chat_id = input.chat_id.clone();
        let input_dir = input_dir.to_path_buf();
        let active = self.active.clone();
        let folder_task = folder.clone();
        tokio::spawn(async move {
            let mut expect_advance = true;
            while let Some(output) = output_rx.recv().await {
                match output.status {
                    TurnStatus::Error => {
                        warn!(folder = %folder_task, "Sandbox reported error: {}",
                              output.error.as_deref().unwrap_or("unknown"));
                    }
                    TurnStatus::Success if expect_advance => {
                        // Session-advance frame, no result to deliver.
                        expect_advance = false;
                    }
                    TurnStatus::Success => {
                        if let Some(ref text) = output.result {
                            let _ = reply_tx.send(Reply {
                                chat_id: chat_id.clone(),
                                text: text.clone(),
                            });
                        }
                        maybe_write_close(&input_dir);
                        expect_advance = true;
                    }
                }
            }
            match child.wait().await {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    if code != 0 {
                        error!(folder = %folder_task, "Sandbox exited with code {code}");
                    } else {
                        info!(folder = %folder_task, "Sandbox exited cleanly");
                    }
                }
                Err(e) => error!(folder = %folder_task, "Failed to reap sandbox: {e}"),
            }
            active.lock().unwrap().remove(&folder_task);
        });

        Ok(RunOutcome::Completed(first))
    }
}

/// Queue a prompt for a live sandbox. Millisecond prefix keeps the drain
/// order chronological.
pub fn write_follow_up(input_dir: &Path, text: &str) -> Result<()> {
    let envelope = FollowUpEnvelope::Message { text: text.to_string() };
    let name = format!("{}-{}.json", Utc::now().timestamp_millis(), Uuid::new_v4());
    let path = input_dir.join(name);
    std::fs::write(&path, serde_json::to_vec(&envelope)?)
        .with_context(|| format!("Failed to write follow-up {}", path.display()))?;
    Ok(())
}

/// Tell the sandbox to wind down if no follow-ups are pending. Creating
/// the sentinel twice is harmless.
fn maybe_write_close(input_dir: &Path) {
    let pending = std::fs::read_dir(input_dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.path().extension().is_some_and(|x| x == "json"))
        })
        .unwrap_or(false);
    if !pending {
        if let Err(e) = std::fs::write(input_dir.join(CLOSE_SENTINEL), b"") {
            warn!("Failed to write close sentinel: {e}");
        }
    }
}

/// Find the sandbox agent binary next to the current executable.
fn find_agent_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot determine current exe path")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Current exe has no parent directory"))?;

    let name = if cfg!(target_os = "windows") {
        "hutch-agent.exe"
    } else {
        "hutch-agent"
    };
    let candidate = dir.join(name);
    if candidate.exists() {
        return Ok(candidate);
    }
    anyhow::bail!("Cannot find {name} next to {}", dir.display())
}
