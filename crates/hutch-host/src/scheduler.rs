//! Scheduled-task sweeps and task CRUD.
//!
//! Tasks fire through the same runner path as chat-triggered turns, so
//! the one-sandbox-per-group rule holds for them too.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hutch_types::chat::{ChatMessage, Direction};
use hutch_types::container::{TurnInput, TurnStatus};
use hutch_types::task::{ScheduleKind, ScheduledTask, TaskStatus};

use crate::channels::ChatTransport;
use crate::db::Database;
use crate::runner::{RunOutcome, TurnRunner};

pub struct Scheduler {
    db: Arc<Database>,
    runner: Arc<dyn TurnRunner>,
    transport: Arc<dyn ChatTransport>,
    assistant_name: String,
    api_key: Option<String>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        runner: Arc<dyn TurnRunner>,
        transport: Arc<dyn ChatTransport>,
        assistant_name: String,
        api_key: Option<String>,
    ) -> Self {
        Self { db, runner, transport, assistant_name, api_key }
    }

    /// One sweep: fire everything due, then reschedule it.
    pub async fn sweep(&self) -> Result<()> {
        let due = self.db.due_tasks(Utc::now())?;
        for task in due {
            if let Err(e) = self.fire(&task).await {
                warn!(task = %task.id, "Scheduled task failed: {e}");
            }
        }
        Ok(())
    }

    async fn fire(&self, task: &ScheduledTask) -> Result<()> {
        // The task may have been paused or cancelled since the due query.
        let Some(current) = self.db.get_task(&task.id)? else {
            debug!(task = %task.id, "Task vanished before firing");
            return Ok(());
        };
        if current.status != TaskStatus::Active {
            debug!(task = %task.id, status = %current.status, "Task no longer active, skipping");
            return Ok(());
        }

        let Some((chat_id, group)) = self.db.group_by_folder(&current.group_folder)? else {
            warn!(task = %task.id, folder = %current.group_folder,
                  "Group unregistered, pausing task");
            self.db.set_task_status(&current.id, TaskStatus::Paused)?;
            return Ok(());
        };

        info!(task = %current.id, folder = %group.folder, "Firing scheduled task");
        let mut secrets = HashMap::new();
        if let Some(ref key) = self.api_key {
            secrets.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        let input = TurnInput {
            prompt: current.prompt.clone(),
            session_id: self.db.session_id(&group.folder)?,
            group_folder: group.folder.clone(),
            chat_id: chat_id.clone(),
            is_main: false,
            is_scheduled: true,
            secrets,
        };

        let outcome = self.runner.run(&group, input).await;

        // Reschedule before inspecting the outcome so a failed run cannot
        // leave the task hot.
        self.reschedule(&current)?;

        match outcome {
            Ok(RunOutcome::Completed(output)) => {
                if output.status == TurnStatus::Error {
                    warn!(task = %current.id, "Task turn failed: {}",
                          output.error.as_deref().unwrap_or("unknown"));
                } else if let Some(result) = output.result {
                    let reply = format!("{}: {}", self.assistant_name, result);
                    self.transport.send_message(&chat_id, &reply).await?;
                    self.db.store_message(&ChatMessage {
                        chat_id: chat_id.clone(),
                        sender: self.assistant_name.clone(),
                        text: reply,
                        timestamp: Utc::now().to_rfc3339(),
                        direction: Direction::Out,
                    })?;
                }
            }
            Ok(RunOutcome::Queued) => {
                debug!(task = %current.id, "Task prompt queued for live sandbox");
            }
            Err(e) => warn!(task = %current.id, "Task turn could not run: {e}"),
        }
        Ok(())
    }

    fn reschedule(&self, task: &ScheduledTask) -> Result<()> {
        match task.schedule {
            ScheduleKind::Once => {
                self.db.set_task_status(&task.id, TaskStatus::Completed)?;
                self.db.set_task_next_run(&task.id, None)?;
            }
            ScheduleKind::Cron | ScheduleKind::Interval => {
                let next = compute_next_run(task.schedule, &task.schedule_value, Utc::now())?;
                self.db.set_task_next_run(&task.id, next)?;
            }
        }
        Ok(())
    }

    // ── CRUD, shared with the IPC watcher ───────────────────────────────

    pub fn create_task(
        &self,
        group_folder: &str,
        chat_id: &str,
        prompt: &str,
        schedule: ScheduleKind,
        schedule_value: &str,
    ) -> Result<ScheduledTask> {
        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            group_folder: group_folder.to_string(),
            chat_id: chat_id.to_string(),
            prompt: prompt.to_string(),
            schedule,
            schedule_value: schedule_value.to_string(),
            next_run: compute_next_run(schedule, schedule_value, now)?,
            status: TaskStatus::Active,
            created_at: now,
        };
        self.db.create_task(&task)?;
        info!(task = %task.id, folder = %group_folder, "Created scheduled task");
        Ok(task)
    }

    pub fn pause_task(&self, id: &str) -> Result<()> {
        self.require_task(id)?;
        self.db.set_task_status(id, TaskStatus::Paused)?;
        info!(task = %id, "Paused scheduled task");
        Ok(())
    }

    pub fn resume_task(&self, id: &str) -> Result<()> {
        let task = self.require_task(id)?;
        self.db.set_task_status(id, TaskStatus::Active)?;
        // A stale next_run would make the task fire immediately.
        match task.schedule {
            ScheduleKind::Once => {}
            _ => {
                let next = compute_next_run(task.schedule, &task.schedule_value, Utc::now())?;
                self.db.set_task_next_run(id, next)?;
            }
        }
        info!(task = %id, "Resumed scheduled task");
        Ok(())
    }

    pub fn cancel_task(&self, id: &str) -> Result<()> {
        self.require_task(id)?;
        self.db.delete_task(id)?;
        info!(task = %id, "Cancelled scheduled task");
        Ok(())
    }

    fn require_task(&self, id: &str) -> Result<ScheduledTask> {
        self.db
            .get_task(id)?
            .ok_or_else(|| anyhow::anyhow!("No task with id {id}"))
    }
}

/// When a task with the given schedule should next fire, measured from
/// `now`. `Once` resolves to its literal timestamp.
pub fn compute_next_run(
    kind: ScheduleKind,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Cron => {
            let schedule = Schedule::from_str(value)
                .with_context(|| format!("Invalid cron expression: {value}"))?;
            Ok(schedule.after(&now).next())
        }
        ScheduleKind::Interval => {
            let ms: i64 = value
                .parse()
                .with_context(|| format!("Invalid interval milliseconds: {value}"))?;
            Ok(Some(now + Duration::milliseconds(ms)))
        }
        ScheduleKind::Once => {
            let at = DateTime::parse_from_rfc3339(value)
                .with_context(|| format!("Invalid timestamp: {value}"))?;
            Ok(Some(at.with_timezone(&Utc)))
        }
    }
}
