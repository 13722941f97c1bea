use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use hutch_types::chat::{ChatMessage, Direction, GroupInfo, RegisteredGroup};
use hutch_types::task::{ScheduledTask, TaskStatus};

/// Internal chat id used for transport bookkeeping rows; never a real
/// group, always excluded from listings.
pub const GROUP_SYNC_SENTINEL: &str = "__group_sync__";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                chat_id           TEXT PRIMARY KEY,
                name              TEXT,
                last_message_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id   TEXT NOT NULL,
                sender    TEXT NOT NULL,
                text      TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                direction TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, timestamp);

            CREATE TABLE IF NOT EXISTS registered_groups (
                chat_id  TEXT PRIMARY KEY,
                name     TEXT NOT NULL,
                folder   TEXT NOT NULL UNIQUE,
                trigger  TEXT NOT NULL,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                group_folder TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS router_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_state (
                chat_id              TEXT PRIMARY KEY,
                last_agent_timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id             TEXT PRIMARY KEY,
                group_folder   TEXT NOT NULL,
                chat_id        TEXT NOT NULL,
                prompt         TEXT NOT NULL,
                schedule_kind  TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                next_run       TEXT,
                status         TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, next_run);",
        )?;
        Ok(())
    }

    // --- Chats ---

    /// Record that a chat exists and when it last had activity. Name is
    /// kept from the latest call that supplied one.
    pub fn store_chat_metadata(
        &self,
        chat_id: &str,
        last_message_time: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (chat_id, name, last_message_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET
                 last_message_time = excluded.last_message_time,
                 name = COALESCE(excluded.name, chats.name)",
            params![chat_id, name, last_message_time],
        )?;
        Ok(())
    }

    /// Chats ordered by most recent activity, excluding the internal
    /// sync sentinel, with registration flagged.
    pub fn available_groups(
        &self,
        registered: &HashMap<String, RegisteredGroup>,
    ) -> Result<Vec<GroupInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, name, last_message_time FROM chats
             WHERE chat_id != ?1
             ORDER BY last_message_time DESC",
        )?;
        let rows = stmt.query_map(params![GROUP_SYNC_SENTINEL], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut groups = Vec::new();
        for row in rows {
            let (chat_id, name, last_activity) = row?;
            let is_registered = registered.contains_key(&chat_id);
            groups.push(GroupInfo { chat_id, name, last_activity, is_registered });
        }
        Ok(groups)
    }

    // --- Messages ---

    pub fn store_message(&self, msg: &ChatMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (chat_id, sender, text, timestamp, direction)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.chat_id, msg.sender, msg.text, msg.timestamp, msg.direction.to_string()],
        )?;
        Ok(())
    }

    /// Inbound messages for the given chats with timestamp strictly after
    /// `since`, ascending (ties broken by insertion order). Also returns
    /// the new high-water timestamp.
    pub fn new_messages(
        &self,
        chat_ids: &[String],
        since: &str,
    ) -> Result<(Vec<ChatMessage>, String)> {
        if chat_ids.is_empty() {
            return Ok((Vec::new(), since.to_string()));
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; chat_ids.len()].join(", ");
        let sql = format!(
            "SELECT chat_id, sender, text, timestamp, direction FROM messages
             WHERE direction = 'in' AND timestamp > ? AND chat_id IN ({placeholders})
             ORDER BY timestamp ASC, id ASC",
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&since];
        for id in chat_ids {
            bound.push(id);
        }
        let rows = stmt.query_map(bound.as_slice(), row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(build_message(row?)?);
        }
        let high_water = messages
            .last()
            .map(|m| m.timestamp.clone())
            .unwrap_or_else(|| since.to_string());
        Ok((messages, high_water))
    }

    /// Inbound messages for one chat with timestamp strictly after
    /// `since`, ascending. The catch-up query.
    pub fn messages_since(&self, chat_id: &str, since: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, sender, text, timestamp, direction FROM messages
             WHERE direction = 'in' AND chat_id = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id, since], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(build_message(row?)?);
        }
        Ok(messages)
    }

    // --- Registered groups ---

    pub fn upsert_group(&self, chat_id: &str, group: &RegisteredGroup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO registered_groups (chat_id, name, folder, trigger, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id) DO UPDATE SET
                 name = excluded.name, folder = excluded.folder, trigger = excluded.trigger",
            params![
                chat_id,
                group.name,
                group.folder,
                group.trigger,
                group.added_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn registered_groups(&self) -> Result<HashMap<String, RegisteredGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, name, folder, trigger, added_at FROM registered_groups",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut groups = HashMap::new();
        for row in rows {
            let (chat_id, name, folder, trigger, added_at) = row?;
            groups.insert(
                chat_id,
                RegisteredGroup {
                    name,
                    folder,
                    trigger,
                    added_at: parse_ts(&added_at)?,
                },
            );
        }
        Ok(groups)
    }

    pub fn group_by_folder(&self, folder: &str) -> Result<Option<(String, RegisteredGroup)>> {
        Ok(self
            .registered_groups()?
            .into_iter()
            .find(|(_, g)| g.folder == folder))
    }

    // --- Sessions ---

    pub fn session_id(&self, group_folder: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT session_id FROM sessions WHERE group_folder = ?1")?;
        let mut rows = stmt.query(params![group_folder])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the persisted session id for a group. Called the moment
    /// a sandbox reports a new id, before anything else proceeds.
    pub fn set_session_id(&self, group_folder: &str, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_folder) DO UPDATE SET
                 session_id = excluded.session_id, updated_at = excluded.updated_at",
            params![group_folder, session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // --- Router state ---

    pub fn last_timestamp(&self) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT value FROM router_state WHERE key = 'last_timestamp'")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(String::new()),
        }
    }

    pub fn set_last_timestamp(&self, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES ('last_timestamp', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![value],
        )?;
        Ok(())
    }

    pub fn last_agent_timestamp(&self, chat_id: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT last_agent_timestamp FROM group_state WHERE chat_id = ?1")?;
        let mut rows = stmt.query(params![chat_id])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(String::new()),
        }
    }

    pub fn set_last_agent_timestamp(&self, chat_id: &str, ts: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO group_state (chat_id, last_agent_timestamp) VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET
                 last_agent_timestamp = excluded.last_agent_timestamp",
            params![chat_id, ts],
        )?;
        Ok(())
    }

    // --- Tasks ---

    pub fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, group_folder, chat_id, prompt, schedule_kind,
                                schedule_value, next_run, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.group_folder,
                task.chat_id,
                task.prompt,
                task.schedule.to_string(),
                task.schedule_value,
                task.next_run.map(|t| t.to_rfc3339()),
                task.status.to_string(),
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_id, prompt, schedule_kind, schedule_value,
                    next_run, status, created_at
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_task(row)?)),
            None => Ok(None),
        }
    }

    pub fn all_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_id, prompt, schedule_kind, schedule_value,
                    next_run, status, created_at
             FROM tasks ORDER BY created_at ASC",
        )?;
        let mut tasks = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)?);
        }
        Ok(tasks)
    }

    /// Active tasks whose next_run has passed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_id, prompt, schedule_kind, schedule_value,
                    next_run, status, created_at
             FROM tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC",
        )?;
        let mut tasks = Vec::new();
        let mut rows = stmt.query(params![now.to_rfc3339()])?;
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)?);
        }
        Ok(tasks)
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        Ok(())
    }

    pub fn set_task_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET next_run = ?1 WHERE id = ?2",
            params![next_run.map(|t| t.to_rfc3339()), id],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn row_to_message(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn build_message(
    (chat_id, sender, text, timestamp, direction): (String, String, String, String, String),
) -> Result<ChatMessage> {
    Ok(ChatMessage {
        chat_id,
        sender,
        text,
        timestamp,
        direction: direction.parse::<Direction>()?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<ScheduledTask> {
    let kind_str: String = row.get(4)?;
    let next_run_str: Option<String> = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        schedule: kind_str.parse()?,
        schedule_value: row.get(5)?,
        next_run: next_run_str.as_deref().map(parse_ts).transpose()?,
        status: status_str.parse()?,
        created_at: parse_ts(&created_str)?,
    })
}
