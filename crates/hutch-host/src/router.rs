//! Message router.
//!
//! Polls stored chat messages, decides which ones wake the agent for
//! their group, and turns the backlog since the agent last spoke into a
//! catch-up prompt.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use hutch_types::chat::{ChatMessage, Direction, RegisteredGroup};
use hutch_types::container::{TurnInput, TurnStatus};

use crate::channels::ChatTransport;
use crate::db::Database;
use crate::runner::{RunOutcome, TurnRunner};

pub struct Router {
    db: Arc<Database>,
    runner: Arc<dyn TurnRunner>,
    transport: Arc<dyn ChatTransport>,
    assistant_name: String,
    main_group_folder: String,
    api_key: Option<String>,
}

impl Router {
    pub fn new(
        db: Arc<Database>,
        runner: Arc<dyn TurnRunner>,
        transport: Arc<dyn ChatTransport>,
        assistant_name: String,
        main_group_folder: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            db,
            runner,
            transport,
            assistant_name,
            main_group_folder,
            api_key,
        }
    }

    /// One polling pass: pick up messages newer than the high-water mark
    /// for all registered chats and route each in arrival order.
    pub async fn poll_once(&self) -> Result<()> {
        let groups = self.db.registered_groups()?;
        if groups.is_empty() {
            return Ok(());
        }
        let chat_ids: Vec<String> = groups.keys().cloned().collect();
        let since = self.db.last_timestamp()?;
        let (messages, high_water) = self.db.new_messages(&chat_ids, &since)?;

        for msg in &messages {
            if let Err(e) = self.process_message(msg, &groups).await {
                warn!(chat = %msg.chat_id, "Failed to route message: {e}");
            }
        }

        if high_water != since {
            self.db.set_last_timestamp(&high_water)?;
        }
        Ok(())
    }

    pub async fn process_message(
        &self,
        msg: &ChatMessage,
        groups: &HashMap<String, RegisteredGroup>,
    ) -> Result<()> {
        let Some(group) = groups.get(&msg.chat_id) else {
            return Ok(());
        };

        let trigger = Regex::new(&group.trigger)
            .with_context(|| format!("Invalid trigger pattern for group {}", group.folder))?;
        if !trigger.is_match(msg.text.trim()) {
            return Ok(());
        }

        let since = self.db.last_agent_timestamp(&msg.chat_id)?;
        let backlog = self.db.messages_since(&msg.chat_id, &since)?;
        let prompt = render_prompt(&backlog);
        if prompt.is_empty() {
            debug!(chat = %msg.chat_id, "Trigger matched but backlog is empty");
            return Ok(());
        }

        info!(folder = %group.folder, messages = backlog.len(), "Waking agent");
        let input = TurnInput {
            prompt,
            session_id: self.db.session_id(&group.folder)?,
            group_folder: group.folder.clone(),
            chat_id: msg.chat_id.clone(),
            is_main: group.folder == self.main_group_folder,
            is_scheduled: false,
            secrets: self.secrets(),
        };

        let _ = self.transport.set_typing(&msg.chat_id, true).await;
        let outcome = self.runner.run(group, input).await;
        let _ = self.transport.set_typing(&msg.chat_id, false).await;

        // The agent has now seen (or will see, via follow-up) everything
        // up to this message, whatever the turn's fate.
        self.db
            .set_last_agent_timestamp(&msg.chat_id, &msg.timestamp)?;

        match outcome {
            Ok(RunOutcome::Completed(output)) => {
                if output.status == TurnStatus::Error {
                    warn!(folder = %group.folder, "Turn failed: {}",
                          output.error.as_deref().unwrap_or("unknown"));
                } else if let Some(result) = output.result {
                    let reply = format!("{}: {}", self.assistant_name, result);
                    self.transport.send_message(&msg.chat_id, &reply).await?;
                    self.db.store_message(&ChatMessage {
                        chat_id: msg.chat_id.clone(),
                        sender: self.assistant_name.clone(),
                        text: reply,
                        timestamp: Utc::now().to_rfc3339(),
                        direction: Direction::Out,
                    })?;
                }
            }
            Ok(RunOutcome::Queued) => {
                debug!(folder = %group.folder, "Prompt queued for live sandbox");
            }
            Err(e) => {
                warn!(folder = %group.folder, "Turn could not run: {e}");
            }
        }
        Ok(())
    }

    fn secrets(&self) -> HashMap<String, String> {
        let mut secrets = HashMap::new();
        if let Some(ref key) = self.api_key {
            secrets.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        secrets
    }
}

/// Render a message backlog as the catch-up prompt, oldest first.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(format_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_line(msg: &ChatMessage) -> String {
    let stamp = DateTime::parse_from_rfc3339(&msg.timestamp)
        .map(|t| t.format("[%b %-d %H:%M]").to_string())
        .unwrap_or_else(|_| "[?]".to_string());
    format!("{stamp} {}: {}", msg.sender, msg.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use hutch_types::chat::{Direction, RegisteredGroup};
    use hutch_types::container::TurnOutput;
    use std::sync::Mutex;

    struct MockRunner {
        inputs: Mutex<Vec<TurnInput>>,
        outcome: fn() -> Result<RunOutcome>,
    }

    #[async_trait]
    impl TurnRunner for MockRunner {
        async fn run(&self, _group: &RegisteredGroup, input: TurnInput) -> Result<RunOutcome> {
            self.inputs.lock().unwrap().push(input);
            (self.outcome)()
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(String, String)>>,
        typing: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn set_typing(&self, _chat_id: &str, on: bool) -> Result<()> {
            self.typing.lock().unwrap().push(on);
            Ok(())
        }
    }

    fn msg(chat_id: &str, sender: &str, text: &str, ts: &str) -> ChatMessage {
        ChatMessage {
            chat_id: chat_id.into(),
            sender: sender.into(),
            text: text.into(),
            timestamp: ts.into(),
            direction: Direction::In,
        }
    }

    fn registered(chat_id: &str, folder: &str, trigger: &str) -> HashMap<String, RegisteredGroup> {
        let mut groups = HashMap::new();
        groups.insert(
            chat_id.to_string(),
            RegisteredGroup {
                name: folder.to_string(),
                folder: folder.to_string(),
                trigger: trigger.to_string(),
                added_at: Utc::now(),
            },
        );
        groups
    }

    fn router_with(
        db: Arc<Database>,
        outcome: fn() -> Result<RunOutcome>,
    ) -> (Router, Arc<MockRunner>, Arc<MockTransport>) {
        let runner = Arc::new(MockRunner { inputs: Mutex::new(Vec::new()), outcome });
        let transport = Arc::new(MockTransport::default());
        let router = Router::new(
            db,
            runner.clone(),
            transport.clone(),
            "Hutch".to_string(),
            "main".to_string(),
            Some("sk-test".to_string()),
        );
        (router, runner, transport)
    }

    fn completed_with_result() -> Result<RunOutcome> {
        Ok(RunOutcome::Completed(TurnOutput::success(
            Some("hi there".to_string()),
            Some("s1".to_string()),
        )))
    }

    fn completed_silent() -> Result<RunOutcome> {
        Ok(RunOutcome::Completed(TurnOutput::success(None, None)))
    }

    fn run_fails() -> Result<RunOutcome> {
        Err(anyhow::anyhow!("spawn failed"))
    }

    #[test]
    fn render_prompt_formats_and_joins() {
        let messages = vec![
            msg("c", "ann", "hello", "2024-03-05T09:15:00Z"),
            msg("c", "bob", "@hutch hi", "2024-03-05T09:16:00Z"),
        ];
        let prompt = render_prompt(&messages);
        assert_eq!(
            prompt,
            "[Mar 5 09:15] ann: hello\n[Mar 5 09:16] bob: @hutch hi"
        );
    }

    #[test]
    fn render_prompt_empty_backlog() {
        assert_eq!(render_prompt(&[]), "");
    }

    #[tokio::test]
    async fn unregistered_chat_is_ignored() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (router, runner, _) = router_with(db, completed_with_result);
        let groups = registered("other", "g", "@hutch");
        router
            .process_message(&msg("stranger", "a", "@hutch hi", "2024-01-01T00:00:01Z"), &groups)
            .await
            .unwrap();
        assert!(runner.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_matching_text_is_ignored() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (router, runner, _) = router_with(db, completed_with_result);
        let groups = registered("c", "g", r"(?i)@hutch\b");
        router
            .process_message(&msg("c", "a", "just chatting", "2024-01-01T00:00:01Z"), &groups)
            .await
            .unwrap();
        assert!(runner.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn trigger_builds_catch_up_and_replies() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.store_message(&msg("c", "ann", "context line", "2024-03-05T09:15:00Z"))
            .unwrap();
        let trigger_msg = msg("c", "bob", "@hutch do it", "2024-03-05T09:16:00Z");
        db.store_message(&trigger_msg).unwrap();

        let (router, runner, transport) = router_with(db.clone(), completed_with_result);
        let groups = registered("c", "g", r"(?i)@hutch\b");
        router.process_message(&trigger_msg, &groups).await.unwrap();

        let inputs = runner.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(
            inputs[0].prompt,
            "[Mar 5 09:15] ann: context line\n[Mar 5 09:16] bob: @hutch do it"
        );
        assert_eq!(inputs[0].secrets["ANTHROPIC_API_KEY"], "sk-test");
        assert!(!inputs[0].is_main);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Hutch: hi there");

        assert_eq!(
            db.last_agent_timestamp("c").unwrap(),
            "2024-03-05T09:16:00Z"
        );
    }

    #[tokio::test]
    async fn catch_up_excludes_already_seen_messages() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.store_message(&msg("c", "ann", "old", "2024-03-05T09:00:00Z")).unwrap();
        db.set_last_agent_timestamp("c", "2024-03-05T09:00:00Z").unwrap();
        let trigger_msg = msg("c", "bob", "@hutch new", "2024-03-05T09:16:00Z");
        db.store_message(&trigger_msg).unwrap();

        let (router, runner, _) = router_with(db, completed_silent);
        let groups = registered("c", "g", r"(?i)@hutch\b");
        router.process_message(&trigger_msg, &groups).await.unwrap();

        let inputs = runner.inputs.lock().unwrap();
        assert_eq!(inputs[0].prompt, "[Mar 5 09:16] bob: @hutch new");
    }

    #[tokio::test]
    async fn timestamp_advances_even_when_run_fails() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let trigger_msg = msg("c", "bob", "@hutch hi", "2024-03-05T09:16:00Z");
        db.store_message(&trigger_msg).unwrap();

        let (router, _, transport) = router_with(db.clone(), run_fails);
        let groups = registered("c", "g", r"(?i)@hutch\b");
        router.process_message(&trigger_msg, &groups).await.unwrap();

        assert_eq!(
            db.last_agent_timestamp("c").unwrap(),
            "2024-03-05T09:16:00Z"
        );
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_success_sends_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let trigger_msg = msg("c", "bob", "@hutch hi", "2024-03-05T09:16:00Z");
        db.store_message(&trigger_msg).unwrap();

        let (router, _, transport) = router_with(db, completed_silent);
        let groups = registered("c", "g", r"(?i)@hutch\b");
        router.process_message(&trigger_msg, &groups).await.unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn main_group_flagged() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let trigger_msg = msg("c", "bob", "@hutch hi", "2024-03-05T09:16:00Z");
        db.store_message(&trigger_msg).unwrap();

        let (router, runner, _) = router_with(db, completed_silent);
        let groups = registered("c", "main", r"(?i)@hutch\b");
        router.process_message(&trigger_msg, &groups).await.unwrap();
        assert!(runner.inputs.lock().unwrap()[0].is_main);
    }
}
