use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use hutch_host::channels::telegram::{TelegramConfig, TelegramTransport};
use hutch_host::channels::ChatTransport;
use hutch_host::config;
use hutch_host::db::Database;
use hutch_host::ipc::process_ipc_pass;
use hutch_host::router::Router;
use hutch_host::runner::{ContainerRunner, Reply};
use hutch_host::scheduler::Scheduler;
use hutch_types::chat::{ChatMessage, Direction, RegisteredGroup};

#[derive(Parser)]
#[command(name = "hutch", version, about = "Hutch, a group-chat agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator (default)
    Run,
    /// Show current status
    Status,
    /// List known chats and their registration state
    Groups,
    /// Register a chat as an agent group
    Register {
        chat_id: String,
        name: String,
        folder: String,
        /// Trigger pattern; defaults to the configured assistant trigger
        #[arg(long)]
        trigger: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run().await,
        Some(Commands::Status) => status(),
        Some(Commands::Groups) => groups(),
        Some(Commands::Register { chat_id, name, folder, trigger }) => {
            register(chat_id, name, folder, trigger)
        }
    }
}

async fn run() -> Result<()> {
    let cfg = config::load_config()?;
    if cfg.transport.bot_token.is_empty() {
        anyhow::bail!(
            "No bot token configured; set transport.bot_token in {}",
            config::config_path().display()
        );
    }

    let db = Arc::new(Database::open(&config::db_path())?);
    let data_dir = config::data_dir(&cfg);
    std::fs::create_dir_all(config::ipc_messages_dir(&data_dir))?;
    std::fs::create_dir_all(config::ipc_tasks_dir(&data_dir))?;

    let (transport, mut inbound_rx) = TelegramTransport::start(TelegramConfig {
        bot_token: cfg.transport.bot_token.clone(),
        allow_from: cfg.transport.allow_from.clone(),
    });
    let transport: Arc<dyn ChatTransport> = Arc::new(transport);

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<Reply>();
    let runner = Arc::new(ContainerRunner::new(
        db.clone(),
        cfg.container.clone(),
        data_dir.clone(),
        reply_tx,
    ));
    let router = Router::new(
        db.clone(),
        runner.clone(),
        transport.clone(),
        cfg.assistant.name.clone(),
        cfg.assistant.main_group_folder.clone(),
        config::api_key(&cfg),
    );
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        runner,
        transport.clone(),
        cfg.assistant.name.clone(),
        config::api_key(&cfg),
    ));

    // Ingest: store every inbound message before routing sees it.
    {
        let db = db.clone();
        tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                let msg = ChatMessage {
                    chat_id: inbound.chat_id,
                    sender: inbound.sender,
                    text: inbound.text,
                    timestamp: inbound.timestamp,
                    direction: Direction::In,
                };
                if let Err(e) = db.store_chat_metadata(&msg.chat_id, &msg.timestamp, None) {
                    error!("Failed to store chat metadata: {e}");
                }
                if let Err(e) = db.store_message(&msg) {
                    error!("Failed to store message: {e}");
                }
            }
        });
    }

    // Follow-up turn replies from sandbox attendants.
    {
        let db = db.clone();
        let transport = transport.clone();
        let assistant = cfg.assistant.name.clone();
        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                let text = format!("{assistant}: {}", reply.text);
                if let Err(e) = transport.send_message(&reply.chat_id, &text).await {
                    error!(chat = %reply.chat_id, "Failed to deliver reply: {e}");
                    continue;
                }
                let record = ChatMessage {
                    chat_id: reply.chat_id,
                    sender: assistant.clone(),
                    text,
                    timestamp: Utc::now().to_rfc3339(),
                    direction: Direction::Out,
                };
                if let Err(e) = db.store_message(&record) {
                    error!("Failed to store outbound message: {e}");
                }
            }
        });
    }

    // Message poll loop.
    {
        let mut tick = interval(Duration::from_millis(cfg.timing.message_poll_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                if let Err(e) = router.poll_once().await {
                    warn!("Message poll failed: {e}");
                }
            }
        });
    }

    // IPC watcher loop.
    {
        let transport = transport.clone();
        let scheduler = scheduler.clone();
        let assistant = cfg.assistant.name.clone();
        let messages_dir = config::ipc_messages_dir(&data_dir);
        let tasks_dir = config::ipc_tasks_dir(&data_dir);
        let errors_dir = config::ipc_errors_dir(&data_dir);
        let mut tick = interval(Duration::from_millis(cfg.timing.ipc_poll_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                match process_ipc_pass(
                    &messages_dir,
                    &tasks_dir,
                    &errors_dir,
                    transport.as_ref(),
                    &scheduler,
                    &assistant,
                )
                .await
                {
                    Ok(stats) if stats.quarantined > 0 => {
                        warn!(quarantined = stats.quarantined, "IPC pass had failures");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("IPC pass failed: {e}"),
                }
            }
        });
    }

    // Scheduler sweep loop.
    {
        let scheduler = scheduler.clone();
        let mut tick = interval(Duration::from_millis(cfg.timing.scheduler_poll_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                if let Err(e) = scheduler.sweep().await {
                    warn!("Scheduler sweep failed: {e}");
                }
            }
        });
    }

    info!("Hutch running as {}", cfg.assistant.name);
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

fn status() -> Result<()> {
    let cfg = config::load_config()?;
    let db = Database::open(&config::db_path())?;
    let groups = db.registered_groups()?;
    println!("Hutch v{}", env!("CARGO_PKG_VERSION"));
    println!("Assistant: {}", cfg.assistant.name);
    println!("Trigger: {}", cfg.assistant.trigger);
    println!(
        "Bot token: {}",
        if cfg.transport.bot_token.is_empty() { "not set" } else { "configured" }
    );
    println!(
        "API key: {}",
        if config::api_key(&cfg).is_some() { "configured" } else { "not set" }
    );
    println!("Registered groups: {}", groups.len());
    println!("Config: {}", config::config_path().display());
    println!("Database: {}", config::db_path().display());
    Ok(())
}

fn groups() -> Result<()> {
    let db = Database::open(&config::db_path())?;
    let registered = db.registered_groups()?;
    let available = db.available_groups(&registered)?;
    if available.is_empty() {
        println!("No chats seen yet.");
        return Ok(());
    }
    for group in available {
        let mark = if group.is_registered { "*" } else { " " };
        println!(
            "{mark} {}  {}  (last activity {})",
            group.chat_id,
            group.name.as_deref().unwrap_or("-"),
            group.last_activity
        );
    }
    println!("\n* = registered");
    Ok(())
}

fn register(
    chat_id: String,
    name: String,
    folder: String,
    trigger: Option<String>,
) -> Result<()> {
    let cfg = config::load_config()?;
    let db = Database::open(&config::db_path())?;
    let group = RegisteredGroup {
        name: name.clone(),
        folder: folder.clone(),
        trigger: effective_trigger(trigger, &cfg.assistant.trigger),
        added_at: Utc::now(),
    };
    db.upsert_group(&chat_id, &group)?;

    let data_dir = config::data_dir(&cfg);
    let input_dir = config::group_input_dir(&data_dir, &folder);
    std::fs::create_dir_all(&input_dir)
        .with_context(|| format!("Failed to create {}", input_dir.display()))?;

    println!("Registered {name} ({chat_id}) -> {folder}");
    Ok(())
}

fn effective_trigger(explicit: Option<String>, default_trigger: &str) -> String {
    explicit.unwrap_or_else(|| default_trigger.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_trigger_wins_over_configured_default() {
        assert_eq!(
            effective_trigger(Some("@bot".into()), r"(?i)@hutch\b"),
            "@bot"
        );
        assert_eq!(
            effective_trigger(None, r"(?i)@hutch\b"),
            r"(?i)@hutch\b"
        );
    }
}
