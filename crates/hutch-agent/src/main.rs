mod engine;
mod ipc;

use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hutch_types::container::{
    TurnInput, TurnOutput, IPC_INPUT_DIR, OUTPUT_END_MARKER, OUTPUT_START_MARKER,
    SCHEDULED_PROMPT_PREFIX,
};

use engine::EngineSession;
use ipc::FollowUp;

const FOLLOWUP_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Containerized entrypoints sometimes stage the turn input on disk
/// before piping it; that copy must not outlive startup.
const STAGED_INPUT_FILE: &str = "input.json";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper_util=warn,hyper=warn,reqwest=warn,h2=warn,rustls=warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // The whole turn input arrives on stdin, then the host closes it.
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("Failed to read stdin")?;

    let input: TurnInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            emit_frame(&TurnOutput::error(format!("Malformed turn input: {e}"), None))?;
            anyhow::bail!("Malformed turn input: {e}");
        }
    };

    run(input).await
}

async fn run(input: TurnInput) -> Result<()> {
    engine::write_credentials(&input.secrets)?;
    // The key lives in the credentials file now, nowhere else.
    std::env::remove_var("ANTHROPIC_API_KEY");

    let workdir = std::env::current_dir()?;
    if workdir.join(STAGED_INPUT_FILE).exists() {
        if let Err(e) = std::fs::remove_file(workdir.join(STAGED_INPUT_FILE)) {
            warn!("Failed to remove staged input copy: {e}");
        }
    }

    let input_dir = workdir.join(IPC_INPUT_DIR);
    std::fs::create_dir_all(&input_dir)?;
    // A sentinel from a previous run must not end this one early.
    if ipc::should_close(&input_dir) {
        info!("Cleared stale close sentinel");
    }

    let api_key = match engine::load_credentials() {
        Ok(creds) => creds.api_key,
        Err(e) => {
            emit_frame(&TurnOutput::error("No API key available", input.session_id.clone()))?;
            return Err(e.context("No API key available"));
        }
    };

    let mut session = EngineSession::open(&workdir, input.session_id.clone(), api_key)?;
    info!(
        session = %session.id(),
        folder = %input.group_folder,
        resumed = input.session_id.is_some(),
        "Sandbox turn loop starting"
    );

    // Follow-ups that landed before we spawned belong to this turn.
    let mut prompt = input.prompt.clone();
    let pending = ipc::drain_inbox(&input_dir)?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Merging pre-spawn follow-ups into first turn");
        prompt.push('\n');
        prompt.push_str(&pending.join("\n"));
    }
    if input.is_scheduled {
        prompt = format!("{SCHEDULED_PROMPT_PREFIX} {prompt}");
    }

    loop {
        let result = match session.run_turn(&prompt).await {
            Ok(result) => result,
            Err(e) => {
                emit_frame(&TurnOutput::error(
                    e.to_string(),
                    Some(session.id().to_string()),
                ))?;
                return Err(e.context("Turn failed"));
            }
        };
        emit_frame(&TurnOutput::success(result, Some(session.id().to_string())))?;

        if ipc::should_close(&input_dir) {
            info!("Close sentinel received, winding down");
            break;
        }

        // Null-result frame telling the host the session survives and
        // waits for follow-ups.
        emit_frame(&TurnOutput::success(None, Some(session.id().to_string())))?;

        match ipc::wait_for_followup(&input_dir, FOLLOWUP_POLL).await? {
            FollowUp::Messages(texts) => {
                info!(count = texts.len(), "Running follow-up turn");
                prompt = texts.join("\n");
            }
            FollowUp::Close => {
                info!("Close sentinel received during wait, winding down");
                break;
            }
        }
    }
    Ok(())
}

fn emit_frame(output: &TurnOutput) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{OUTPUT_START_MARKER}")?;
    writeln!(out, "{}", serde_json::to_string(output)?)?;
    writeln!(out, "{OUTPUT_END_MARKER}")?;
    out.flush()?;
    Ok(())
}
