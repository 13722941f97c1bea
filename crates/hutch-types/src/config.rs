use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub assistant: AssistantConfig,
    pub transport: TransportConfig,
    pub container: ContainerConfig,
    pub timing: TimingConfig,
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Display name: replies are prefixed `"{name}: "`.
    pub name: String,
    /// Regex tested against inbound message text to trigger a turn.
    pub trigger: String,
    /// Group folder treated as the privileged "main" group.
    pub main_group_folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub bot_token: String,
    /// User ids allowed to talk to the bot. Empty = allow all.
    #[serde(default)]
    pub allow_from: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Command that runs the sandboxed agent process. Empty = spawn the
    /// `hutch-agent` binary found next to the host executable. The
    /// placeholder `{group_dir}` is substituted into each argument.
    #[serde(default)]
    pub command: Vec<String>,
    /// Override for the data directory; empty = `~/.hutch/data`.
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub message_poll_ms: u64,
    pub ipc_poll_ms: u64,
    pub scheduler_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// LLM API key handed to the sandbox inside TurnInput.
    /// Env var `ANTHROPIC_API_KEY` takes priority at runtime.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig {
                name: "Hutch".to_string(),
                trigger: r"(?i)@hutch\b".to_string(),
                main_group_folder: "main".to_string(),
            },
            transport: TransportConfig {
                bot_token: String::new(),
                allow_from: vec![],
            },
            container: ContainerConfig {
                command: vec![],
                data_dir: String::new(),
            },
            timing: TimingConfig {
                message_poll_ms: 2_000,
                ipc_poll_ms: 1_000,
                scheduler_poll_ms: 5_000,
            },
            secrets: SecretsConfig { api_key: None },
        }
    }
}
