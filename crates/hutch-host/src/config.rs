use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use hutch_types::config::HostConfig;
use hutch_types::container::IPC_INPUT_DIR;

/// Returns the hutch home directory (~/.hutch/)
pub fn hutch_home() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".hutch")
}

/// Returns the path to the config file (~/.hutch/config.toml)
pub fn config_path() -> PathBuf {
    hutch_home().join("config.toml")
}

/// Returns the database path (~/.hutch/hutch.db)
pub fn db_path() -> PathBuf {
    hutch_home().join("hutch.db")
}

/// Returns the data directory holding group workdirs and IPC directories.
pub fn data_dir(config: &HostConfig) -> PathBuf {
    if config.container.data_dir.is_empty() {
        hutch_home().join("data")
    } else {
        PathBuf::from(&config.container.data_dir)
    }
}

/// A group's working directory (mounted into its sandbox).
pub fn group_dir(data: &Path, folder: &str) -> PathBuf {
    data.join("groups").join(folder)
}

/// A group's follow-up inbox, polled by its sandbox.
pub fn group_input_dir(data: &Path, folder: &str) -> PathBuf {
    group_dir(data, folder).join(IPC_INPUT_DIR)
}

/// Host-side IPC directories, written by sandboxes and drained by the
/// IPC watcher.
pub fn ipc_messages_dir(data: &Path) -> PathBuf {
    data.join("ipc").join("messages")
}

pub fn ipc_tasks_dir(data: &Path) -> PathBuf {
    data.join("ipc").join("tasks")
}

pub fn ipc_errors_dir(data: &Path) -> PathBuf {
    data.join("ipc").join("errors")
}

/// Load config from disk, creating default if it doesn't exist.
pub fn load_config() -> Result<HostConfig> {
    let path = config_path();

    if !path.exists() {
        let home = hutch_home();
        std::fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create {}", home.display()))?;

        let default = HostConfig::default();
        let toml_str =
            toml::to_string_pretty(&default).context("Failed to serialize default config")?;
        std::fs::write(&path, &toml_str)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: HostConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// The API key handed to sandboxes. The `ANTHROPIC_API_KEY` env var
/// takes priority over the config file.
pub fn api_key(config: &HostConfig) -> Option<String> {
    std::env::var("ANTHROPIC_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| config.secrets.api_key.clone())
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(config: &HostConfig) -> Result<()> {
    let path = config_path();
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
