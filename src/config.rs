//! Agent and shell configuration.
//!
//! Loaded from a JSON file; environment variables provide defaults when no
//! file is present. Unknown fields are rejected so typos don't silently fall
//! back to defaults.
//!
//! Environment variables:
//! - `STEPWISE_MAX_STEPS` - step budget per run
//! - `STEPWISE_SHELL` - shell executable
//! - `STEPWISE_WORKDIR` - shell working directory
//! - `STEPWISE_COMMAND_TIMEOUT_SECS` - default per-command timeout

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::llm::ToolChoice;
use crate::tools::Terminate;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an agent that can execute tool calls";

pub const DEFAULT_NEXT_STEP_PROMPT: &str =
    "If you want to stop the interaction, use the `terminate` tool/function call.";

/// Settings for the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_prompt: Option<String>,
    pub max_steps: u32,
    /// Truncate tool observations to this many characters.
    pub max_observe: Option<usize>,
    /// Repeats of the last assistant reply before the agent counts as stuck.
    pub duplicate_threshold: usize,
    pub tool_choice: ToolChoice,
    /// Tools whose execution ends the run (case-insensitive).
    pub special_tools: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: "toolcall".to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            next_step_prompt: Some(DEFAULT_NEXT_STEP_PROMPT.to_string()),
            max_steps: 20,
            max_observe: Some(10_000),
            duplicate_threshold: 2,
            tool_choice: ToolChoice::Auto,
            special_tools: vec![Terminate::NAME.to_string()],
        }
    }
}

/// Settings for interactive shell sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellSettings {
    pub shell: String,
    /// Unset: the current directory locally, `/workspace` in a container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub default_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub close_grace_ms: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            working_dir: None,
            env: HashMap::new(),
            default_timeout_secs: 120,
            ready_timeout_secs: 10,
            close_grace_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub agent: AgentSettings,
    pub shell: ShellSettings,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Defaults, overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(steps) = env_parse::<u32>("STEPWISE_MAX_STEPS") {
            config.agent.max_steps = steps;
        }
        if let Ok(shell) = std::env::var("STEPWISE_SHELL") {
            config.shell.shell = shell;
        }
        if let Ok(dir) = std::env::var("STEPWISE_WORKDIR") {
            config.shell.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_parse::<u64>("STEPWISE_COMMAND_TIMEOUT_SECS") {
            config.shell.default_timeout_secs = secs;
        }
        config
    }

    /// Load from `path` if it exists and parses, otherwise fall back to
    /// [`Config::from_env`].
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(
                "No config file found at {}, using environment defaults",
                path.display()
            );
            return Self::from_env();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.display(),
                    e
                );
                Self::from_env()
            }
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, contents)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "agent": { "max_steps": 5, "tool_choice": "required" }, "shell": { "default_timeout_secs": 30 } }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.agent.max_steps, 5);
        assert_eq!(config.agent.tool_choice, ToolChoice::Required);
        assert_eq!(config.agent.duplicate_threshold, 2);
        assert_eq!(config.agent.special_tools, vec!["terminate"]);
        assert_eq!(config.shell.default_timeout_secs, 30);
        assert_eq!(config.shell.shell, "/bin/bash");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "agent": { "max_stpes": 5 } }"#).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("max_stpes"));
    }

    #[test]
    fn test_save_and_load_or_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let mut config = Config::default();
        config.agent.name = "saved".to_string();
        config.save(&path).unwrap();
        assert_eq!(Config::load_or_default(&path), config);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(Config::load_or_default(&path).agent.name, "toolcall");
    }
}
