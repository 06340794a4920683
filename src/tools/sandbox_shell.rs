//! Shell tool running inside a container through an exec channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::bash::SessionSlot;
use super::{Tool, ToolResult};
use crate::session::{shell_quote, ExecConnector, RemoteLauncher, ShellOptions};

/// Execute shell commands in a persistent shell inside a sandbox container.
pub struct SandboxShellTool {
    slot: SessionSlot,
}

impl SandboxShellTool {
    pub fn new(connector: Arc<dyn ExecConnector>, options: ShellOptions) -> Self {
        Self {
            slot: SessionSlot::new(Arc::new(RemoteLauncher::new(connector)), options),
        }
    }
}

/// Prefix `command` with a `cd` into `folder` when one is given.
fn in_folder(command: &str, folder: Option<&str>) -> String {
    match folder.map(str::trim).filter(|f| !f.is_empty()) {
        Some(folder) => format!("cd {} && {}", shell_quote(folder), command),
        None => command.to_string(),
    }
}

/// Upper bound for a per-call timeout.
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Positive `timeout` seconds, capped at [`MAX_TIMEOUT`].
fn parse_timeout(args: &Value) -> Option<Duration> {
    let secs = args
        .get("timeout")
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s > 0.0)?;
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_TIMEOUT, |timeout| timeout.min(MAX_TIMEOUT)),
    )
}

#[async_trait]
impl Tool for SandboxShellTool {
    fn name(&self) -> &str {
        "sandbox_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the sandbox container. The shell persists \
        between calls and starts in the sandbox workspace. Use `folder` to run the \
        command in a subdirectory and `restart: true` after a timeout."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "folder": {
                    "type": "string",
                    "description": "Optional: directory to run the command in, relative to the current directory."
                },
                "timeout": {
                    "type": "number",
                    "description": "Timeout in seconds (default: the session's default timeout)."
                },
                "restart": {
                    "type": "boolean",
                    "description": "Discard the current shell and start a fresh one."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        if args["restart"].as_bool().unwrap_or(false) {
            return Ok(self.slot.restart().await);
        }

        let command = args["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("no command provided."))?;
        let command = in_folder(command, args["folder"].as_str());

        tracing::info!("Executing sandbox command: {}", command);
        Ok(self.slot.run(&command, parse_timeout(&args)).await)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.slot.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CommandConnector;

    #[test]
    fn test_in_folder() {
        assert_eq!(in_folder("ls", None), "ls");
        assert_eq!(in_folder("ls", Some("  ")), "ls");
        assert_eq!(in_folder("ls", Some("src")), "cd src && ls");
        assert_eq!(in_folder("ls", Some("my dir")), "cd 'my dir' && ls");
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(&json!({ "timeout": 2 })), Some(Duration::from_secs(2)));
        assert_eq!(parse_timeout(&json!({ "timeout": 0 })), None);
        assert_eq!(parse_timeout(&json!({})), None);
        assert_eq!(parse_timeout(&json!({ "timeout": -5 })), None);
        assert_eq!(parse_timeout(&json!({ "timeout": "soon" })), None);
        assert_eq!(parse_timeout(&json!({ "timeout": 1e300 })), Some(MAX_TIMEOUT));
        assert_eq!(parse_timeout(&json!({ "timeout": 1e12 })), Some(MAX_TIMEOUT));
        assert_eq!(parse_timeout(&json!({ "timeout": f64::NAN })), None);
    }

    #[tokio::test]
    async fn test_sandbox_shell_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let options = ShellOptions {
            working_dir: Some(workspace.clone()),
            close_grace: Duration::from_millis(10),
            ..ShellOptions::default()
        };
        let tool = SandboxShellTool::new(Arc::new(CommandConnector::new("env", vec![])), options);

        let result = tool
            .execute(json!({ "command": "mkdir -p sub && touch sub/marker" }))
            .await
            .unwrap();
        assert!(result.is_success());

        let result = tool
            .execute(json!({ "command": "ls", "folder": "sub" }))
            .await
            .unwrap();
        assert_eq!(result.output.as_deref(), Some("marker"));
        assert!(workspace.join("sub/marker").exists());

        let result = tool
            .execute(json!({ "command": "sleep 30", "timeout": 0.3 }))
            .await
            .unwrap();
        assert_eq!(result.system.as_deref(), Some("tool must be restarted"));
        tool.cleanup().await.unwrap();
    }
}
