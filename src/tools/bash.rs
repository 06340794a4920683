//! Interactive bash tool over a persistent local shell.
//!
//! The shell outlives individual calls, so `cd`, exported variables and
//! background jobs carry over. A timed-out or exited shell is never reused;
//! the model has to pass `restart: true`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{Tool, ToolResult};
use crate::session::{LocalLauncher, SessionState, ShellLauncher, ShellOptions, ShellSession};

/// A lazily started session shared by every call of one tool.
pub(crate) struct SessionSlot {
    launcher: Arc<dyn ShellLauncher>,
    options: ShellOptions,
    session: Mutex<Option<ShellSession>>,
}

impl SessionSlot {
    pub(crate) fn new(launcher: Arc<dyn ShellLauncher>, options: ShellOptions) -> Self {
        Self {
            launcher,
            options,
            session: Mutex::new(None),
        }
    }

    /// Run `command`, starting the shell on first use.
    pub(crate) async fn run(&self, command: &str, timeout: Option<Duration>) -> ToolResult {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let mut session = ShellSession::new(self.launcher.clone(), self.options.clone());
            if let Err(e) = session.start().await {
                return ToolResult::from_session_error(&e);
            }
            *guard = Some(session);
        }
        let Some(session) = guard.as_mut() else {
            return ToolResult::failure("shell session is not available");
        };

        match session.run(command, timeout).await {
            Ok(output) => ToolResult::from_command(output),
            Err(e) => {
                tracing::warn!("Shell command failed via {}: {}", self.launcher.describe(), e);
                ToolResult::from_session_error(&e)
            }
        }
    }

    /// Throw away the current shell (if any) and start a new one.
    pub(crate) async fn restart(&self) -> ToolResult {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) => {
                if let Err(e) = session.restart().await {
                    return ToolResult::from_session_error(&e);
                }
            }
            None => {
                let mut session = ShellSession::new(self.launcher.clone(), self.options.clone());
                if let Err(e) = session.start().await {
                    return ToolResult::from_session_error(&e);
                }
                *guard = Some(session);
            }
        }
        tracing::info!("Shell restarted ({})", self.launcher.describe());
        ToolResult::success("tool has been restarted.")
    }

    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            if session.state() == SessionState::Started {
                session.close().await?;
            }
        }
        Ok(())
    }
}

/// Execute bash commands in a persistent local shell.
pub struct BashTool {
    slot: SessionSlot,
}

impl BashTool {
    pub fn new(options: ShellOptions) -> Self {
        Self {
            slot: SessionSlot::new(Arc::new(LocalLauncher), options),
        }
    }

    /// Use a custom launcher, e.g. to run the shell elsewhere.
    pub fn with_launcher(launcher: Arc<dyn ShellLauncher>, options: ShellOptions) -> Self {
        Self {
            slot: SessionSlot::new(launcher, options),
        }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new(ShellOptions::default())
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in a persistent shell session. State such as the \
        working directory and environment variables is kept between calls. \
        Long-running commands should be run in the background (`cmd > log 2>&1 &`). \
        If a command times out, call again with `restart: true` before running anything else."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute. Can be empty when restarting."
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

        tracing::info!("Executing bash command: {}", command);
        Ok(self.slot.run(command, None).await)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.slot.close().await
    }
}
