//! Shell running as a local subprocess over pipes.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::error::{SessionError, SessionResult};
use super::transport::{ChannelTransport, ExecStream, Transport};
use super::{ShellLauncher, ShellOptions};

/// Environment that keeps the shell's output free of prompt decoration.
pub(crate) fn quiet_shell_env() -> HashMap<String, String> {
    [("PS1", "$ "), ("PS2", "> "), ("PROMPT_COMMAND", ""), ("TERM", "dumb")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Argument vector starting `shell` without rc or profile files.
pub(crate) fn shell_invocation(shell: &str) -> Vec<String> {
    let is_bash = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == "bash");
    let mut argv = vec![shell.to_string()];
    if is_bash {
        argv.extend(["--norc", "--noprofile"].map(String::from));
    }
    argv
}

/// Spawn `cmd` with piped stdio as the leader of a new process group.
pub(crate) fn spawn_piped(mut cmd: Command) -> SessionResult<ExecStream> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| SessionError::Launch(format!("Failed to spawn shell: {}", e)))?;
    let pgid = if cfg!(unix) { child.id() } else { None };
    let mut stream = ExecStream::from_child(child)?;
    stream.process_group = pgid;
    Ok(stream)
}

/// Launches `options.shell` directly on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

#[async_trait]
impl ShellLauncher for LocalLauncher {
    async fn launch(&self, options: &ShellOptions) -> SessionResult<Box<dyn Transport>> {
        let argv = shell_invocation(&options.shell);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(quiet_shell_env()).envs(&options.env);

        tracing::debug!("Spawning local shell {:?} in {:?}", argv, options.working_dir);
        let stream = spawn_piped(cmd)?;
        Ok(Box::new(ChannelTransport::new(stream)))
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
