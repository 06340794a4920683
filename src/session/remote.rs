//! Shell running inside a container, reached through an exec channel.
//!
//! Provisioning the container is somebody else's job. An [`ExecConnector`] only
//! has to open an exec channel running a given argv; the launcher decides what
//! runs there: create and enter the working directory, then `exec` a quiet
//! interactive shell.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::error::{SessionError, SessionResult};
use super::local::{quiet_shell_env, shell_invocation, spawn_piped};
use super::transport::{ChannelTransport, ExecStream, Transport};
use super::{ShellLauncher, ShellOptions};

/// Working directory used when none is configured.
pub const DEFAULT_REMOTE_WORKDIR: &str = "/workspace";

/// What to run on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Opens an exec channel into a container (or any remote host).
#[async_trait]
pub trait ExecConnector: Send + Sync {
    async fn open(&self, request: &ExecRequest) -> io::Result<ExecStream>;

    fn describe(&self) -> String;
}

/// Reaches the remote side through a local client program, e.g.
/// `docker exec -i <id>` or `systemd-nspawn -D <root>`.
///
/// The request's environment is applied with `env K=V ...` in front of its argv,
/// so the client program needs no environment flags of its own.
#[derive(Debug, Clone)]
pub struct CommandConnector {
    program: String,
    args: Vec<String>,
}

impl CommandConnector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `docker exec -i <container>`.
    pub fn docker_exec(container: impl Into<String>) -> Self {
        Self::new(
            "docker",
            vec!["exec".to_string(), "-i".to_string(), container.into()],
        )
    }

    /// `systemd-nspawn -D <root> --quiet`.
    pub fn nspawn(root: impl AsRef<Path>) -> Self {
        let root: PathBuf = root.as_ref().to_path_buf();
        Self::new(
            "systemd-nspawn",
            vec![
                "-D".to_string(),
                root.to_string_lossy().to_string(),
                "--quiet".to_string(),
            ],
        )
    }

    fn argv_for(&self, request: &ExecRequest) -> Vec<String> {
        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        let mut argv = self.args.clone();
        argv.push("env".to_string());
        argv.extend(env.into_iter().map(|(k, v)| format!("{}={}", k, v)));
        argv.extend(request.argv.iter().cloned());
        argv
    }
}

#[async_trait]
impl ExecConnector for CommandConnector {
    async fn open(&self, request: &ExecRequest) -> io::Result<ExecStream> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv_for(request));
        spawn_piped(cmd).map_err(|e| match e {
            SessionError::Transport(io) => io,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote `s` for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Launches a shell through an [`ExecConnector`].
#[derive(Clone)]
pub struct RemoteLauncher {
    connector: Arc<dyn ExecConnector>,
}

impl RemoteLauncher {
    pub fn new(connector: Arc<dyn ExecConnector>) -> Self {
        Self { connector }
    }

    /// The startup request: make and enter the working directory, then replace
    /// the bootstrap shell with a quiet interactive one.
    pub fn startup_request(options: &ShellOptions) -> ExecRequest {
        let workdir = options
            .working_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_REMOTE_WORKDIR.to_string());
        let workdir = shell_quote(&workdir);
        let shell = shell_invocation(&options.shell)
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!("mkdir -p {workdir} && cd {workdir} && exec {shell}");

        let mut env = quiet_shell_env();
        env.extend(options.env.clone());
        ExecRequest {
            argv: vec![options.shell.clone(), "-c".to_string(), script],
            env,
        }
    }
}

#[async_trait]
impl ShellLauncher for RemoteLauncher {
    async fn launch(&self, options: &ShellOptions) -> SessionResult<Box<dyn Transport>> {
        let request = Self::startup_request(options);
        tracing::debug!(
            "Opening remote shell via {}: {:?}",
            self.connector.describe(),
            request.argv
        );
        let stream = self.connector.open(&request).await.map_err(|e| {
            SessionError::Launch(format!(
                "Failed to open exec channel via {}: {}",
                self.connector.describe(),
                e
            ))
        })?;
        Ok(Box::new(ChannelTransport::new(stream)))
    }

    fn describe(&self) -> String {
        format!("remote ({})", self.connector.describe())
    }
}
