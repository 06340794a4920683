//! Persistent interactive shell sessions.
//!
//! A [`ShellSession`] keeps one long-lived shell open over a [`Transport`] and
//! runs commands on it one at a time, so working directory, environment and
//! background jobs carry over between commands. Completion of each command is
//! detected with a one-off sentinel (see [`framing`]).
//!
//! ```text
//! Unstarted ──start()──► Started ──run()*──► Stopped
//!                           │
//!                        timeout ──► timed_out (unusable until replaced)
//! ```
//!
//! A `run` whose future is dropped before the command's marker arrives leaves
//! the session unusable as well, since the shell may still be writing.
//!
//! The same session drives a local subprocess ([`LocalLauncher`]) or a shell
//! inside a container ([`RemoteLauncher`]).

mod error;
pub mod framing;
pub mod guard;
mod local;
mod remote;
pub mod transport;

pub use error::{SessionError, SessionResult};
pub use framing::{sanitize_output, Marker, Sentinel};
pub use guard::validate_command;
pub use local::LocalLauncher;
pub use remote::{
    shell_quote, CommandConnector, ExecConnector, ExecRequest, RemoteLauncher,
    DEFAULT_REMOTE_WORKDIR,
};
pub use transport::{ChannelTransport, Chunk, ExecStream, Recv, StreamKind, Transport};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::ShellSettings;

/// How long stderr may trail stdout's exit marker. A command that redirected
/// the shell's own stderr never sends the stderr marker.
const STDERR_GRACE: Duration = Duration::from_millis(250);

/// How to start and drive a shell.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub shell: String,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Timeout for `run` when the caller gives none.
    pub default_timeout: Duration,
    /// How long `start` waits for the shell to answer.
    pub ready_timeout: Duration,
    /// Pause between writing `exit` and tearing the transport down.
    pub close_grace: Duration,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            working_dir: None,
            env: HashMap::new(),
            default_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(100),
        }
    }
}

impl From<&ShellSettings> for ShellOptions {
    fn from(settings: &ShellSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            working_dir: settings.working_dir.clone(),
            env: settings.env.clone(),
            default_timeout: Duration::from_secs(settings.default_timeout_secs),
            ready_timeout: Duration::from_secs(settings.ready_timeout_secs),
            close_grace: Duration::from_millis(settings.close_grace_ms),
        }
    }
}

/// Starts a shell and hands back its transport.
#[async_trait]
pub trait ShellLauncher: Send + Sync {
    async fn launch(&self, options: &ShellOptions) -> SessionResult<Box<dyn Transport>>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Started,
    Stopped,
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    /// Empty when the transport interleaves stderr with stdout.
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One long-lived shell, running one command at a time.
pub struct ShellSession {
    launcher: Arc<dyn ShellLauncher>,
    options: ShellOptions,
    transport: Option<Box<dyn Transport>>,
    state: SessionState,
    timed_out: bool,
    /// Set while a command is in flight; cleared only once its marker is seen.
    busy: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    scan: Scan,
}

/// Incremental marker search over the output buffers.
#[derive(Debug, Default)]
struct Scan {
    stdout_from: usize,
    stderr_from: usize,
    exit: Option<Marker>,
    stderr_end: Option<Marker>,
}

impl ShellSession {
    /// Create an inert session; nothing is spawned until [`start`](Self::start).
    pub fn new(launcher: Arc<dyn ShellLauncher>, options: ShellOptions) -> Self {
        Self {
            launcher,
            options,
            transport: None,
            state: SessionState::Unstarted,
            timed_out: false,
            busy: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            scan: Scan::default(),
        }
    }

    pub fn local(options: ShellOptions) -> Self {
        Self::new(Arc::new(LocalLauncher), options)
    }

    pub fn remote(connector: Arc<dyn ExecConnector>, options: ShellOptions) -> Self {
        Self::new(Arc::new(RemoteLauncher::new(connector)), options)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Whether `run` would accept a command.
    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Started && !self.timed_out && !self.busy
    }

    pub fn options(&self) -> &ShellOptions {
        &self.options
    }

    /// A new inert session with the same launcher and options.
    pub fn fresh(&self) -> Self {
        Self::new(self.launcher.clone(), self.options.clone())
    }

    /// Spawn the shell and wait until it answers a ready probe.
    pub async fn start(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Started => return Ok(()),
            SessionState::Stopped => return Err(SessionError::Closed),
            SessionState::Unstarted => {}
        }

        let transport = self.launcher.launch(&self.options).await?;
        self.transport = Some(transport);

        let sentinel = Sentinel::new();
        let probe = format!("set +H 2>/dev/null; {}", sentinel.ready_probe());
        let deadline = deadline_after(self.options.ready_timeout);
        self.clear_buffers();
        let written = self.write(probe.as_bytes()).await;
        let ready = match written {
            Ok(()) => self.wait_for(&sentinel, deadline, false).await,
            Err(e) => Err(e),
        };

        match ready {
            Ok(_) => {
                self.clear_buffers();
                self.state = SessionState::Started;
                tracing::info!("Shell session started ({})", self.launcher.describe());
                Ok(())
            }
            Err(e) => {
                if let Some(mut transport) = self.transport.take() {
                    let _ = transport.close().await;
                }
                self.state = SessionState::Stopped;
                let reason = match e {
                    SessionError::TimedOut(_) => format!(
                        "shell did not become ready within {:?}",
                        self.options.ready_timeout
                    ),
                    other => other.to_string(),
                };
                tracing::warn!("Shell session failed to start: {}", reason);
                Err(SessionError::Launch(reason))
            }
        }
    }

    /// Run one command and wait for it to finish.
    ///
    /// On timeout the session is marked timed out and every later call fails
    /// with [`SessionError::Unusable`]; replace it with [`restart`](Self::restart).
    pub async fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> SessionResult<CommandOutput> {
        match self.state {
            SessionState::Unstarted => return Err(SessionError::NotStarted),
            SessionState::Stopped => return Err(SessionError::Closed),
            SessionState::Started => {}
        }
        if self.timed_out || self.busy {
            return Err(SessionError::Unusable);
        }
        if let Err(e) = validate_command(command) {
            tracing::warn!("Blocked dangerous command: {}", command);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let sentinel = Sentinel::new();
        let framed = sentinel.frame(command);
        tracing::debug!("Running command (timeout {:?}): {}", timeout, command);

        self.clear_buffers();
        self.busy = true;
        self.write(framed.as_bytes()).await?;

        let deadline = deadline_after(timeout);
        let waited = self.wait_for(&sentinel, deadline, true).await;
        match waited {
            Ok(output) => {
                self.busy = false;
                let output = self.finish_output(&sentinel, output, &framed);
                tracing::debug!(
                    "Command completed: exit={:?}, stdout_len={}, stderr_len={}",
                    output.exit_code,
                    output.stdout.len(),
                    output.stderr.len()
                );
                Ok(output)
            }
            Err(SessionError::TimedOut(_)) => {
                self.timed_out = true;
                tracing::warn!(
                    "Command timed out after {:?}, session must be restarted: {}",
                    timeout,
                    command
                );
                Err(SessionError::TimedOut(timeout))
            }
            Err(e) => Err(e),
        }
    }

    /// Close the session: ask the shell to exit, then release the transport.
    pub async fn close(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Unstarted {
            return Err(SessionError::NotStarted);
        }
        self.state = SessionState::Stopped;
        if let Some(mut transport) = self.transport.take() {
            if !self.timed_out && !self.busy {
                let _ = transport.write(b"exit\n").await;
                tokio::time::sleep(self.options.close_grace).await;
            }
            transport.close().await?;
            tracing::info!("Shell session closed ({})", self.launcher.describe());
        }
        Ok(())
    }

    /// Same as [`close`](Self::close).
    pub async fn stop(&mut self) -> SessionResult<()> {
        self.close().await
    }

    /// Replace this session with a freshly started one. Nothing from the old
    /// shell is carried over.
    pub async fn restart(&mut self) -> SessionResult<()> {
        let mut next = self.fresh();
        next.start().await?;
        let mut old = std::mem::replace(self, next);
        if old.state != SessionState::Unstarted {
            if let Err(e) = old.close().await {
                tracing::debug!("Error closing replaced session: {}", e);
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> SessionResult<()> {
        let transport = self.transport.as_mut().ok_or(SessionError::NotStarted)?;
        transport.write(data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                SessionError::Exited(transport.exit_code())
            } else {
                SessionError::Transport(e)
            }
        })
    }

    fn clear_buffers(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
        self.scan = Scan::default();
    }

    fn push(&mut self, chunk: Chunk) {
        match chunk.stream {
            StreamKind::Stdout => self.stdout.extend_from_slice(&chunk.data),
            StreamKind::Stderr => self.stderr.extend_from_slice(&chunk.data),
        }
    }

    /// Collect output until the sentinel's markers show up or `deadline` passes.
    ///
    /// The stdout exit marker completes the command. With `need_stderr`, a
    /// separate stderr stream then gets [`STDERR_GRACE`] to reach its own marker
    /// so late stderr bytes aren't attributed to the next command.
    async fn wait_for(
        &mut self,
        sentinel: &Sentinel,
        deadline: Instant,
        need_stderr: bool,
    ) -> SessionResult<RawOutput> {
        let mut grace: Option<Instant> = None;
        loop {
            while let Some(chunk) = self.transport.as_mut().and_then(|t| t.try_read()) {
                self.push(chunk);
            }
            if let Some(raw) = self.completed(sentinel, need_stderr, false) {
                return Ok(raw);
            }
            if grace.is_none() && self.scan.exit.is_some() {
                grace = Some(deadline.min(Instant::now() + STDERR_GRACE));
            }

            let transport = self.transport.as_mut().ok_or(SessionError::NotStarted)?;
            let received = transport.recv_until(grace.unwrap_or(deadline)).await;
            match received {
                Recv::Data(chunk) => self.push(chunk),
                Recv::Deadline => {
                    if grace.is_some() {
                        tracing::debug!("No stderr marker; the command redirected the shell's stderr");
                        if let Some(raw) = self.completed(sentinel, need_stderr, true) {
                            return Ok(raw);
                        }
                    }
                    return Err(SessionError::TimedOut(Duration::ZERO));
                }
                Recv::Closed => {
                    if let Some(raw) = self.completed(sentinel, need_stderr, true) {
                        return Ok(raw);
                    }
                    let code = self.transport.as_mut().and_then(|t| t.exit_code());
                    self.state = SessionState::Stopped;
                    tracing::warn!("Shell exited unexpectedly (code {:?})", code);
                    return Err(SessionError::Exited(code));
                }
            }
        }
    }

    /// Resume the marker searches where the previous call left off.
    fn scan(&mut self, sentinel: &Sentinel) {
        if self.scan.exit.is_none() {
            self.scan.exit = sentinel.find_exit_marker_from(&self.stdout, self.scan.stdout_from);
            self.scan.stdout_from = sentinel.resume_offset(self.stdout.len());
        }
        if self.scan.stderr_end.is_none() {
            self.scan.stderr_end =
                sentinel.find_plain_marker_from(&self.stderr, self.scan.stderr_from);
            self.scan.stderr_from = sentinel.resume_offset(self.stderr.len());
        }
    }

    /// The command's output once its exit marker is in. With `stderr_done`,
    /// a missing stderr marker no longer holds completion back.
    fn completed(
        &mut self,
        sentinel: &Sentinel,
        need_stderr: bool,
        stderr_done: bool,
    ) -> Option<RawOutput> {
        self.scan(sentinel);
        let exit = self.scan.exit?;
        let separate = self
            .transport
            .as_ref()
            .is_some_and(|t| t.separate_stderr());

        let stderr_end = if separate && need_stderr {
            match self.scan.stderr_end {
                Some(marker) => Some(marker.start),
                None if stderr_done => Some(self.stderr.len()),
                None => return None,
            }
        } else {
            None
        };

        Some(RawOutput {
            stdout: self.stdout[..exit.start].to_vec(),
            stderr: stderr_end.map(|end| self.stderr[..end].to_vec()),
            exit_code: exit.exit_code,
            trailing: self.stdout.len() - exit.end,
        })
    }

    fn finish_output(&mut self, sentinel: &Sentinel, raw: RawOutput, written: &str) -> CommandOutput {
        if raw.trailing > 0 {
            tracing::debug!("Discarding {} bytes after command marker", raw.trailing);
        }
        self.clear_buffers();

        let echoes = self.transport.as_ref().is_some_and(|t| t.echoes_input());
        // The stderr marker lands in stdout on a merged stream or after `exec 2>&1`.
        let stdout_bytes = sentinel.strip_plain_markers(&raw.stdout);
        let mut stdout = sanitize_output(&stdout_bytes);
        if echoes {
            stdout = framing::strip_echo(&stdout, written);
        }
        let stderr = raw
            .stderr
            .map(|bytes| sanitize_output(&bytes))
            .unwrap_or_default();

        CommandOutput {
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
            exit_code: raw.exit_code,
        }
    }
}

/// `now + timeout`, saturating far in the future instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

struct RawOutput {
    stdout: Vec<u8>,
    stderr: Option<Vec<u8>>,
    exit_code: Option<i32>,
    trailing: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_options() -> ShellOptions {
        ShellOptions {
            default_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(10),
            ..ShellOptions::default()
        }
    }

    async fn started_local() -> ShellSession {
        let mut session = ShellSession::local(quick_options());
        session.start().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut session = started_local().await;
        assert_eq!(session.state(), SessionState::Started);

        let output = session.run("echo hello", None).await.unwrap();
        assert_eq!(output.stdout, "hello");
        assert!(!output.stdout.contains("__STEPWISE_"));
        assert_eq!(output.stderr, "");
        assert!(output.success());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_persists_between_commands() {
        let mut session = started_local().await;
        session.run("cd /tmp && export GREETING=hi", None).await.unwrap();

        let output = session.run("pwd; echo $GREETING", None).await.unwrap();
        assert_eq!(output.stdout, "/tmp\nhi");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let mut session = started_local().await;
        let output = session
            .run("echo out; echo err >&2; false", None)
            .await
            .unwrap();
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert_eq!(output.exit_code, Some(1));

        let output = session.run("printf 'no newline'", None).await.unwrap();
        assert_eq!(output.stdout, "no newline");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_makes_session_unusable() {
        let mut session = started_local().await;
        let err = session
            .run("sleep 100", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TimedOut(d) if d == Duration::from_secs(1)));
        assert!(err.requires_restart());
        assert!(session.is_timed_out());

        let err = session.run("echo again", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Unusable));

        session.restart().await.unwrap();
        assert!(!session.is_timed_out());
        let output = session.run("echo again", None).await.unwrap();
        assert_eq!(output.stdout, "again");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_session_unusable() {
        let mut session = started_local().await;
        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            session.run("sleep 1; echo old", None),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!session.is_usable());
        assert!(!session.is_timed_out());

        // The old command's late output must not leak into a new one.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(matches!(
            session.run("echo new", None).await,
            Err(SessionError::Unusable)
        ));

        session.restart().await.unwrap();
        assert!(session.is_usable());
        let output = session.run("echo new", None).await.unwrap();
        assert_eq!(output.stdout, "new");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_redirected_shell_stderr_still_completes() {
        let mut session = started_local().await;
        let output = session
            .run("exec 2>/dev/null; echo ok", Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(output.stdout, "ok");
        assert_eq!(output.stderr, "");

        let output = session.run("echo again; echo hidden >&2", None).await.unwrap();
        assert_eq!(output.stdout, "again");
        assert_eq!(output.stderr, "");

        session.run("exec 2>&1", None).await.unwrap();
        let output = session.run("echo merged >&2", None).await.unwrap();
        assert_eq!(output.stdout, "merged");
        assert!(!output.stdout.contains("__STEPWISE_"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_output_completes() {
        let mut session = started_local().await;
        let output = session.run("seq 1 500000", None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.lines().count(), 500000);
        assert_eq!(output.stdout.lines().last(), Some("500000"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_destructive_command_rejected_before_execution() {
        let mut session = started_local().await;
        let err = session.run("rm -rf /", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected { .. }));
        assert!(!err.requires_restart());

        let output = session.run("echo still here", None).await.unwrap();
        assert_eq!(output.stdout, "still here");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mut session = ShellSession::local(quick_options());
        assert!(matches!(
            session.run("echo hi", None).await,
            Err(SessionError::NotStarted)
        ));
        assert!(matches!(session.close().await, Err(SessionError::NotStarted)));

        session.start().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(
            session.run("echo hi", None).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shell_exit_is_reported() {
        let mut session = started_local().await;
        let err = session.run("exit 3", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Exited(_)));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_local_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = quick_options();
        options.working_dir = Some(dir.path().to_path_buf());
        options.env.insert("STEPWISE_TEST".to_string(), "42".to_string());

        let mut session = ShellSession::local(options);
        session.start().await.unwrap();
        let output = session.run("pwd; echo $STEPWISE_TEST", None).await.unwrap();
        assert_eq!(
            output.stdout,
            format!("{}\n42", dir.path().display())
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_session_bootstraps_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work space/nested");
        let mut options = quick_options();
        options.working_dir = Some(workdir.clone());

        // `env` stands in for a container exec client.
        let connector = Arc::new(CommandConnector::new("env", vec![]));
        let mut session = ShellSession::remote(connector, options);
        session.start().await.unwrap();

        let output = session.run("pwd; echo $PS1", None).await.unwrap();
        assert_eq!(output.stdout, format!("{}\n$", workdir.display()));
        assert!(workdir.is_dir());

        let err = session.run("sleep 30", Some(Duration::from_millis(300))).await;
        assert!(matches!(err, Err(SessionError::TimedOut(_))));
        assert!(matches!(
            session.run("pwd", None).await,
            Err(SessionError::Unusable)
        ));

        session.restart().await.unwrap();
        let output = session.run("pwd", None).await.unwrap();
        assert_eq!(output.stdout, workdir.display().to_string());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_is_launch_error() {
        let options = ShellOptions {
            shell: "/nonexistent/shell".to_string(),
            ..quick_options()
        };
        let mut session = ShellSession::local(options);
        assert!(matches!(
            session.start().await,
            Err(SessionError::Launch(_))
        ));
    }
}
