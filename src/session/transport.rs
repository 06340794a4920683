//! Duplex byte channels to a shell process.
//!
//! Readers run as background pump tasks that forward chunks into an unbounded
//! channel, so the session can drain whatever has arrived without blocking and
//! can wait for more with an explicit deadline.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const READ_BUFFER_SIZE: usize = 4096;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Result of waiting for output.
#[derive(Debug)]
pub enum Recv {
    Data(Chunk),
    /// The deadline passed with nothing to read.
    Deadline,
    /// Every reader hit EOF; nothing more will arrive.
    Closed,
}

#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Non-blocking read of whatever has already arrived.
    fn try_read(&mut self) -> Option<Chunk>;

    /// Wait for the next chunk until `deadline`.
    async fn recv_until(&mut self, deadline: Instant) -> Recv;

    /// Whether stderr arrives as its own stream (pipes) or interleaved with
    /// stdout (a tty).
    fn separate_stderr(&self) -> bool;

    /// Whether written input is echoed back on stdout (a tty with echo on).
    fn echoes_input(&self) -> bool;

    /// Exit code of the underlying process, once it has exited.
    fn exit_code(&mut self) -> Option<i32>;

    async fn close(&mut self) -> io::Result<()>;
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw halves of an exec'd shell, as handed over by a launcher or connector.
pub struct ExecStream {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    /// `None` when stderr is merged into stdout.
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
    /// Process group to signal on close, when the child leads its own group.
    pub process_group: Option<u32>,
    pub echoes_input: bool,
}

impl ExecStream {
    /// Take the piped standard streams of a spawned child.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let missing = |name: &str| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("child has no {name} pipe"))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);
        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
            process_group: None,
            echoes_input: false,
        })
    }

    /// Wrap a single duplex stream (e.g. a container exec socket).
    pub fn from_duplex<S>(stream: S, echoes_input: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            stdin: Box::new(writer),
            stdout: Box::new(reader),
            stderr: None,
            child: None,
            process_group: None,
            echoes_input,
        }
    }
}

/// [`Transport`] over an [`ExecStream`], with reader pumps feeding a channel.
pub struct ChannelTransport {
    writer: BoxedWriter,
    rx: mpsc::UnboundedReceiver<Chunk>,
    pumps: Vec<JoinHandle<()>>,
    child: Option<Child>,
    process_group: Option<u32>,
    separate_stderr: bool,
    echoes_input: bool,
}

impl ChannelTransport {
    /// Start pumping the stream's readers.
    pub fn new(stream: ExecStream) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let separate_stderr = stream.stderr.is_some();
        let mut pumps = vec![tokio::spawn(pump(stream.stdout, StreamKind::Stdout, tx.clone()))];
        if let Some(stderr) = stream.stderr {
            pumps.push(tokio::spawn(pump(stderr, StreamKind::Stderr, tx)));
        }
        Self {
            writer: stream.stdin,
            rx,
            pumps,
            child: stream.child,
            process_group: stream.process_group,
            separate_stderr,
            echoes_input: stream.echoes_input,
        }
    }

    fn kill_group(&self) {
        if let Some(pgid) = self.process_group {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

async fn pump(mut reader: BoxedReader, stream: StreamKind, tx: mpsc::UnboundedSender<Chunk>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Chunk {
                    stream,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("{:?} reader stopped: {}", stream, e);
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    fn try_read(&mut self) -> Option<Chunk> {
        self.rx.try_recv().ok()
    }

    async fn recv_until(&mut self, deadline: Instant) -> Recv {
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(chunk)) => Recv::Data(chunk),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Deadline,
        }
    }

    fn separate_stderr(&self) -> bool {
        self.separate_stderr
    }

    fn echoes_input(&self) -> bool {
        self.echoes_input
    }

    fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.writer.shutdown().await;
        self.kill_group();
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                child.start_kill()?;
                let _ = tokio::time::timeout(std::time::Duration::from_secs(1), child.wait()).await;
            }
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill_group();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
