pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RallyError;

pub use session::SshExecutor;

/// Where and how to open a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub hostname: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key files passed to ssh with `-i`.
    #[serde(default)]
    pub keys: Vec<PathBuf>,
    /// Optional bastion the session is proxied through.
    #[serde(default)]
    pub jumphost: Option<Box<SshTarget>>,
}

fn default_username() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl SshTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: default_username(),
            port: default_port(),
            keys: Vec::new(),
            jumphost: None,
        }
    }

    /// `user@host`, as passed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    /// `-J` argument covering the whole jumphost chain, outermost first.
    pub fn proxy_jump(&self) -> Option<String> {
        let mut hops = Vec::new();
        let mut next = self.jumphost.as_deref();
        while let Some(hop) = next {
            hops.push(format!("{}@{}:{}", hop.username, hop.hostname, hop.port));
            next = hop.jumphost.as_deref();
        }
        if hops.is_empty() {
            return None;
        }
        hops.reverse();
        Some(hops.join(","))
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    /// Classify a shell exit code. The remote wrapper shell reports a child
    /// killed by signal N as `128 + N`.
    pub fn from_code(code: i32) -> Self {
        if (129..=128 + 64).contains(&code) {
            ExitStatus::Signal(code - 128)
        } else {
            ExitStatus::Code(code)
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// Turn a non-success status into the matching typed error.
    pub fn check(self, command: &str) -> Result<Self> {
        match self {
            ExitStatus::Code(0) => Ok(self),
            ExitStatus::Code(code) => Err(RallyError::RemoteCommandFailed {
                command: command.to_string(),
                code,
            }
            .into()),
            ExitStatus::Signal(signal) => Err(RallyError::RemoteCommandKilled {
                command: command.to_string(),
                signal,
            }
            .into()),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit {}", c),
            ExitStatus::Signal(s) => write!(f, "signal {}", s),
        }
    }
}

/// Data piped to the remote process's stdin.
pub enum Stdin {
    Bytes(Vec<u8>),
    /// Consumed in fixed-size chunks, each write awaited before the next read.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl std::fmt::Debug for Stdin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stdin::Bytes(b) => write!(f, "Stdin::Bytes({} bytes)", b.len()),
            Stdin::Stream(_) => write!(f, "Stdin::Stream"),
        }
    }
}

/// A single remote invocation.
#[derive(Debug)]
pub struct RemoteCommand {
    pub command: String,
    pub stdin: Option<Stdin>,
    /// When set, non-zero and signal exits become errors.
    pub check: bool,
    pub cancel: Option<CancellationToken>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            check: true,
            cancel: None,
        }
    }

    pub fn stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Return the raw exit status instead of failing on non-zero exit.
    pub fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Receives remote output line by line.
pub trait OutputSink: Send {
    fn stdout(&mut self, line: &str);
    fn stderr(&mut self, line: &str);
}

/// Drops all output.
pub struct Discard;

impl OutputSink for Discard {
    fn stdout(&mut self, _line: &str) {}
    fn stderr(&mut self, _line: &str) {}
}

/// Accumulates output into strings, one `\n`-terminated line at a time.
#[derive(Debug, Default)]
pub struct Collect {
    pub stdout: String,
    pub stderr: String,
}

impl OutputSink for Collect {
    fn stdout(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    fn stderr(&mut self, line: &str) {
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }
}

/// Forwards output to the log, tagged with the owning unit.
pub struct LogSink {
    pub unit: String,
}

impl OutputSink for LogSink {
    fn stdout(&mut self, line: &str) {
        info!(unit = %self.unit, stream = "stdout", "{}", line);
    }

    fn stderr(&mut self, line: &str) {
        info!(unit = %self.unit, stream = "stderr", "{}", line);
    }
}

/// A persistent command channel to one machine.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    fn target(&self) -> &SshTarget;

    /// Run a command, streaming its output into `out`.
    async fn run(&self, cmd: RemoteCommand, out: &mut dyn OutputSink) -> Result<ExitStatus>;

    /// Tear the session down. The next `run` reconnects.
    async fn close(&self);

    /// Run a checked command and return its stdout.
    async fn output(&self, command: &str) -> Result<String> {
        let mut collect = Collect::default();
        self.run(RemoteCommand::new(command), &mut collect).await?;
        Ok(collect.stdout)
    }

    /// Run a checked command, discarding output.
    async fn exec(&self, command: &str) -> Result<()> {
        self.run(RemoteCommand::new(command), &mut Discard).await?;
        Ok(())
    }
}

/// Opens sessions to machines reached through a host, such as its VMs.
pub trait Connector: Send + Sync {
    fn connect(&self, target: SshTarget) -> Arc<dyn RemoteExecutor>;
}

/// Connector backed by [`SshExecutor`].
pub struct SshConnector {
    pub connect_retries: u32,
}

impl Connector for SshConnector {
    fn connect(&self, target: SshTarget) -> Arc<dyn RemoteExecutor> {
        Arc::new(SshExecutor::new(target).with_retries(self.connect_retries))
    }
}
