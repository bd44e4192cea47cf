use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::{ExitStatus, OutputSink, RemoteCommand, RemoteExecutor, SshTarget, Stdin};
use crate::error::RallyError;
use crate::util::{backoff_delay, shell_escape};

/// Size of each chunk read from a streamed stdin source.
const STDIN_CHUNK: usize = 4096;

/// Marker the remote wrapper prints on stderr before running the command.
const PID_MARKER: &str = "__rally_pid=";

/// How long a cancelled command may take to exit after being signalled.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// How long a command cancelled before reporting its pid gets to report it.
const PID_GRACE: Duration = Duration::from_secs(5);

/// First delay between master connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// ssh client exit code for connection-level failures.
const SSH_ERROR_CODE: i32 = 255;

enum Line {
    Out(String),
    Err(String),
}

/// Remote executor backed by an OpenSSH control master.
///
/// The first `run` starts a master connection (`ssh -M`) bound to a private
/// control socket; every command afterwards multiplexes over it, so a host
/// has exactly one authenticated session. The `connected` flag lives inside
/// the connect lock: concurrent callers wait for a single connect attempt.
pub struct SshExecutor {
    target: SshTarget,
    /// Client binary and the arguments placed before ssh's own.
    program: String,
    program_args: Vec<String>,
    control_path: PathBuf,
    connected: Mutex<bool>,
    connect_timeout: Duration,
    connect_retries: u32,
}

impl SshExecutor {
    pub fn new(target: SshTarget) -> Self {
        let short = &uuid::Uuid::new_v4().simple().to_string()[..12];
        Self {
            control_path: std::env::temp_dir().join(format!("rci-{}.ctl", short)),
            target,
            program: "ssh".to_string(),
            program_args: Vec::new(),
            connected: Mutex::new(false),
            connect_timeout: Duration::from_secs(10),
            connect_retries: 5,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries.max(1);
        self
    }

    #[cfg(test)]
    fn with_program(mut self, program: &str, args: &[&str]) -> Self {
        self.program = program.to_string();
        self.program_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.program_args);
        cmd
    }

    /// Options shared by the master and every multiplexed client.
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        for key in &self.target.keys {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(jump) = self.target.proxy_jump() {
            args.push("-J".to_string());
            args.push(jump);
        }
        args
    }

    fn master_args(&self) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-N".to_string(),
            "-f".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];
        args.extend(self.common_args());
        args.push(self.target.destination());
        args
    }

    fn client_args(&self, remote: &str) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "ControlMaster=no".to_string()];
        args.extend(self.common_args());
        args.push(self.target.destination());
        args.push(remote.to_string());
        args
    }

    fn control_args(&self, op: &str) -> Vec<String> {
        let mut args = vec!["-O".to_string(), op.to_string()];
        args.extend(self.common_args());
        args.push(self.target.destination());
        args
    }

    /// Connect on first use; later calls return immediately while connected.
    async fn ensure_connected(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }

        let mut last_error = String::new();
        for attempt in 0..self.connect_retries {
            if attempt > 0 {
                let delay = backoff_delay(CONNECT_BACKOFF, attempt - 1);
                trace!(
                    host = %self.target.hostname,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "ssh connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            debug!(host = %self.target.hostname, attempt, "opening ssh master connection");
            let output = self
                .ssh()
                .args(self.master_args())
                .stdin(Stdio::null())
                .output()
                .await
                .context("failed to execute ssh (is openssh-client installed?)")?;

            if output.status.success() {
                *connected = true;
                debug!(host = %self.target.hostname, "ssh master connected");
                return Ok(());
            }
            last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }

        Err(RallyError::Connection {
            host: self.target.hostname.clone(),
            reason: last_error,
        }
        .into())
    }

    async fn master_alive(&self) -> bool {
        match self
            .ssh()
            .args(self.control_args("check"))
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    /// A client exiting with 255 while the master is gone lost the session,
    /// not the command. Forget the master so the next `run` reconnects.
    async fn lost_master(&self, code: Option<i32>) -> bool {
        if code != Some(SSH_ERROR_CODE) || self.master_alive().await {
            return false;
        }
        *self.connected.lock().await = false;
        true
    }

    /// Signal the remote wrapper and its children over a fresh channel.
    async fn kill_remote(&self, pid: u32) {
        let cmd = format!("pkill -TERM -P {pid}; kill -TERM {pid}", pid = pid);
        let result = self
            .ssh()
            .args(self.client_args(&cmd))
            .stdin(Stdio::null())
            .output()
            .await;
        if let Err(e) = result {
            warn!(host = %self.target.hostname, pid, error = %e, "failed to signal remote process");
        }
    }
}

/// Wrap a command so the remote shell reports its pid first and a signal
/// death of the command surfaces as `128 + N`.
pub(crate) fn wrap_command(command: &str) -> String {
    format!(
        "echo {}$$ >&2; sh -c {}",
        PID_MARKER,
        shell_escape(command)
    )
}

pub(crate) fn parse_pid_marker(line: &str) -> Option<u32> {
    line.strip_prefix(PID_MARKER)?.trim().parse().ok()
}

/// Forward output until the pid marker shows up. `None` if the client exits
/// or `within` passes first.
async fn await_pid_marker(
    rx: &mut mpsc::Receiver<Line>,
    out: &mut dyn OutputSink,
    within: Duration,
) -> Option<u32> {
    let deadline = Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Line::Err(line))) => match parse_pid_marker(&line) {
                Some(pid) => return Some(pid),
                None => out.stderr(&line),
            },
            Ok(Some(Line::Out(line))) => out.stdout(&line),
            Ok(None) | Err(_) => return None,
        }
    }
}

async fn feed_stdin(mut sink: ChildStdin, stdin: Stdin) -> std::io::Result<()> {
    match stdin {
        Stdin::Bytes(bytes) => {
            sink.write_all(&bytes).await?;
        }
        Stdin::Stream(mut reader) => {
            let mut buf = vec![0u8; STDIN_CHUNK];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n]).await?;
            }
        }
    }
    sink.shutdown().await
}

async fn cancelled(token: &Option<CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn target(&self) -> &SshTarget {
        &self.target
    }

    #[instrument(skip(self, cmd, out), fields(host = %self.target.hostname))]
    async fn run(&self, cmd: RemoteCommand, out: &mut dyn OutputSink) -> Result<ExitStatus> {
        self.ensure_connected().await?;

        let RemoteCommand {
            command,
            stdin,
            check,
            cancel,
        } = cmd;
        debug!(command = %command, "running remote command");

        let mut child = self
            .ssh()
            .args(self.client_args(&wrap_command(&command)))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ssh")?;

        let (tx, mut rx) = mpsc::channel::<Line>(256);

        let stdout = child.stdout.take().context("ssh stdout not captured")?;
        let out_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_tx.send(Line::Out(line)).await.is_err() {
                    break;
                }
            }
        });

        let stderr = child.stderr.take().context("ssh stderr not captured")?;
        let err_tx = tx;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if err_tx.send(Line::Err(line)).await.is_err() {
                    break;
                }
            }
        });

        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(sink)) => Some(tokio::spawn(feed_stdin(sink, data))),
            _ => None,
        };

        let mut remote_pid: Option<u32> = None;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(Line::Out(l)) => out.stdout(&l),
                    Some(Line::Err(l)) => {
                        if remote_pid.is_none() {
                            if let Some(pid) = parse_pid_marker(&l) {
                                remote_pid = Some(pid);
                                continue;
                            }
                        }
                        out.stderr(&l);
                    }
                    None => break,
                },
                _ = cancelled(&cancel) => {
                    if remote_pid.is_none() {
                        // The wrapper reports before it starts the command.
                        remote_pid = await_pid_marker(&mut rx, out, PID_GRACE).await;
                    }
                    warn!(command = %command, pid = ?remote_pid, "cancelling remote command");
                    match remote_pid {
                        Some(pid) => self.kill_remote(pid).await,
                        None => warn!(command = %command, "remote pid unknown, closing the channel only"),
                    }
                    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                        warn!(command = %command, "remote command ignored SIGTERM, dropping session channel");
                        let _ = child.kill().await;
                    }
                    if let Some(w) = writer {
                        w.abort();
                    }
                    return Err(RallyError::Cancelled.into());
                }
            }
        }

        let status = child.wait().await.context("failed to wait for ssh")?;
        if let Some(w) = writer {
            match w.await {
                Ok(Err(e)) => debug!(error = %e, "stdin writer stopped early"),
                Err(e) => debug!(error = %e, "stdin writer task failed"),
                Ok(Ok(())) => {}
            }
        }

        if self.lost_master(status.code()).await {
            warn!(command = %command, "ssh master connection lost");
            return Err(RallyError::Connection {
                host: self.target.hostname.clone(),
                reason: "connection dropped".into(),
            }
            .into());
        }

        let status = match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::from_code(code),
            (None, Some(signal)) => ExitStatus::Signal(signal),
            (None, None) => ExitStatus::Code(-1),
        };

        debug!(command = %command, status = %status, "remote command finished");
        if check {
            status.check(&command)
        } else {
            Ok(status)
        }
    }

    async fn close(&self) {
        let mut connected = self.connected.lock().await;
        if !*connected {
            return;
        }
        let _ = self
            .ssh()
            .args(self.control_args("exit"))
            .stdin(Stdio::null())
            .output()
            .await;
        *connected = false;
        debug!(host = %self.target.hostname, "ssh master closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{Collect, Discard};

    fn target() -> SshTarget {
        let mut t = SshTarget::new("kvm1");
        t.username = "rally".into();
        t.port = 2222;
        t.keys = vec![PathBuf::from("/etc/rally/id_rsa")];
        t
    }

    /// Local stand-in for the ssh client. Master connects are counted and
    /// succeed unless `refuse` exists, `-O check` succeeds while `master`
    /// exists, and anything else runs the remote command with `sh -c`.
    const FAKE_SSH: &str = r#"
dir=$(dirname "$0")
for arg; do last=$arg; done
case " $* " in
  *" -M "*) echo connect >> "$dir/connects"; [ ! -e "$dir/refuse" ]; exit $? ;;
  *" -O "*) [ -e "$dir/master" ]; exit $? ;;
esac
exec sh -c "$last"
"#;

    struct FakeSsh {
        dir: tempfile::TempDir,
    }

    impl FakeSsh {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("ssh.sh"), FAKE_SSH).unwrap();
            Self { dir }
        }

        fn executor(&self) -> SshExecutor {
            let script = self.dir.path().join("ssh.sh").display().to_string();
            SshExecutor::new(target()).with_program("sh", &[&script])
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn toggle(&self, name: &str, on: bool) {
            if on {
                std::fs::write(self.path(name), "").unwrap();
            } else {
                let _ = std::fs::remove_file(self.path(name));
            }
        }

        fn connects(&self) -> usize {
            std::fs::read_to_string(self.path("connects"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    #[test]
    fn test_master_args() {
        let ex = SshExecutor::new(target());
        let args = ex.master_args();
        assert_eq!(&args[..3], &["-M", "-N", "-f"]);
        assert!(args.contains(&"ControlPersist=yes".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/etc/rally/id_rsa".to_string()));
        assert_eq!(args.last().unwrap(), "rally@kvm1");
    }

    #[test]
    fn test_client_args_end_with_command() {
        let ex = SshExecutor::new(target());
        let args = ex.client_args("uptime");
        assert!(args.contains(&"ControlMaster=no".to_string()));
        let n = args.len();
        assert_eq!(args[n - 2], "rally@kvm1");
        assert_eq!(args[n - 1], "uptime");
        assert!(!args.contains(&"-J".to_string()));
    }

    #[test]
    fn test_client_args_with_jumphost() {
        let mut vm = SshTarget::new("10.1.0.7");
        vm.jumphost = Some(Box::new(target()));
        let ex = SshExecutor::new(vm);
        let args = ex.client_args("true");
        let j = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[j + 1], "rally@kvm1:2222");
    }

    #[test]
    fn test_control_paths_are_unique() {
        let a = SshExecutor::new(target());
        let b = SshExecutor::new(target());
        assert_ne!(a.control_path, b.control_path);
    }

    #[test]
    fn test_wrap_command_quotes_payload() {
        let wrapped = wrap_command("echo 'hi'");
        assert_eq!(wrapped, "echo __rally_pid=$$ >&2; sh -c 'echo '\\''hi'\\'''");
    }

    #[test]
    fn test_parse_pid_marker() {
        assert_eq!(parse_pid_marker("__rally_pid=4242"), Some(4242));
        assert_eq!(parse_pid_marker("__rally_pid=abc"), None);
        assert_eq!(parse_pid_marker("some stderr"), None);
    }

    #[tokio::test]
    async fn test_await_pid_marker_forwards_earlier_output() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tx.send(Line::Out("banner".into())).await.unwrap();
            tx.send(Line::Err("warning: motd".into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(Line::Err("__rally_pid=77".into())).await.unwrap();
        });
        let mut out = Collect::default();
        let pid = await_pid_marker(&mut rx, &mut out, Duration::from_secs(2)).await;
        assert_eq!(pid, Some(77));
        assert_eq!(out.stdout, "banner\n");
        assert_eq!(out.stderr, "warning: motd\n");

        // The client went away without reporting.
        let (tx, mut rx) = mpsc::channel::<Line>(1);
        drop(tx);
        assert_eq!(await_pid_marker(&mut rx, &mut Discard, Duration::from_secs(2)).await, None);
    }

    #[tokio::test]
    async fn test_runs_command_and_reports_exit_code() {
        let ssh = FakeSsh::new();
        let ex = ssh.executor();
        let mut out = Collect::default();
        let status = ex
            .run(RemoteCommand::new("echo hi; exit 3").unchecked(), &mut out)
            .await
            .unwrap();
        assert_eq!(status, ExitStatus::Code(3));
        assert_eq!(out.stdout, "hi\n");
        // The pid marker is consumed, not forwarded.
        assert!(out.stderr.is_empty());
        assert_eq!(ssh.connects(), 1);
    }

    #[tokio::test]
    async fn test_cancel_kills_remote_command_and_waits() {
        let ssh = FakeSsh::new();
        let ex = ssh.executor();
        let finished = ssh.path("finished");
        let command = format!("sleep 1; touch {}", finished.display());

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                token.cancel();
            })
        };
        let started = Instant::now();
        let err = ex
            .run(RemoteCommand::new(command).cancel_on(token), &mut Discard)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(RallyError::is_cancelled(&err));
        assert!(started.elapsed() < TERMINATE_GRACE);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!finished.exists(), "cancelled command kept running");
    }

    #[tokio::test]
    async fn test_cancel_before_pid_reported_still_kills() {
        let ssh = FakeSsh::new();
        let ex = ssh.executor();
        let finished = ssh.path("finished");
        let command = format!("sleep 1; touch {}", finished.display());

        let token = CancellationToken::new();
        token.cancel();
        let err = ex
            .run(RemoteCommand::new(command).cancel_on(token), &mut Discard)
            .await
            .unwrap_err();
        assert!(RallyError::is_cancelled(&err));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!finished.exists(), "cancelled command kept running");
    }

    #[tokio::test]
    async fn test_lost_master_forces_reconnect() {
        let ssh = FakeSsh::new();
        let ex = ssh.executor();
        ssh.toggle("master", true);

        // With the master up, 255 is the command's own exit code.
        let status = ex
            .run(RemoteCommand::new("exit 255").unchecked(), &mut Discard)
            .await
            .unwrap();
        assert_eq!(status, ExitStatus::Code(255));
        assert!(*ex.connected.lock().await);

        ssh.toggle("master", false);
        let err = ex
            .run(RemoteCommand::new("exit 255").unchecked(), &mut Discard)
            .await
            .unwrap_err();
        assert!(matches!(RallyError::find(&err), Some(RallyError::Connection { .. })));
        assert!(!*ex.connected.lock().await);
        assert_eq!(ssh.connects(), 1);

        ex.run(RemoteCommand::new("true"), &mut Discard).await.unwrap();
        assert_eq!(ssh.connects(), 2);
    }

    #[tokio::test]
    async fn test_connect_backs_off_between_attempts() {
        let ssh = FakeSsh::new();
        ssh.toggle("refuse", true);
        let ex = ssh.executor().with_retries(3);

        let started = Instant::now();
        let err = ex.run(RemoteCommand::new("true"), &mut Discard).await.unwrap_err();
        assert!(matches!(RallyError::find(&err), Some(RallyError::Connection { .. })));
        assert_eq!(ssh.connects(), 3);
        // 500ms after the first failure, 1s after the second, none after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3500), "{:?}", elapsed);

        ssh.toggle("refuse", false);
        ex.run(RemoteCommand::new("true"), &mut Discard).await.unwrap();
        assert_eq!(ssh.connects(), 4);
    }

    #[tokio::test]
    async fn test_feed_stdin_streams_in_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let sink = child.stdin.take().unwrap();
        let reader: Box<dyn tokio::io::AsyncRead + Send + Unpin> =
            Box::new(std::io::Cursor::new(data.clone()));
        let writer = tokio::spawn(feed_stdin(sink, Stdin::Stream(reader)));
        let output = child.wait_with_output().await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(output.stdout, data);
    }
}
