//! Test doubles shared by unit tests across modules.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::error::RallyError;
use crate::ssh::{ExitStatus, OutputSink, RemoteCommand, RemoteExecutor, SshTarget, Stdin};

/// Canned reply for commands containing a pattern.
#[derive(Clone)]
pub struct Reply {
    pub stdout: String,
    pub code: i32,
    pub delay: Duration,
    /// Block until the command's cancellation token fires.
    pub hang: bool,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            code: 0,
            delay: Duration::ZERO,
            hang: false,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code,
            ..Self::ok("")
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::ok("")
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Executor that answers from a rule table and records every command.
///
/// Rules are matched in order by substring; unmatched commands succeed with
/// empty output.
pub struct FakeExecutor {
    target: SshTarget,
    rules: Mutex<Vec<(String, Reply)>>,
    pub log: Mutex<Vec<String>>,
    pub stdin_log: Mutex<Vec<Vec<u8>>>,
}

impl FakeExecutor {
    pub fn new(hostname: &str) -> Self {
        Self {
            target: SshTarget::new(hostname),
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            stdin_log: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), reply));
        self
    }

    /// Replace (or add) the reply for an exact pattern at runtime.
    pub fn set(&self, pattern: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|(p, _)| p == pattern) {
            rule.1 = reply;
        } else {
            rules.insert(0, (pattern.to_string(), reply));
        }
    }

    /// Everything written to stdin, one entry per command that had input.
    pub fn stdin_text(&self) -> Vec<String> {
        self.stdin_log
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    fn reply_for(&self, command: &str) -> Reply {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| Reply::ok(""))
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn run(&self, mut cmd: RemoteCommand, out: &mut dyn OutputSink) -> Result<ExitStatus> {
        self.log.lock().unwrap().push(cmd.command.clone());
        match cmd.stdin.take() {
            Some(Stdin::Bytes(b)) => self.stdin_log.lock().unwrap().push(b),
            Some(Stdin::Stream(mut reader)) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                self.stdin_log.lock().unwrap().push(buf);
            }
            None => {}
        }
        let reply = self.reply_for(&cmd.command);

        if reply.hang {
            match &cmd.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
            return Err(RallyError::Cancelled.into());
        }
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        if let Some(token) = &cmd.cancel {
            if token.is_cancelled() {
                return Err(RallyError::Cancelled.into());
            }
        }

        for line in reply.stdout.lines() {
            out.stdout(line);
        }
        let status = ExitStatus::from_code(reply.code);
        if cmd.check {
            status.check(&cmd.command)
        } else {
            Ok(status)
        }
    }

    async fn close(&self) {
        self.log.lock().unwrap().push("<close>".to_string());
    }
}

/// Connector handing out one shared fake and recording every target.
pub struct FakeConnector {
    pub exec: std::sync::Arc<FakeExecutor>,
    pub targets: Mutex<Vec<SshTarget>>,
}

impl FakeConnector {
    pub fn new(exec: std::sync::Arc<FakeExecutor>) -> Self {
        Self {
            exec,
            targets: Mutex::new(Vec::new()),
        }
    }
}

impl crate::ssh::Connector for FakeConnector {
    fn connect(&self, target: SshTarget) -> std::sync::Arc<dyn RemoteExecutor> {
        self.targets.lock().unwrap().push(target);
        self.exec.clone()
    }
}
