use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{JobConfig, RunnerKind};
use crate::error::RallyError;
use crate::ssh::ExitStatus;

/// Identity of a running job, handed to its runner.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: Uuid,
    pub name: String,
    pub task_id: Uuid,
    pub project: String,
}

/// One script invocation: the script and the index of the VM it runs on
/// (always 0 for node jobs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub vm: usize,
    pub script: String,
}

/// Drives the resources behind one job.
///
/// [`Job::run`] calls the stages in order and calls `cleanup` exactly once
/// afterwards, whichever stage failed.
#[async_trait]
pub trait Runner: Send {
    async fn setup(&mut self, job: &JobContext) -> Result<()>;

    async fn build(&mut self, cancel: &CancellationToken) -> Result<()>;

    async fn boot(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Variables contributed by booted resources, such as VM addresses.
    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn run(
        &mut self,
        step: &Step,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus>;

    /// Release everything acquired so far. Must not fail.
    async fn cleanup(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "script", rename_all = "kebab-case")]
pub enum JobStatus {
    Init,
    Building,
    Booting,
    RunningScript(usize),
    Success,
    BuildFailed,
    BootFailed,
    FailedScript(usize),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success
                | JobStatus::BuildFailed
                | JobStatus::BootFailed
                | JobStatus::FailedScript(_)
                | JobStatus::Cancelled
        )
    }
}

/// Serializable outcome of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub errors: Vec<String>,
}

pub struct Job {
    ctx: JobContext,
    config: JobConfig,
    status: JobStatus,
    env: BTreeMap<String, String>,
    errors: Vec<String>,
}

impl Job {
    pub fn new(config: JobConfig, task_id: Uuid, project: &str) -> Self {
        let ctx = JobContext {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            task_id,
            project: project.to_string(),
        };
        let mut env = config.env.clone();
        env.insert("RCI_JOB_ID".into(), ctx.id.to_string());
        env.insert("RCI_JOB_NAME".into(), ctx.name.clone());
        env.insert("RCI_TASK_ID".into(), task_id.to_string());
        env.insert("RCI_PROJECT".into(), ctx.project.clone());
        Self {
            ctx,
            config,
            status: JobStatus::Init,
            env,
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Scripts in execution order.
    pub fn steps(&self) -> Vec<Step> {
        match self.config.runner {
            RunnerKind::Virsh => self
                .config
                .vms
                .iter()
                .enumerate()
                .flat_map(|(vm, jvm)| {
                    jvm.scripts.iter().map(move |script| Step {
                        vm,
                        script: script.clone(),
                    })
                })
                .collect(),
            RunnerKind::Nodes => self
                .config
                .scripts
                .iter()
                .map(|script| Step {
                    vm: 0,
                    script: script.clone(),
                })
                .collect(),
        }
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.ctx.id,
            name: self.ctx.name.clone(),
            status: self.status,
            errors: self.errors.clone(),
        }
    }

    /// Run the job to a terminal state. Cleanup always runs, once.
    #[instrument(skip_all, fields(job = %self.ctx.name, id = %self.ctx.id))]
    pub async fn run(&mut self, runner: &mut dyn Runner, cancel: CancellationToken) -> JobStatus {
        let status = self.drive(runner, &cancel).await;
        runner.cleanup().await;
        self.status = status;
        match status {
            JobStatus::Success => info!("job succeeded"),
            JobStatus::Cancelled => warn!("job cancelled"),
            _ => error!(status = ?status, errors = ?self.errors, "job failed"),
        }
        status
    }

    async fn drive(&mut self, runner: &mut dyn Runner, cancel: &CancellationToken) -> JobStatus {
        self.status = JobStatus::Building;
        if cancel.is_cancelled() {
            return JobStatus::Cancelled;
        }
        if let Err(e) = runner.setup(&self.ctx).await {
            return self.fail(e, JobStatus::BuildFailed, cancel);
        }
        if let Err(e) = runner.build(cancel).await {
            return self.fail(e, JobStatus::BuildFailed, cancel);
        }

        self.status = JobStatus::Booting;
        if cancel.is_cancelled() {
            return JobStatus::Cancelled;
        }
        if let Err(e) = runner.boot(cancel).await {
            return self.fail(e, JobStatus::BootFailed, cancel);
        }
        self.env.extend(runner.env());

        for (i, step) in self.steps().iter().enumerate() {
            self.status = JobStatus::RunningScript(i);
            if cancel.is_cancelled() {
                return JobStatus::Cancelled;
            }
            info!(step = i, script = %step.script, vm = step.vm, "running script");
            match runner.run(step, &self.env, cancel).await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    self.errors
                        .push(format!("script {} failed: {}", step.script, status));
                    return JobStatus::FailedScript(i);
                }
                Err(e) => return self.fail(e, JobStatus::FailedScript(i), cancel),
            }
        }
        JobStatus::Success
    }

    fn fail(&mut self, err: anyhow::Error, status: JobStatus, cancel: &CancellationToken) -> JobStatus {
        if cancel.is_cancelled() || RallyError::is_cancelled(&err) {
            return JobStatus::Cancelled;
        }
        self.errors.push(format!("{:#}", err));
        status
    }
}
