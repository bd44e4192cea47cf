use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::RallyError;
use crate::job::{JobContext, Runner, Step};
use crate::scheduler::NodeScheduler;
use crate::ssh::{ExitStatus, LogSink};

/// Runs a job's scripts directly on static nodes. Nothing to build or boot;
/// each script takes one scheduler slot for as long as it runs.
pub struct NodeRunner {
    config: Arc<Config>,
    scheduler: Arc<NodeScheduler>,
    unit: String,
}

impl NodeRunner {
    pub fn new(config: Arc<Config>, scheduler: Arc<NodeScheduler>) -> Self {
        Self {
            config,
            scheduler,
            unit: String::new(),
        }
    }
}

#[async_trait]
impl Runner for NodeRunner {
    async fn setup(&mut self, job: &JobContext) -> Result<()> {
        self.unit = format!("{}/{}", job.name, job.id);
        Ok(())
    }

    async fn build(&mut self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn boot(&mut self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn run(
        &mut self,
        step: &Step,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let script = self
            .config
            .script(&step.script)
            .ok_or_else(|| anyhow!("unknown script '{}'", step.script))?;
        let session = tokio::select! {
            session = self.scheduler.acquire() => session,
            _ = cancel.cancelled() => return Err(RallyError::Cancelled.into()),
        };
        let node = session.exec().target().hostname.clone();
        info!(node = %node, script = %script.name, "running script on node");

        let mut sink = LogSink {
            unit: format!("{}/{}", self.unit, script.name),
        };
        let status = session
            .exec()
            .run(script.invocation(env).cancel_on(cancel.clone()), &mut sink)
            .await
            .with_context(|| format!("script {} on {}", script.name, node))?;
        Ok(status)
    }

    async fn cleanup(&mut self) {}
}
