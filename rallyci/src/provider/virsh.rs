use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::VirshProvider;
use crate::config::JobConfig;
use crate::host::{Host, Reservation};
use crate::job::{JobContext, Runner, Step};
use crate::network::BridgeScope;
use crate::ssh::ExitStatus;
use crate::vm::Vm;

/// Runs a job's scripts inside VMs provisioned by a [`VirshProvider`].
pub struct VirshRunner {
    provider: Arc<VirshProvider>,
    job: Option<JobConfig>,
    host: Option<Arc<Host>>,
    /// Claimed capacity not yet settled into the host's reserved totals.
    reservation: Option<Reservation>,
    vms: Vec<Vm>,
    scope: BridgeScope,
}

impl VirshRunner {
    pub fn new(provider: Arc<VirshProvider>) -> Self {
        Self {
            provider,
            job: None,
            host: None,
            reservation: None,
            vms: Vec::new(),
            scope: BridgeScope::new(),
        }
    }

    fn job(&self) -> Result<&JobConfig> {
        self.job.as_ref().context("runner used before setup")
    }

    fn host(&self) -> Result<Arc<Host>> {
        self.host.clone().context("runner has no host yet")
    }
}

#[async_trait]
impl Runner for VirshRunner {
    async fn setup(&mut self, job: &JobContext) -> Result<()> {
        let config = self
            .provider
            .config()
            .job(&job.name)
            .ok_or_else(|| anyhow!("unknown job '{}'", job.name))?;
        self.job = Some(config.clone());
        Ok(())
    }

    #[instrument(skip_all)]
    async fn build(&mut self, cancel: &CancellationToken) -> Result<()> {
        let job = self.job()?.clone();
        let (host, reservation) = self.provider.acquire(&job, cancel).await?;
        self.host = Some(host.clone());
        self.reservation = Some(reservation);
        self.provider.ensure_images(&host, &job).await
    }

    #[instrument(skip_all)]
    async fn boot(&mut self, cancel: &CancellationToken) -> Result<()> {
        let host = self.host()?;
        self.vms = self.provider.create_vms(&host, self.job()?)?;
        self.provider
            .boot_vms(&mut self.vms, &mut self.scope, cancel)
            .await?;
        if let Some(reservation) = self.reservation.take() {
            host.settle(reservation, self.vms.iter().map(Vm::share).collect());
        }
        Ok(())
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.vms
            .iter()
            .enumerate()
            .filter_map(|(i, vm)| {
                vm.address()
                    .map(|address| (format!("RCI_VM_{}_ADDRESS", i), address.to_string()))
            })
            .collect()
    }

    async fn run(
        &mut self,
        step: &Step,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let script = self
            .provider
            .config()
            .script(&step.script)
            .ok_or_else(|| anyhow!("unknown script '{}'", step.script))?;
        let vm = self
            .vms
            .get_mut(step.vm)
            .ok_or_else(|| anyhow!("job has no vm #{}", step.vm))?;
        vm.run_script(script, env, cancel).await
    }

    async fn cleanup(&mut self) {
        for vm in &mut self.vms {
            vm.destroy().await;
        }
        if let Some(host) = self.host.take() {
            if let Some(reservation) = self.reservation.take() {
                host.release(reservation);
            }
            host.release_bridges(&mut self.scope).await;
        }
        debug!(vms = self.vms.len(), "runner cleaned up");
    }
}
