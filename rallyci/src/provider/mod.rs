//! Compute providers and the runners that drive jobs on them.

pub mod builder;
pub mod nodes;
pub mod virsh;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{job_requirement, Config, JobConfig, RunnerKind};
use crate::error::RallyError;
use crate::host::{Host, HostPool, Reservation};
use crate::job::Runner;
use crate::network::BridgeScope;
use crate::scheduler::NodeScheduler;
use crate::ssh::SshConnector;
use crate::vm::{Vm, VmSettings, VmSpec};

pub use builder::VirshImageBuilder;
pub use nodes::NodeRunner;
pub use virsh::VirshRunner;

/// Provisions job VMs on a pool of libvirt hosts.
pub struct VirshProvider {
    config: Arc<Config>,
    pool: HostPool,
    settings: VmSettings,
}

impl VirshProvider {
    pub fn new(config: Arc<Config>, pool: HostPool) -> Self {
        let settings = VmSettings::from(&config.provider);
        Self {
            config,
            pool,
            settings,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Select a host with room for every VM of `job`, or fail with
    /// `Cancelled` once `cancel` fires.
    pub async fn acquire(
        &self,
        job: &JobConfig,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Host>, Reservation)> {
        let (memory_kib, vcpus) = job_requirement(&self.config, job);
        tokio::select! {
            selected = self.pool.select(memory_kib, vcpus) => selected,
            _ = cancel.cancelled() => Err(RallyError::Cancelled.into()),
        }
    }

    /// Build (or find cached) every image the job's VMs boot from.
    pub async fn ensure_images(&self, host: &Arc<Host>, job: &JobConfig) -> Result<()> {
        let builder = VirshImageBuilder {
            host,
            config: &self.config,
            settings: &self.settings,
        };
        let images: BTreeSet<&str> = job
            .vms
            .iter()
            .map(|jvm| self.vm_config(&jvm.vm).map(|vm| vm.image.as_str()))
            .collect::<Result<_>>()?;
        for image in images {
            host.images().ensure_built(image, &builder).await?;
        }
        Ok(())
    }

    fn vm_config(&self, name: &str) -> Result<&crate::config::VmConfig> {
        self.config
            .vm(name)
            .ok_or_else(|| anyhow!("unknown vm '{}'", name))
    }

    /// Unborn VMs for each entry of `job.vms`, in order.
    pub fn create_vms(&self, host: &Arc<Host>, job: &JobConfig) -> Result<Vec<Vm>> {
        job.vms
            .iter()
            .map(|jvm| {
                let vm = self.vm_config(&jvm.vm)?;
                let spec = VmSpec {
                    image: vm.image.clone(),
                    memory_kib: vm.memory_mb * 1024,
                    vcpus: vm.vcpus,
                    net: vm.net.clone(),
                    use_image_volume: false,
                };
                Ok(Vm::new(host.clone(), spec, self.settings.clone()))
            })
            .collect()
    }

    /// Boot each VM and wait for its address.
    pub async fn boot_vms(
        &self,
        vms: &mut [Vm],
        scope: &mut BridgeScope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.config.provider.address_timeout();
        for vm in vms.iter_mut() {
            if cancel.is_cancelled() {
                bail!(RallyError::Cancelled);
            }
            vm.boot(scope).await?;
        }
        for vm in vms.iter_mut() {
            tokio::select! {
                address = vm.get_address(timeout) => { address?; }
                _ = cancel.cancelled() => bail!(RallyError::Cancelled),
            }
        }
        Ok(())
    }

    /// Provision every VM of `job` on one host, booted and addressable.
    ///
    /// On failure everything acquired so far is handed back before the error
    /// is returned. On success the VMs count against the host until
    /// destroyed; bridges created for them stay recorded in `scope`.
    #[instrument(skip_all, fields(job = %job.name))]
    pub async fn get_vms(
        &self,
        job: &JobConfig,
        scope: &mut BridgeScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vm>> {
        let (host, reservation) = self.acquire(job, cancel).await?;
        if let Err(e) = self.ensure_images(&host, job).await {
            host.release(reservation);
            return Err(e);
        }
        let mut vms = match self.create_vms(&host, job) {
            Ok(vms) => vms,
            Err(e) => {
                host.release(reservation);
                return Err(e);
            }
        };
        if let Err(e) = self.boot_vms(&mut vms, scope, cancel).await {
            for vm in vms.iter_mut() {
                vm.destroy().await;
            }
            host.release(reservation);
            host.release_bridges(scope).await;
            return Err(e);
        }
        host.settle(reservation, vms.iter().map(Vm::share).collect());
        info!(host = %host.name(), vms = vms.len(), "vms ready");
        Ok(vms)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Resolves a job's configured runner kind to a runner.
pub struct Runtime {
    config: Arc<Config>,
    virsh: Option<Arc<VirshProvider>>,
    nodes: Option<Arc<NodeScheduler>>,
}

impl Runtime {
    /// Providers for every runner kind the configuration can use.
    pub fn new(config: Arc<Config>) -> Self {
        let virsh = (!config.hosts.is_empty()).then(|| {
            let pool = HostPool::from_config(
                &config,
                Arc::new(SshConnector {
                    connect_retries: config.provider.connect_retries,
                }),
            );
            Arc::new(VirshProvider::new(config.clone(), pool))
        });
        let nodes = (!config.nodes.node.is_empty())
            .then(|| Arc::new(NodeScheduler::from_config(&config.nodes)));
        Self::with_providers(config, virsh, nodes)
    }

    pub fn with_providers(
        config: Arc<Config>,
        virsh: Option<Arc<VirshProvider>>,
        nodes: Option<Arc<NodeScheduler>>,
    ) -> Self {
        Self { config, virsh, nodes }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// A fresh runner for one execution of `job`.
    pub fn runner(&self, job: &JobConfig) -> Result<Box<dyn Runner>> {
        match job.runner {
            RunnerKind::Virsh => {
                let provider = self
                    .virsh
                    .clone()
                    .context("virsh runner requested but no hosts are configured")?;
                Ok(Box::new(VirshRunner::new(provider)))
            }
            RunnerKind::Nodes => {
                let scheduler = self
                    .nodes
                    .clone()
                    .context("nodes runner requested but no nodes are configured")?;
                Ok(Box::new(NodeRunner::new(self.config.clone(), scheduler)))
            }
        }
    }

    pub async fn close(&self) {
        if let Some(virsh) = &self.virsh {
            virsh.close().await;
        }
        if let Some(nodes) = &self.nodes {
            nodes.close().await;
        }
        info!("runtime closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::config::NetConfig;
    use crate::host::tests::{fake_host, stats};
    use crate::testutil::{FakeExecutor, Reply};
    use crate::vm::tests::ARP;
    use crate::vm::VmState;
    use tokio::sync::Notify;

    pub(crate) fn config() -> Config {
        let mut config = sample();
        config.vms[0].net = vec![
            NetConfig {
                bridge: Some("virbr0".into()),
                prefix: None,
                mac: Some("52:54:00:00:00:01".into()),
            },
            NetConfig::prefix("rnr"),
        ];
        config.provider.memory_reserve_mb = 0;
        config.provider.scan_timeout_secs = 0;
        config.provider.stats_ttl_secs = 3600;
        config.provider.address_timeout_secs = 0;
        config
    }

    /// A host with images cached and room for a few jobs.
    pub(crate) fn ready_exec() -> FakeExecutor {
        FakeExecutor::new("kvm1")
            .on("ls -1", Reply::ok("disk0.qcow2\n"))
            .on("ip link list", Reply::ok("7: rnr0: <UP> mtu 1500\n"))
            .on("cat /proc/net/arp", Reply::ok(ARP))
    }

    pub(crate) fn provider(exec: Arc<FakeExecutor>, config: Config) -> (Arc<VirshProvider>, Arc<Host>) {
        let released = Arc::new(Notify::new());
        let host = Arc::new(fake_host(exec, released.clone()));
        host.set_stats(stats(8, 0.5, 16 << 20, 32 << 20, 0, 0));
        let config = Arc::new(config);
        let pool = HostPool::new(vec![host.clone()], released, &config);
        (Arc::new(VirshProvider::new(config, pool)), host)
    }

    #[tokio::test]
    async fn test_get_vms_boots_and_counts() {
        let exec = Arc::new(ready_exec());
        let (provider, host) = provider(exec.clone(), config());
        let job = provider.config().job("unit-tests").unwrap().clone();
        let mut scope = BridgeScope::new();

        let mut vms = provider
            .get_vms(&job, &mut scope, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].state(), VmState::Booted);
        assert_eq!(vms[0].address(), Some("10.1.0.5"));
        assert_eq!(vms[0].interfaces()[1].bridge, "rnr1");
        let s = host.stats();
        assert_eq!((s.pending_memory, s.reserved_memory), (0, 2048 * 1024));

        vms[0].destroy().await;
        host.release_bridges(&mut scope).await;
        let s = host.stats();
        assert_eq!((s.reserved_memory, s.reserved_vcpus), (0, 0));
        assert_eq!(exec.count("ip link del 'rnr1'"), 1);
    }

    #[tokio::test]
    async fn test_get_vms_cleans_up_on_address_timeout() {
        let exec = Arc::new(ready_exec());
        exec.set("cat /proc/net/arp", Reply::ok(""));
        let (provider, host) = provider(exec.clone(), config());
        let job = provider.config().job("unit-tests").unwrap().clone();
        let mut scope = BridgeScope::new();

        let err = provider
            .get_vms(&job, &mut scope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(RallyError::is_timeout(&err));
        assert_eq!(exec.count("virsh destroy"), 1);
        assert_eq!(exec.count("btrfs subvolume delete"), 1);
        assert_eq!(exec.count("ip link del"), 1);
        let s = host.stats();
        assert_eq!((s.pending_memory, s.reserved_memory), (0, 0));
    }

    #[tokio::test]
    async fn test_get_vms_without_capacity() {
        let exec = Arc::new(ready_exec());
        let (provider, host) = provider(exec.clone(), config());
        host.set_stats(stats(8, 0.5, 1024, 32 << 20, 0, 0));
        let job = provider.config().job("unit-tests").unwrap().clone();
        let err = provider
            .get_vms(&job, &mut BridgeScope::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            RallyError::find(&err),
            Some(RallyError::ResourceUnavailable { .. })
        ));
        assert_eq!(exec.count("virsh"), 0);
    }

    #[test]
    fn test_runtime_dispatches_on_runner_kind() {
        let exec = Arc::new(ready_exec());
        let (provider, _host) = provider(exec, config());
        let config = Arc::new(config());

        let runtime = Runtime::with_providers(config.clone(), Some(provider), None);
        assert!(runtime.runner(config.job("unit-tests").unwrap()).is_ok());
        let err = runtime.runner(config.job("lint").unwrap()).err().unwrap();
        assert!(err.to_string().contains("no nodes are configured"));

        let scheduler = Arc::new(NodeScheduler::from_config(&config.nodes));
        let runtime = Runtime::with_providers(config.clone(), None, Some(scheduler));
        assert!(runtime.runner(config.job("lint").unwrap()).is_ok());
        assert!(runtime.runner(config.job("unit-tests").unwrap()).is_err());
    }
}
