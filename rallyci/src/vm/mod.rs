pub mod domain;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{NetConfig, ProviderConfig, ScriptConfig};
use crate::error::RallyError;
use crate::host::{DomainShare, Host};
use crate::network::{find_address, BridgeScope, Interface};
use crate::ssh::{Discard, ExitStatus, LogSink, RemoteCommand, RemoteExecutor, SshTarget, Stdin};
use crate::storage::Disk;
use crate::util::{random_mac, random_vm_name, shell_escape};

use domain::{build_domain, DomainConfig};

/// Lifecycle state of a [`Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Unborn,
    Cloning,
    Booted,
    RunningScripts,
    ShuttingDown,
    Destroyed,
}

/// What to boot.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub image: String,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub net: Vec<NetConfig>,
    /// Boot the image's own writable artifact instead of a clone. Used by
    /// image builder VMs.
    pub use_image_volume: bool,
}

/// Provider-wide settings every VM needs.
#[derive(Debug, Clone)]
pub struct VmSettings {
    pub emulator: String,
    pub keys: Vec<PathBuf>,
    pub poll_interval: Duration,
}

impl From<&ProviderConfig> for VmSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            emulator: config.emulator.clone(),
            keys: config.vm_keys.clone(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// One libvirt domain on a host, from storage clone to teardown.
pub struct Vm {
    name: String,
    host: Arc<Host>,
    spec: VmSpec,
    settings: VmSettings,
    state: VmState,
    disks: Vec<Disk>,
    interfaces: Vec<Interface>,
    /// Set once a cloned volume may exist that `destroy` must remove.
    owns_volume: bool,
    address: Option<String>,
    /// Sessions into the guest, keyed by login user.
    sessions: HashMap<String, Arc<dyn RemoteExecutor>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Vm {
    pub fn new(host: Arc<Host>, spec: VmSpec, settings: VmSettings) -> Self {
        Self {
            name: random_vm_name(),
            host,
            spec,
            settings,
            state: VmState::Unborn,
            disks: Vec::new(),
            interfaces: Vec::new(),
            owns_volume: false,
            address: None,
            sessions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// The capacity this VM holds once running.
    pub fn share(&self) -> DomainShare {
        DomainShare {
            name: self.name.clone(),
            memory_kib: self.spec.memory_kib,
            vcpus: self.spec.vcpus,
        }
    }

    /// Clone storage, resolve networks, and start the domain.
    #[instrument(skip(self, scope), fields(vm = %self.name, host = %self.host.name()))]
    pub async fn boot(&mut self, scope: &mut BridgeScope) -> Result<()> {
        if self.state != VmState::Unborn {
            bail!("vm {} already booted", self.name);
        }
        self.state = VmState::Cloning;

        let storage = self.host.storage().clone();
        self.disks = if self.spec.use_image_volume {
            storage.image_disks(&self.spec.image).await?
        } else {
            self.owns_volume = true;
            storage
                .clone_volume(&self.spec.image, &self.name)
                .await
                .with_context(|| format!("failed to clone volume for {}", self.name))?
        };
        if self.disks.is_empty() {
            bail!("image {} has no disks", self.spec.image);
        }

        let mut interfaces = Vec::with_capacity(self.spec.net.len());
        for net in &self.spec.net {
            let bridge = match (&net.bridge, &net.prefix) {
                (Some(bridge), _) => bridge.clone(),
                (None, Some(prefix)) => self.host.get_bridge(prefix, scope).await?,
                (None, None) => bail!("network entry of {} has neither bridge nor prefix", self.name),
            };
            let mac = net.mac.clone().unwrap_or_else(random_mac);
            interfaces.push(Interface { bridge, mac });
        }
        self.interfaces = interfaces;

        let xml = build_domain(&DomainConfig {
            name: &self.name,
            memory_kib: self.spec.memory_kib,
            vcpus: self.spec.vcpus,
            emulator: &self.settings.emulator,
            disks: &self.disks,
            interfaces: &self.interfaces,
        })
        .to_xml();

        let exec = self.host.exec();
        let path = format!("/tmp/{}.xml", self.name);
        exec.run(
            RemoteCommand::new(format!("cat > {}", shell_escape(&path))).stdin(Stdin::Bytes(xml.into_bytes())),
            &mut Discard,
        )
        .await
        .context("failed to upload domain descriptor")?;
        let created = exec.exec(&format!("virsh create {}", shell_escape(&path))).await;
        if let Err(e) = exec.exec(&format!("rm -f {}", shell_escape(&path))).await {
            debug!(error = %e, "failed to remove descriptor file");
        }
        created.with_context(|| format!("failed to create domain {}", self.name))?;

        self.state = VmState::Booted;
        info!(disks = self.disks.len(), interfaces = self.interfaces.len(), "vm booted");
        Ok(())
    }

    /// Poll the host's ARP table until one of this VM's MACs shows up.
    #[instrument(skip(self), fields(vm = %self.name))]
    pub async fn get_address(&mut self, timeout: Duration) -> Result<String> {
        if let Some(address) = &self.address {
            return Ok(address.clone());
        }
        let macs: Vec<String> = self.interfaces.iter().map(|i| i.mac.clone()).collect();
        let deadline = Instant::now() + timeout;
        loop {
            let table = self
                .host
                .exec()
                .output("cat /proc/net/arp")
                .await
                .context("failed to read address table")?;
            if let Some(address) = find_address(&table, &macs) {
                info!(address = %address, "vm address found");
                self.address = Some(address.clone());
                return Ok(address);
            }
            if Instant::now() >= deadline {
                return Err(RallyError::Timeout {
                    what: format!("address of {}", self.name),
                    secs: timeout.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    fn session(&mut self, user: &str) -> Result<Arc<dyn RemoteExecutor>> {
        let Some(address) = self.address.clone() else {
            bail!("vm {} has no known address", self.name);
        };
        if let Some(session) = self.sessions.get(user) {
            return Ok(session.clone());
        }
        let target = SshTarget {
            hostname: address,
            username: user.to_string(),
            port: 22,
            keys: self.settings.keys.clone(),
            jumphost: Some(Box::new(self.host.exec().target().clone())),
        };
        let session = self.host.connector().connect(target);
        self.sessions.insert(user.to_string(), session.clone());
        Ok(session)
    }

    /// Run one script inside the VM as the script's user. Non-zero exits come
    /// back as the status; only faults are errors.
    #[instrument(skip_all, fields(vm = %self.name, script = %script.name))]
    pub async fn run_script(
        &mut self,
        script: &ScriptConfig,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let session = self.session(&script.user)?;
        self.state = VmState::RunningScripts;
        let mut sink = LogSink {
            unit: format!("{}/{}", self.name, script.name),
        };
        let result = session
            .run(script.invocation(env).cancel_on(cancel.clone()), &mut sink)
            .await;
        self.state = VmState::Booted;
        let status = result.with_context(|| format!("script {} on {}", script.name, self.name))?;
        info!(status = %status, "script finished");
        Ok(status)
    }

    async fn close_sessions(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close().await;
        }
    }

    fn is_running(&self, listing: &str) -> bool {
        listing.lines().any(|l| l.trim() == self.name)
    }

    /// Ask the guest to power off; force it off if it is still running after
    /// `timeout`.
    #[instrument(skip(self), fields(vm = %self.name))]
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if matches!(self.state, VmState::Unborn | VmState::Destroyed) {
            return Ok(());
        }
        self.state = VmState::ShuttingDown;
        let exec = self.host.exec().clone();
        let domain = shell_escape(&self.name);

        exec.run(
            RemoteCommand::new(format!("virsh shutdown {}", domain)).unchecked(),
            &mut Discard,
        )
        .await?;
        self.close_sessions().await;

        let deadline = Instant::now() + timeout;
        loop {
            let listing = exec
                .output("virsh list --name")
                .await
                .context("failed to list running domains")?;
            if !self.is_running(&listing) {
                info!("vm shut down");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("vm did not shut down in time, forcing power-off");
                exec.run(
                    RemoteCommand::new(format!("virsh destroy {}", domain)).unchecked(),
                    &mut Discard,
                )
                .await?;
                return Ok(());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Force the domain off, remove its volume, and signal the host.
    /// Runs once; later calls are no-ops. Failures are logged, never raised.
    #[instrument(skip(self), fields(vm = %self.name, host = %self.host.name()))]
    pub async fn destroy(&mut self) {
        if self.state == VmState::Destroyed {
            return;
        }
        let started = self.state != VmState::Unborn;
        self.close_sessions().await;

        let exec = self.host.exec().clone();
        if started {
            let cmd = RemoteCommand::new(format!("virsh destroy {}", shell_escape(&self.name))).unchecked();
            if let Err(e) = exec.run(cmd, &mut Discard).await {
                warn!(error = %e, "failed to power off vm");
            }
        }
        if self.owns_volume {
            if let Err(e) = self.host.storage().destroy_volume(&self.name).await {
                warn!(error = %e, "failed to destroy vm volume");
            }
        }

        self.host.vm_released(&self.name);
        self.state = VmState::Destroyed;
        info!("vm destroyed");
    }
}
