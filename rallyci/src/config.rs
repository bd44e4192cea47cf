use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RallyError;
use crate::ssh::{RemoteCommand, SshTarget, Stdin};
use crate::util::shell_escape;

/// Top-level configuration for the rallyci daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub hosts: Vec<SshTarget>,
    pub images: Vec<ImageConfig>,
    pub vms: Vec<VmConfig>,
    pub scripts: Vec<ScriptConfig>,
    pub jobs: Vec<JobConfig>,
    pub nodes: NodesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config
            .validate()
            .map_err(|e| RallyError::Config(format!("{:#}", e)))?;
        Ok(config)
    }

    pub fn image(&self, name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == name)
    }

    pub fn vm(&self, name: &str) -> Option<&VmConfig> {
        self.vms.iter().find(|v| v.name == name)
    }

    pub fn script(&self, name: &str) -> Option<&ScriptConfig> {
        self.scripts.iter().find(|s| s.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Validate cross references and value ranges.
    pub(crate) fn validate(&self) -> Result<()> {
        unique("image", self.images.iter().map(|i| i.name.as_str()))?;
        unique("vm", self.vms.iter().map(|v| v.name.as_str()))?;
        unique("script", self.scripts.iter().map(|s| s.name.as_str()))?;
        unique("job", self.jobs.iter().map(|j| j.name.as_str()))?;

        for image in &self.images {
            match &image.parent {
                Some(parent) => {
                    anyhow::ensure!(
                        self.image(parent).is_some(),
                        "image '{}' has unknown parent '{}'",
                        image.name,
                        parent
                    );
                    anyhow::ensure!(
                        image.url.is_none(),
                        "image '{}' declares both a parent and a url",
                        image.name
                    );
                }
                None => anyhow::ensure!(
                    image.url.is_some(),
                    "image '{}' needs either a parent or a url",
                    image.name
                ),
            }
            for script in &image.build_scripts {
                anyhow::ensure!(
                    self.script(script).is_some(),
                    "image '{}' references unknown script '{}'",
                    image.name,
                    script
                );
            }
            for net in &image.builder_net {
                net.validate()
                    .with_context(|| format!("image '{}' builder network", image.name))?;
            }
            self.check_parent_cycle(&image.name)?;
        }

        for vm in &self.vms {
            anyhow::ensure!(
                self.image(&vm.image).is_some(),
                "vm '{}' references unknown image '{}'",
                vm.name,
                vm.image
            );
            anyhow::ensure!(vm.vcpus >= 1, "vm '{}' needs at least one vcpu", vm.name);
            anyhow::ensure!(vm.memory_mb >= 64, "vm '{}' needs memory_mb >= 64", vm.name);
            for net in &vm.net {
                net.validate()
                    .with_context(|| format!("vm '{}' network", vm.name))?;
            }
        }
        for net in &self.provider.default_net {
            net.validate().context("provider.default_net")?;
        }

        for job in &self.jobs {
            for key in job.env.keys() {
                anyhow::ensure!(
                    is_env_name(key),
                    "job '{}' has invalid environment variable name '{}'",
                    job.name,
                    key
                );
            }
            match job.runner {
                RunnerKind::Virsh => {
                    anyhow::ensure!(!job.vms.is_empty(), "job '{}' declares no vms", job.name);
                    anyhow::ensure!(
                        !self.hosts.is_empty(),
                        "job '{}' uses the virsh runner but no hosts are configured",
                        job.name
                    );
                    for jvm in &job.vms {
                        anyhow::ensure!(
                            self.vm(&jvm.vm).is_some(),
                            "job '{}' references unknown vm '{}'",
                            job.name,
                            jvm.vm
                        );
                        self.check_scripts(&job.name, &jvm.scripts)?;
                    }
                }
                RunnerKind::Nodes => {
                    anyhow::ensure!(
                        !self.nodes.node.is_empty(),
                        "job '{}' uses the nodes runner but no nodes are configured",
                        job.name
                    );
                    anyhow::ensure!(!job.scripts.is_empty(), "job '{}' declares no scripts", job.name);
                    self.check_scripts(&job.name, &job.scripts)?;
                }
            }
        }

        anyhow::ensure!(
            self.nodes.sessions_per_node >= 1,
            "nodes.sessions_per_node must be >= 1"
        );
        anyhow::ensure!(
            self.provider.connect_retries >= 1 && self.nodes.connect_retries >= 1,
            "connect_retries must be >= 1"
        );
        anyhow::ensure!(
            self.provider.poll_interval_ms > 0,
            "provider.poll_interval_ms must be > 0"
        );
        anyhow::ensure!(
            self.provider.scan_timeout_secs >= self.provider.release_wait_secs,
            "provider.scan_timeout_secs must be >= provider.release_wait_secs"
        );
        Ok(())
    }

    fn check_scripts(&self, job: &str, scripts: &[String]) -> Result<()> {
        for script in scripts {
            anyhow::ensure!(
                self.script(script).is_some(),
                "job '{}' references unknown script '{}'",
                job,
                script
            );
        }
        Ok(())
    }

    fn check_parent_cycle(&self, name: &str) -> Result<()> {
        let mut seen = HashSet::new();
        let mut current = Some(name);
        while let Some(n) = current {
            anyhow::ensure!(seen.insert(n), "image '{}' has a parent cycle through '{}'", name, n);
            current = self.image(n).and_then(|i| i.parent.as_deref());
        }
        Ok(())
    }
}

/// Names `env` and the shell accept unquoted as variable names.
fn is_env_name(name: &str) -> bool {
    static ENV_NAME_RE: OnceLock<Regex> = OnceLock::new();
    ENV_NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
        .is_match(name)
}

fn unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        anyhow::ensure!(!name.is_empty(), "{} name must not be empty", kind);
        anyhow::ensure!(seen.insert(name), "duplicate {} name: '{}'", kind, name);
    }
    Ok(())
}

/// Storage backend for image artifacts and VM volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Zfs,
    Btrfs,
}

/// Settings of the VM provider shared by every host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub storage: StorageKind,
    /// ZFS dataset root or btrfs directory holding images and volumes.
    pub storage_root: String,
    /// Memory kept free on every host on top of a workload's requirement.
    pub memory_reserve_mb: u64,
    /// Give up on host selection after this long.
    pub scan_timeout_secs: u64,
    /// Longest wait on the release event before rescanning hosts.
    pub release_wait_secs: u64,
    /// Capacity metrics older than this are refreshed before scoring.
    pub stats_ttl_secs: u64,
    pub address_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Interval between polls of the address table and the running list.
    pub poll_interval_ms: u64,
    /// Hypervisor emulator binary written into every domain descriptor.
    pub emulator: String,
    /// Private keys for sessions into guest VMs.
    pub vm_keys: Vec<PathBuf>,
    /// Networks attached to image-builder VMs unless an image overrides them.
    pub default_net: Vec<NetConfig>,
    /// Attempts at opening an SSH session to a host or VM.
    pub connect_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Zfs,
            storage_root: "tank/rally".into(),
            memory_reserve_mb: 1024,
            scan_timeout_secs: 3600,
            release_wait_secs: 30,
            stats_ttl_secs: 10,
            address_timeout_secs: 120,
            shutdown_timeout_secs: 30,
            poll_interval_ms: 2000,
            emulator: "/usr/bin/kvm".into(),
            vm_keys: Vec::new(),
            default_net: vec![NetConfig::bridge("virbr0")],
            connect_retries: 5,
        }
    }
}

impl ProviderConfig {
    pub fn memory_reserve_kib(&self) -> u64 {
        self.memory_reserve_mb * 1024
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn release_wait(&self) -> Duration {
        Duration::from_secs(self.release_wait_secs)
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }

    pub fn address_timeout(&self) -> Duration {
        Duration::from_secs(self.address_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A cacheable base image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub build_scripts: Vec<String>,
    #[serde(default = "default_builder_memory")]
    pub builder_memory_mb: u64,
    #[serde(default = "default_builder_vcpus")]
    pub builder_vcpus: u32,
    /// Overrides `provider.default_net` for the builder VM.
    #[serde(default)]
    pub builder_net: Vec<NetConfig>,
}

fn default_builder_memory() -> u64 {
    2048
}

fn default_builder_vcpus() -> u32 {
    2
}

/// One network interface of a VM: either a fixed bridge or a bridge
/// allocated per job from `prefix`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl NetConfig {
    pub fn bridge(name: &str) -> Self {
        Self {
            bridge: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn prefix(prefix: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.bridge.is_some() != self.prefix.is_some(),
            "network entry needs exactly one of 'bridge' or 'prefix'"
        );
        if let Some(prefix) = &self.prefix {
            anyhow::ensure!(
                !prefix.is_empty() && prefix.len() <= 10,
                "bridge prefix '{}' must be 1-10 characters",
                prefix
            );
        }
        if let Some(mac) = &self.mac {
            let octets: Vec<&str> = mac.split(':').collect();
            anyhow::ensure!(
                octets.len() == 6
                    && octets
                        .iter()
                        .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok()),
                "invalid mac address '{}'",
                mac
            );
        }
        Ok(())
    }
}

/// A VM template referenced by jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub image: String,
    #[serde(default = "default_vm_memory")]
    pub memory_mb: u64,
    #[serde(default = "default_vm_vcpus")]
    pub vcpus: u32,
    #[serde(default)]
    pub net: Vec<NetConfig>,
}

fn default_vm_memory() -> u64 {
    1024
}

fn default_vm_vcpus() -> u32 {
    1
}

/// A script piped to an interpreter on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub name: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_script_user")]
    pub user: String,
    pub data: String,
}

impl ScriptConfig {
    /// The remote command running this script: the interpreter with `env`
    /// exported, the body streamed to its stdin.
    pub fn invocation(&self, env: &BTreeMap<String, String>) -> RemoteCommand {
        let command = if env.is_empty() {
            self.interpreter.clone()
        } else {
            let exports: Vec<String> = env
                .iter()
                .map(|(k, v)| format!("{}={}", k, shell_escape(v)))
                .collect();
            format!("env {} {}", exports.join(" "), self.interpreter)
        };
        let body = std::io::Cursor::new(self.data.clone().into_bytes());
        RemoteCommand::new(command)
            .stdin(Stdin::Stream(Box::new(body)))
            .unchecked()
    }
}

fn default_interpreter() -> String {
    "/bin/bash -xe -s".to_string()
}

fn default_script_user() -> String {
    "root".to_string()
}

/// Which runner drives a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Virsh,
    Nodes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub runner: RunnerKind,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// VMs booted for a virsh job, each with the scripts run on it.
    #[serde(default)]
    pub vms: Vec<JobVmConfig>,
    /// Scripts run on a scheduled node for a nodes job.
    #[serde(default)]
    pub scripts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVmConfig {
    pub vm: String,
    #[serde(default)]
    pub scripts: Vec<String>,
}

/// Statically declared machines that run scripts directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    pub sessions_per_node: usize,
    /// Attempts at opening an SSH session to a node.
    pub connect_retries: u32,
    pub node: Vec<SshTarget>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            sessions_per_node: 1,
            connect_retries: 5,
            node: Vec::new(),
        }
    }
}

/// Aggregate memory (KiB) and vcpus of every VM a job boots.
pub fn job_requirement(config: &Config, job: &JobConfig) -> (u64, u32) {
    job.vms
        .iter()
        .filter_map(|jvm| config.vm(&jvm.vm))
        .fold((0, 0), |(mem, cpu), vm| (mem + vm.memory_mb * 1024, cpu + vm.vcpus))
}
