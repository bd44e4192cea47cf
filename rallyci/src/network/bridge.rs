use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::ssh::RemoteExecutor;
use crate::util::shell_escape;

/// Bridges allocated for one job, keyed by host and prefix.
///
/// Asking for the same prefix on the same host twice within a scope yields
/// the same bridge.
#[derive(Debug, Default)]
pub struct BridgeScope {
    bridges: HashMap<(String, String), String>,
}

impl BridgeScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, prefix: &str) -> Option<&str> {
        self.bridges
            .get(&(host.to_string(), prefix.to_string()))
            .map(String::as_str)
    }

    /// Names of bridges created on `host` through this scope.
    pub fn created_on(&self, host: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bridges
            .iter()
            .filter(|((h, _), _)| h == host)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn record(&mut self, host: &str, prefix: &str, name: &str) {
        self.bridges
            .insert((host.to_string(), prefix.to_string()), name.to_string());
    }

    fn forget_host(&mut self, host: &str) {
        self.bridges.retain(|(h, _), _| h != host);
    }
}

/// Per-host allocator of numbered bridge devices (`{prefix}{n}`).
///
/// Listing links, picking a number and creating the device happen under
/// one lock, so two jobs on the same host never pick the same name.
#[derive(Debug, Default)]
pub struct BridgeAllocator {
    lock: Mutex<()>,
}

impl BridgeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the scope's bridge for `prefix`, creating the lowest-numbered
    /// free one on first use.
    #[instrument(skip(self, exec, scope), fields(host = %exec.target().hostname))]
    pub async fn get_bridge(
        &self,
        exec: &dyn RemoteExecutor,
        prefix: &str,
        scope: &mut BridgeScope,
    ) -> Result<String> {
        let host = exec.target().hostname.clone();
        if let Some(name) = scope.get(&host, prefix) {
            debug!(bridge = %name, "reusing bridge from job scope");
            return Ok(name.to_string());
        }

        let _guard = self.lock.lock().await;
        let links = exec
            .output("ip link list")
            .await
            .context("failed to list link devices")?;
        let used = used_suffixes(&parse_link_names(&links), prefix);
        let name = format!("{}{}", prefix, lowest_free(&used));

        run_ip(exec, &format!("link add {} type bridge", shell_escape(&name)))
            .await
            .with_context(|| format!("failed to create bridge {}", name))?;
        run_ip(exec, &format!("link set {} up", shell_escape(&name)))
            .await
            .with_context(|| format!("failed to bring up {}", name))?;

        scope.record(&host, prefix, &name);
        info!(bridge = %name, "created bridge");
        Ok(name)
    }

    /// Delete every bridge the scope created on this executor's host.
    pub async fn release(&self, exec: &dyn RemoteExecutor, scope: &mut BridgeScope) {
        let host = exec.target().hostname.clone();
        for name in scope.created_on(&host) {
            if let Err(e) = run_ip(exec, &format!("link del {}", shell_escape(&name))).await {
                warn!(host = %host, bridge = %name, error = %e, "failed to delete bridge");
            }
        }
        scope.forget_host(&host);
    }
}

async fn run_ip(exec: &dyn RemoteExecutor, args: &str) -> Result<()> {
    debug!(args = %args, "running ip command");
    exec.exec(&format!("ip {}", args)).await
}

/// Parse device names out of `ip link list` output.
///
/// Each device starts with a line like
/// `5: nr0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...`; veth peers
/// carry an `@peer` suffix that is not part of the name.
pub(crate) fn parse_link_names(output: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(colon_pos) = line.find(':') else {
            continue;
        };
        if line[..colon_pos].trim().parse::<u32>().is_err() {
            continue;
        }
        let rest = &line[colon_pos + 1..];
        if let Some(name_end) = rest.find(':') {
            let name = rest[..name_end].trim();
            let name = name.split('@').next().unwrap_or(name);
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Numeric suffixes of names that are exactly `{prefix}{digits}`.
fn used_suffixes(names: &[String], prefix: &str) -> BTreeSet<u32> {
    names
        .iter()
        .filter_map(|n| n.strip_prefix(prefix))
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn lowest_free(used: &BTreeSet<u32>) -> u32 {
    (0..).find(|n| !used.contains(n)).unwrap_or(0)
}
