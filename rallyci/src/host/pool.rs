use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Host, Reservation};
use crate::config::Config;
use crate::error::RallyError;
use crate::ssh::{Connector, RemoteExecutor, SshExecutor};
use crate::storage;

/// All configured hypervisor hosts plus the selection policy.
pub struct HostPool {
    hosts: Vec<Arc<Host>>,
    released: Arc<Notify>,
    reserve_kib: u64,
    scan_timeout: Duration,
    release_wait: Duration,
    stats_ttl: Duration,
}

impl HostPool {
    pub fn new(hosts: Vec<Arc<Host>>, released: Arc<Notify>, config: &Config) -> Self {
        Self {
            hosts,
            released,
            reserve_kib: config.provider.memory_reserve_kib(),
            scan_timeout: config.provider.scan_timeout(),
            release_wait: config.provider.release_wait(),
            stats_ttl: config.provider.stats_ttl(),
        }
    }

    /// One SSH session and storage backend per configured host.
    pub fn from_config(config: &Config, connector: Arc<dyn Connector>) -> Self {
        let released = Arc::new(Notify::new());
        let hosts = config
            .hosts
            .iter()
            .map(|target| {
                let exec: Arc<dyn RemoteExecutor> = Arc::new(
                    SshExecutor::new(target.clone()).with_retries(config.provider.connect_retries),
                );
                let storage = storage::backend(
                    config.provider.storage,
                    &config.provider.storage_root,
                    exec.clone(),
                );
                Arc::new(Host::new(exec, storage, connector.clone(), released.clone()))
            })
            .collect();
        Self::new(hosts, released, config)
    }

    /// Pick a host able to run a workload of `memory_kib` / `vcpus` and
    /// claim the capacity on it.
    ///
    /// Hosts are scanned in random order. When none qualifies, waits for a
    /// VM to be released (at most `release_wait`) and rescans with fresh
    /// stats, until `scan_timeout` has passed.
    #[instrument(skip(self))]
    pub async fn select(&self, memory_kib: u64, vcpus: u32) -> Result<(Arc<Host>, Reservation)> {
        let deadline = Instant::now() + self.scan_timeout;
        let mut cycle = 0u32;

        loop {
            // Registered before scanning so a release during the scan is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut order: Vec<&Arc<Host>> = self.hosts.iter().collect();
            order.shuffle(&mut rand::thread_rng());

            for host in order {
                let stale = host.stats().age().map_or(true, |age| age >= self.stats_ttl);
                if cycle > 0 || stale {
                    if let Err(e) = host.update_stats().await {
                        warn!(host = %host.name(), error = %e, "failed to refresh host stats");
                        continue;
                    }
                }
                if let Some(reservation) = host.try_reserve(memory_kib, vcpus, self.reserve_kib) {
                    info!(host = %host.name(), memory_kib, vcpus, "host selected");
                    return Ok((host.clone(), reservation));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RallyError::ResourceUnavailable { memory_kib, vcpus }.into());
            }
            debug!(cycle, "no host qualifies, waiting for a release");
            let _ = tokio::time::timeout(self.release_wait.min(deadline - now), notified).await;
            cycle += 1;
        }
    }

    /// Close every host session.
    pub async fn close(&self) {
        for host in &self.hosts {
            host.exec().close().await;
        }
    }
}
