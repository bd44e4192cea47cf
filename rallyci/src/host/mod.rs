pub mod pool;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ProviderConfig;
use crate::error::RallyError;
use crate::image::ImageCache;
use crate::network::{BridgeAllocator, BridgeScope};
use crate::ssh::{Connector, RemoteExecutor};
use crate::storage::Storage;
use crate::util::shell_escape;

pub use pool::HostPool;

/// Load/memory summary. `free -w` prints the memory table with separate
/// buffers and cache columns.
const SUMMARY_COMMAND: &str = "uptime && free -k -w";

/// Capacity metrics of one host. Memory is in KiB.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub cpu_count: u32,
    /// 1-minute load average.
    pub load_average: f64,
    /// free + buffers + cached.
    pub free_memory: u64,
    pub total_memory: u64,
    /// Memory and vcpus of the VMs the hypervisor reports as running.
    pub reserved_memory: u64,
    pub reserved_vcpus: u32,
    /// Reservations handed out since the last probe whose VMs are not
    /// booted yet.
    pub pending_memory: u64,
    pub pending_vcpus: u32,
    /// Domains the last `virsh list` summed into the reserved totals.
    pub listed_domains: HashSet<String>,
    /// Domains started from this host object and not yet destroyed, with
    /// their `(memory, vcpus)` share.
    pub tracked: HashMap<String, (u64, u32)>,
    pub updated_at: Option<Instant>,
}

impl HostStats {
    /// Whether a workload needing `memory_kib` fits, keeping `reserve_kib`
    /// free.
    ///
    /// Pending reservations count as both used and reserved. The free-memory
    /// and total-minus-reserved checks are independent; both must pass.
    pub fn qualifies(&self, memory_kib: u64, reserve_kib: u64) -> bool {
        let needed = memory_kib + reserve_kib;
        let free = self.free_memory.saturating_sub(self.pending_memory);
        let reserved_memory = self.reserved_memory + self.pending_memory;
        let reserved_vcpus = self.reserved_vcpus + self.pending_vcpus;

        self.load_average <= self.cpu_count as f64
            && free >= needed
            && needed <= self.total_memory.saturating_sub(reserved_memory)
            && reserved_vcpus <= self.cpu_count
    }

    pub fn age(&self) -> Option<Duration> {
        self.updated_at.map(|t| t.elapsed())
    }
}

/// Capacity claimed on a host for one job's VMs.
///
/// Must be handed back through [`Host::settle`] once the VMs run, or
/// [`Host::release`] if they never boot.
#[derive(Debug)]
pub struct Reservation {
    pub memory_kib: u64,
    pub vcpus: u32,
}

/// A running domain and the capacity it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainShare {
    pub name: String,
    pub memory_kib: u64,
    pub vcpus: u32,
}

/// A hypervisor host and everything scoped to it.
pub struct Host {
    name: String,
    exec: Arc<dyn RemoteExecutor>,
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    images: ImageCache,
    bridges: BridgeAllocator,
    cpu_count: OnceCell<u32>,
    stats: Mutex<HostStats>,
    refresh: tokio::sync::Mutex<()>,
    /// Shared by every host of a pool; signalled on each VM destroy.
    released: Arc<Notify>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn Connector>,
        released: Arc<Notify>,
    ) -> Self {
        Self {
            name: exec.target().hostname.clone(),
            exec,
            storage,
            connector,
            images: ImageCache::new(),
            bridges: BridgeAllocator::new(),
            cpu_count: OnceCell::new(),
            stats: Mutex::new(HostStats::default()),
            refresh: tokio::sync::Mutex::new(()),
            released,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exec(&self) -> &Arc<dyn RemoteExecutor> {
        &self.exec
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn stats(&self) -> HostStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> MutexGuard<'_, HostStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refresh load, memory and hypervisor-reserved totals.
    ///
    /// The cpu count is queried once per host lifetime. Pending reservations
    /// are left alone; everything else is replaced with fresh values.
    #[instrument(skip(self), fields(host = %self.name))]
    pub async fn update_stats(&self) -> Result<()> {
        let _refresh = self.refresh.lock().await;

        let cpu_count = *self
            .cpu_count
            .get_or_try_init(|| async {
                let out = self.exec.output("nproc").await.context("failed to query cpu count")?;
                out.trim()
                    .parse::<u32>()
                    .with_context(|| format!("unexpected nproc output: {:?}", out.trim()))
            })
            .await?;

        let summary = self
            .exec
            .output(SUMMARY_COMMAND)
            .await
            .context("failed to query load and memory")?;
        let load_average = parse_load_average(&summary)?;
        let (total_memory, free_memory) = parse_memory(&summary)?;

        let (listed, mut reserved_memory, mut reserved_vcpus) = self.running_domain_totals().await?;

        let mut stats = self.lock_stats();
        // A domain settled while the listing was in flight is missing from it.
        for (name, (memory_kib, vcpus)) in &stats.tracked {
            if !listed.contains(name) {
                reserved_memory += memory_kib;
                reserved_vcpus += vcpus;
            }
        }
        stats.listed_domains = listed;
        stats.cpu_count = cpu_count;
        stats.load_average = load_average;
        stats.free_memory = free_memory;
        stats.total_memory = total_memory;
        stats.reserved_memory = reserved_memory;
        stats.reserved_vcpus = reserved_vcpus;
        stats.updated_at = Some(Instant::now());
        debug!(
            load = load_average,
            free_kib = free_memory,
            reserved_kib = reserved_memory,
            reserved_vcpus,
            "host stats updated"
        );
        Ok(())
    }

    /// Names of the running domains counted, with their summed memory (KiB)
    /// and vcpus.
    async fn running_domain_totals(&self) -> Result<(HashSet<String>, u64, u32)> {
        let names = self
            .exec
            .output("virsh list --name")
            .await
            .context("failed to list running domains")?;

        let mut counted = HashSet::new();
        let mut memory = 0;
        let mut vcpus = 0;
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            let xml = match self.exec.output(&format!("virsh dumpxml {}", shell_escape(name))).await {
                Ok(xml) => xml,
                Err(e) => {
                    // Domains can go away between the list and the dump.
                    debug!(domain = %name, error = %e, "skipping domain");
                    continue;
                }
            };
            match parse_domain_resources(&xml) {
                Ok((m, c)) => {
                    memory += m;
                    vcpus += c;
                    counted.insert(name.to_string());
                }
                Err(e) => warn!(domain = %name, error = %e, "unparseable domain definition"),
            }
        }
        Ok((counted, memory, vcpus))
    }

    /// Claim capacity if the host currently qualifies. Check and claim are
    /// one step under the stats lock.
    pub fn try_reserve(&self, memory_kib: u64, vcpus: u32, reserve_kib: u64) -> Option<Reservation> {
        let mut stats = self.lock_stats();
        if !stats.qualifies(memory_kib, reserve_kib) {
            return None;
        }
        stats.pending_memory += memory_kib;
        stats.pending_vcpus += vcpus;
        Some(Reservation { memory_kib, vcpus })
    }

    /// Claim capacity on this host alone, waiting for releases while it is
    /// full. Gives up with `ResourceUnavailable` after the scan timeout.
    #[instrument(skip(self, provider), fields(host = %self.name))]
    pub async fn reserve(&self, memory_kib: u64, vcpus: u32, provider: &ProviderConfig) -> Result<Reservation> {
        let deadline = Instant::now() + provider.scan_timeout();
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reservation) = self.try_reserve(memory_kib, vcpus, provider.memory_reserve_kib()) {
                return Ok(reservation);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RallyError::ResourceUnavailable { memory_kib, vcpus }.into());
            }
            debug!(memory_kib, vcpus, "host full, waiting for a release");
            let _ = tokio::time::timeout(provider.release_wait().min(deadline - now), notified).await;
            if let Err(e) = self.update_stats().await {
                warn!(error = %e, "failed to refresh host stats");
            }
        }
    }

    /// The reserved VMs are running: move the claim into the reserved totals.
    ///
    /// A domain the last refresh already listed sits in the reserved totals
    /// and is only tracked.
    pub fn settle(&self, reservation: Reservation, domains: Vec<DomainShare>) {
        let mut stats = self.lock_stats();
        stats.pending_memory = stats.pending_memory.saturating_sub(reservation.memory_kib);
        stats.pending_vcpus = stats.pending_vcpus.saturating_sub(reservation.vcpus);
        for domain in domains {
            if !stats.listed_domains.contains(&domain.name) {
                stats.reserved_memory += domain.memory_kib;
                stats.reserved_vcpus += domain.vcpus;
            }
            stats
                .tracked
                .insert(domain.name, (domain.memory_kib, domain.vcpus));
        }
    }

    /// Drop a claim whose VMs never ran.
    pub fn release(&self, reservation: Reservation) {
        {
            let mut stats = self.lock_stats();
            stats.pending_memory = stats.pending_memory.saturating_sub(reservation.memory_kib);
            stats.pending_vcpus = stats.pending_vcpus.saturating_sub(reservation.vcpus);
        }
        self.released.notify_waiters();
    }

    /// Domain `name` on this host was destroyed. A settled domain hands its
    /// share back to the reserved totals.
    pub fn vm_released(&self, name: &str) {
        {
            let mut stats = self.lock_stats();
            stats.listed_domains.remove(name);
            if let Some((memory_kib, vcpus)) = stats.tracked.remove(name) {
                stats.reserved_memory = stats.reserved_memory.saturating_sub(memory_kib);
                stats.reserved_vcpus = stats.reserved_vcpus.saturating_sub(vcpus);
            }
        }
        info!(host = %self.name, domain = %name, "vm released");
        self.released.notify_waiters();
    }

    pub async fn get_bridge(&self, prefix: &str, scope: &mut BridgeScope) -> Result<String> {
        self.bridges.get_bridge(self.exec.as_ref(), prefix, scope).await
    }

    pub async fn release_bridges(&self, scope: &mut BridgeScope) {
        self.bridges.release(self.exec.as_ref(), scope).await
    }

    #[cfg(test)]
    pub(crate) fn set_stats(&self, stats: HostStats) {
        *self.lock_stats() = stats;
    }
}

/// 1-minute load average from `uptime` output.
pub fn parse_load_average(output: &str) -> Result<f64> {
    const MARKER: &str = "load average:";
    let Some(pos) = output.find(MARKER) else {
        bail!("no load average in probe output");
    };
    let first = output[pos + MARKER.len()..]
        .split(',')
        .next()
        .unwrap_or("")
        .trim();
    first
        .parse()
        .with_context(|| format!("invalid load average: {:?}", first))
}

/// `(total, free + buffers + cached)` from the `Mem:` row of a memory table
/// with columns `total used free shared buffers cached`.
pub fn parse_memory(output: &str) -> Result<(u64, u64)> {
    let Some(line) = output.lines().map(str::trim).find(|l| l.starts_with("Mem:")) else {
        bail!("no Mem: row in probe output");
    };
    let values = line["Mem:".len()..]
        .split_whitespace()
        .map(|v| v.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid memory row: {:?}", line))?;
    if values.len() < 6 {
        bail!("memory row has {} columns, expected at least 6", values.len());
    }
    Ok((values[0], values[2] + values[4] + values[5]))
}

/// `(memory KiB, vcpus)` from a `virsh dumpxml` domain definition.
pub fn parse_domain_resources(xml: &str) -> Result<(u64, u32)> {
    static VCPU_RE: OnceLock<Regex> = OnceLock::new();
    static MEMORY_RE: OnceLock<Regex> = OnceLock::new();
    static UNIT_RE: OnceLock<Regex> = OnceLock::new();

    let vcpu_re = VCPU_RE.get_or_init(|| Regex::new(r"<vcpu(?:\s[^>]*)?>\s*(\d+)\s*</vcpu>").unwrap());
    let memory_re =
        MEMORY_RE.get_or_init(|| Regex::new(r"<memory((?:\s[^>]*)?)>\s*(\d+)\s*</memory>").unwrap());
    let unit_re = UNIT_RE.get_or_init(|| Regex::new(r#"unit\s*=\s*['"](\w+)['"]"#).unwrap());

    let vcpus: u32 = vcpu_re
        .captures(xml)
        .context("domain definition has no <vcpu>")?[1]
        .parse()
        .context("invalid vcpu count")?;

    let caps = memory_re.captures(xml).context("domain definition has no <memory>")?;
    let amount: u64 = caps[2].parse().context("invalid memory amount")?;
    let unit = unit_re
        .captures(&caps[1])
        .map(|u| u[1].to_string())
        .unwrap_or_else(|| "KiB".to_string());
    let memory_kib = match unit.as_str() {
        "b" | "bytes" => amount / 1024,
        "k" | "KiB" => amount,
        "M" | "MiB" => amount * 1024,
        "G" | "GiB" => amount * 1024 * 1024,
        "T" | "TiB" => amount * 1024 * 1024 * 1024,
        other => bail!("unsupported memory unit '{}'", other),
    };
    Ok((memory_kib, vcpus))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::Btrfs;
    use crate::testutil::{FakeConnector, FakeExecutor, Reply};
    use rand::Rng;

    pub(crate) const SUMMARY: &str = "\
 10:00:01 up 41 days,  3:12,  2 users,  load average: 70.23, 124.89, 120.73
              total        used        free      shared     buffers       cache   available
Mem: 131870688 123538232 8332456 2420 158360 73515476
Swap:             0           0           0
";

    const DOMAIN: &str = "<domain type='kvm' id='3'>
  <name>rci_a</name>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static'>2</vcpu>
</domain>";

    pub(crate) fn fake_host(exec: Arc<FakeExecutor>, released: Arc<Notify>) -> Host {
        let storage = Arc::new(Btrfs::new("/srv/rally", exec.clone()));
        let connector = Arc::new(FakeConnector::new(exec.clone()));
        Host::new(exec, storage, connector, released)
    }

    pub(crate) fn stats(cpu: u32, load: f64, free: u64, total: u64, reserved: u64, rvcpus: u32) -> HostStats {
        HostStats {
            cpu_count: cpu,
            load_average: load,
            free_memory: free,
            total_memory: total,
            reserved_memory: reserved,
            reserved_vcpus: rvcpus,
            updated_at: Some(Instant::now()),
            ..HostStats::default()
        }
    }

    #[test]
    fn test_parse_probe_literal() {
        assert_eq!(parse_load_average(SUMMARY).unwrap(), 70.23);
        let (total, free) = parse_memory(SUMMARY).unwrap();
        assert_eq!(total, 131870688);
        assert_eq!(free, 8332456 + 158360 + 73515476);
        assert_eq!(free, 81847932);
    }

    #[test]
    fn test_parse_probe_malformed() {
        assert!(parse_load_average("up 3 days").is_err());
        assert!(parse_memory("Mem: 1 2 3").is_err());
        assert!(parse_memory("Mem: 1 2 x 4 5 6").is_err());
    }

    #[test]
    fn test_parse_domain_units() {
        assert_eq!(parse_domain_resources(DOMAIN).unwrap(), (2097152, 2));
        let mib = "<memory unit=\"MiB\">512</memory><vcpu>1</vcpu>";
        assert_eq!(parse_domain_resources(mib).unwrap(), (512 * 1024, 1));
        let gib = "<memory unit='GiB'>4</memory><vcpu placement='static'>8</vcpu>";
        assert_eq!(parse_domain_resources(gib).unwrap(), (4 * 1024 * 1024, 8));
        let bare = "<memory>1024</memory><vcpu>1</vcpu>";
        assert_eq!(parse_domain_resources(bare).unwrap(), (1024, 1));
        assert!(parse_domain_resources("<vcpu>1</vcpu>").is_err());
    }

    #[tokio::test]
    async fn test_update_stats() {
        let exec = Arc::new(
            FakeExecutor::new("kvm1")
                .on("nproc", Reply::ok("64\n"))
                .on("uptime", Reply::ok(SUMMARY))
                .on("virsh list --name", Reply::ok("rci_a\nrci_gone\n\n"))
                .on("virsh dumpxml 'rci_a'", Reply::ok(DOMAIN))
                .on("virsh dumpxml 'rci_gone'", Reply::code(1)),
        );
        let host = fake_host(exec.clone(), Arc::new(Notify::new()));
        host.update_stats().await.unwrap();
        host.update_stats().await.unwrap();

        let s = host.stats();
        assert_eq!(s.cpu_count, 64);
        assert_eq!(s.load_average, 70.23);
        assert_eq!(s.free_memory, 81847932);
        assert_eq!(s.total_memory, 131870688);
        assert_eq!(s.reserved_memory, 2097152);
        assert_eq!(s.reserved_vcpus, 2);
        assert!(s.age().is_some());
        assert_eq!(exec.count("nproc"), 1);
        assert_eq!(exec.count("uptime"), 2);
    }

    #[tokio::test]
    async fn test_update_stats_probe_failure() {
        let exec = Arc::new(
            FakeExecutor::new("kvm1")
                .on("nproc", Reply::ok("4\n"))
                .on("uptime", Reply::code(255)),
        );
        let host = fake_host(exec, Arc::new(Notify::new()));
        assert!(host.update_stats().await.is_err());
        assert!(host.stats().updated_at.is_none());
    }

    #[test]
    fn test_qualifies_each_rejection() {
        let reserve = 1024;
        let ok = stats(8, 1.0, 8192, 16384, 0, 0);
        assert!(ok.qualifies(4096, reserve));

        // overloaded
        assert!(!stats(8, 8.5, 8192, 16384, 0, 0).qualifies(4096, reserve));
        // not enough free memory
        assert!(!stats(8, 1.0, 4096, 16384, 0, 0).qualifies(4096, reserve));
        // total minus reserved too small even though memory is free
        assert!(!stats(8, 1.0, 8192, 16384, 12288, 0).qualifies(4096, reserve));
        // vcpus overcommitted
        assert!(!stats(8, 1.0, 8192, 16384, 0, 9).qualifies(4096, reserve));
    }

    #[test]
    fn test_reservation_lifecycle() {
        let host = fake_host(Arc::new(FakeExecutor::new("kvm1")), Arc::new(Notify::new()));
        host.set_stats(stats(8, 0.0, 10_000, 20_000, 0, 0));

        let first = host.try_reserve(6_000, 2, 1_000).expect("first fits");
        // Pending memory is no longer free.
        assert!(host.try_reserve(6_000, 2, 1_000).is_none());

        host.release(first);
        let again = host.try_reserve(6_000, 2, 1_000).expect("fits after release");
        host.settle(again, vec![share("rci_a", 6_000, 2)]);
        let s = host.stats();
        assert_eq!((s.pending_memory, s.pending_vcpus), (0, 0));
        assert_eq!((s.reserved_memory, s.reserved_vcpus), (6_000, 2));

        host.vm_released("rci_a");
        let s = host.stats();
        assert_eq!((s.reserved_memory, s.reserved_vcpus), (0, 0));
        assert!(s.tracked.is_empty());

        // Unsettled domains hold nothing.
        host.vm_released("rci_unknown");
        assert_eq!(host.stats().reserved_memory, 0);
    }

    fn share(name: &str, memory_kib: u64, vcpus: u32) -> DomainShare {
        DomainShare {
            name: name.to_string(),
            memory_kib,
            vcpus,
        }
    }

    fn listing(domains: &str) -> Arc<FakeExecutor> {
        Arc::new(
            FakeExecutor::new("kvm1")
                .on("nproc", Reply::ok("128\n"))
                .on("uptime", Reply::ok(SUMMARY))
                .on("virsh list --name", Reply::ok(domains))
                .on("virsh dumpxml", Reply::ok(DOMAIN)),
        )
    }

    #[tokio::test]
    async fn test_settle_after_listing_counts_domain_once() {
        // The refresh ran between `virsh create` and settle.
        let host = fake_host(listing("rci_a\n"), Arc::new(Notify::new()));
        host.update_stats().await.unwrap();
        let reservation = host.try_reserve(2097152, 2, 0).unwrap();
        host.settle(reservation, vec![share("rci_a", 2097152, 2)]);

        let s = host.stats();
        assert_eq!((s.reserved_memory, s.reserved_vcpus), (2097152, 2));
        assert_eq!(s.pending_memory, 0);

        host.vm_released("rci_a");
        assert_eq!(host.stats().reserved_memory, 0);
    }

    #[tokio::test]
    async fn test_listing_missing_settled_domain_keeps_its_share() {
        // The listing was taken before the domain started.
        let host = fake_host(listing(""), Arc::new(Notify::new()));
        host.update_stats().await.unwrap();
        let reservation = host.try_reserve(1024, 1, 0).unwrap();
        host.settle(reservation, vec![share("rci_b", 1024, 1)]);
        host.update_stats().await.unwrap();

        let s = host.stats();
        assert_eq!((s.reserved_memory, s.reserved_vcpus), (1024, 1));
        host.vm_released("rci_b");
        assert_eq!(host.stats().reserved_memory, 0);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_release() {
        let released = Arc::new(Notify::new());
        let host = Arc::new(fake_host(listing(""), released));
        host.set_stats(stats(8, 0.0, 10_000, 20_000, 0, 0));
        let held = host.try_reserve(8_000, 2, 0).unwrap();

        let mut provider = ProviderConfig::default();
        provider.memory_reserve_mb = 0;
        provider.release_wait_secs = 5;
        let waiter = {
            let host = host.clone();
            tokio::spawn(async move { host.reserve(4_000, 2, &provider).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // The refresh after the wake-up reports plenty of free memory.
        host.release(held);
        let reservation = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("reserve still waiting")
            .unwrap()
            .unwrap();
        assert_eq!(reservation.memory_kib, 4_000);
    }

    #[tokio::test]
    async fn test_reserve_times_out_when_full() {
        let host = fake_host(Arc::new(FakeExecutor::new("kvm1")), Arc::new(Notify::new()));
        host.set_stats(stats(8, 0.0, 1_000, 20_000, 0, 0));
        let mut provider = ProviderConfig::default();
        provider.memory_reserve_mb = 0;
        provider.scan_timeout_secs = 0;
        let err = host.reserve(4_000, 2, &provider).await.unwrap_err();
        assert!(matches!(
            RallyError::find(&err),
            Some(RallyError::ResourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_vm_released_wakes_waiters() {
        let released = Arc::new(Notify::new());
        let host = fake_host(Arc::new(FakeExecutor::new("kvm1")), released.clone());
        let notified = released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        host.vm_released("rci_gone");
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("release event not signalled");
    }

    #[test]
    fn test_try_reserve_randomized_never_violates_predicate() {
        let mut rng = rand::thread_rng();
        let host = fake_host(Arc::new(FakeExecutor::new("kvm1")), Arc::new(Notify::new()));
        for _ in 0..2000 {
            let cpu = rng.gen_range(1..=64u32);
            let total = rng.gen_range(1_000..=1_000_000u64);
            let s = stats(
                cpu,
                rng.gen_range(0.0..128.0),
                rng.gen_range(0..=total),
                total,
                rng.gen_range(0..=total),
                rng.gen_range(0..=96),
            );
            host.set_stats(s.clone());
            let need = rng.gen_range(1..=total / 2);
            let reserve = rng.gen_range(0..=total / 4);

            let granted = host.try_reserve(need, rng.gen_range(1..=8), reserve).is_some();
            let violates = s.load_average > s.cpu_count as f64
                || s.free_memory < need + reserve
                || need + reserve > s.total_memory - s.reserved_memory
                || s.reserved_vcpus > s.cpu_count;
            assert_eq!(granted, !violates, "stats {:?} need {} reserve {}", s, need, reserve);
        }
    }
}
