use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{fetch, list_disks, Disk, Storage};
use crate::ssh::{Discard, RemoteCommand, RemoteExecutor};
use crate::util::shell_escape;

/// Snapshot name marking a finalized image.
const IMAGE_SNAPSHOT: &str = "rally";

/// ZFS backend: images are filesystem datasets under `{root}/images`,
/// finalized by a snapshot; VM volumes are clones under `{root}/vms`.
pub struct Zfs {
    root: String,
    exec: Arc<dyn RemoteExecutor>,
}

impl Zfs {
    pub fn new(root: &str, exec: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            exec,
        }
    }

    fn image_dataset(&self, image: &str) -> String {
        format!("{}/images/{}", self.root, image)
    }

    fn volume_dataset(&self, volume: &str) -> String {
        format!("{}/vms/{}", self.root, volume)
    }

    fn image_snapshot(&self, image: &str) -> String {
        format!("{}@{}", self.image_dataset(image), IMAGE_SNAPSHOT)
    }

    async fn run_zfs(&self, args: &str) -> Result<()> {
        debug!(args = %args, "running zfs command");
        self.exec
            .exec(&format!("zfs {}", args))
            .await
            .with_context(|| format!("zfs {} failed", args.split(' ').next().unwrap_or("")))
    }

    /// Whether `name` (dataset or snapshot) exists.
    async fn exists(&self, name: &str) -> Result<bool> {
        let status = self
            .exec
            .run(
                RemoteCommand::new(format!("zfs list -H -o name {}", shell_escape(name))).unchecked(),
                &mut Discard,
            )
            .await?;
        Ok(status.success())
    }

    async fn mountpoint(&self, dataset: &str) -> Result<String> {
        let out = self
            .exec
            .output(&format!("zfs get -H -o value mountpoint {}", shell_escape(dataset)))
            .await
            .with_context(|| format!("failed to query mountpoint of {}", dataset))?;
        let mp = out.trim();
        if mp.is_empty() || mp == "-" || mp == "none" {
            bail!("dataset {} is not mounted", dataset);
        }
        Ok(mp.to_string())
    }

    /// Destroy a dataset and its snapshots.
    ///
    /// Refuses anything outside `images/` or `vms/` under the root so a bad
    /// name can never take out the root dataset itself.
    async fn destroy(&self, dataset: &str) -> Result<()> {
        let valid_prefixes = [format!("{}/images/", self.root), format!("{}/vms/", self.root)];
        if !valid_prefixes.iter().any(|p| dataset.starts_with(p)) {
            bail!(
                "refusing to destroy dataset '{}': not under images/ or vms/ of '{}'",
                dataset,
                self.root
            );
        }
        if !self.exists(dataset).await? {
            return Ok(());
        }
        self.run_zfs(&format!("destroy -r {}", shell_escape(dataset)))
            .await
            .with_context(|| format!("failed to destroy {}", dataset))
    }
}

#[async_trait]
impl Storage for Zfs {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.exists(&self.image_snapshot(image)).await
    }

    #[instrument(skip(self))]
    async fn destroy_image(&self, image: &str) -> Result<()> {
        self.destroy(&self.image_dataset(image)).await
    }

    #[instrument(skip(self))]
    async fn create_image(&self, image: &str, parent: Option<&str>) -> Result<()> {
        let target = self.image_dataset(image);
        match parent {
            Some(parent) => {
                let source = self.image_snapshot(parent);
                self.run_zfs(&format!("clone -p {} {}", shell_escape(&source), shell_escape(&target)))
                    .await
                    .with_context(|| format!("failed to clone {} -> {}", source, target))
            }
            None => self
                .run_zfs(&format!("create -p {}", shell_escape(&target)))
                .await
                .with_context(|| format!("failed to create {}", target)),
        }
    }

    async fn image_disks(&self, image: &str) -> Result<Vec<Disk>> {
        let mp = self.mountpoint(&self.image_dataset(image)).await?;
        list_disks(self.exec.as_ref(), &mp).await
    }

    #[instrument(skip(self))]
    async fn snapshot_image(&self, image: &str) -> Result<()> {
        let snap = self.image_snapshot(image);
        self.run_zfs(&format!("snapshot {}", shell_escape(&snap)))
            .await
            .with_context(|| format!("failed to snapshot {}", snap))
    }

    #[instrument(skip(self))]
    async fn clone_volume(&self, image: &str, volume: &str) -> Result<Vec<Disk>> {
        let source = self.image_snapshot(image);
        let target = self.volume_dataset(volume);
        self.run_zfs(&format!("clone -p {} {}", shell_escape(&source), shell_escape(&target)))
            .await
            .with_context(|| format!("failed to clone {} -> {}", source, target))?;
        let mp = self.mountpoint(&target).await?;
        list_disks(self.exec.as_ref(), &mp).await
    }

    #[instrument(skip(self))]
    async fn destroy_volume(&self, volume: &str) -> Result<()> {
        self.destroy(&self.volume_dataset(volume)).await
    }

    #[instrument(skip(self))]
    async fn download(&self, image: &str, url: &str) -> Result<()> {
        let mp = self.mountpoint(&self.image_dataset(image)).await?;
        fetch(self.exec.as_ref(), &mp, image, url).await
    }
}
