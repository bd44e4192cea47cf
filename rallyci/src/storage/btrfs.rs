use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{fetch, list_disks, Disk, Storage};
use crate::ssh::{Discard, RemoteCommand, RemoteExecutor};
use crate::util::shell_escape;

/// Marker file written into an image subvolume when it is finalized.
const READY_MARKER: &str = ".rally-ready";

/// btrfs backend: images and VM volumes are subvolumes under
/// `{root}/images` and `{root}/vms`. A finalized image is read-only and
/// carries a ready marker.
pub struct Btrfs {
    root: String,
    exec: Arc<dyn RemoteExecutor>,
}

impl Btrfs {
    pub fn new(root: &str, exec: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            exec,
        }
    }

    fn image_dir(&self, image: &str) -> String {
        format!("{}/images/{}", self.root, image)
    }

    fn volume_dir(&self, volume: &str) -> String {
        format!("{}/vms/{}", self.root, volume)
    }

    async fn run_btrfs(&self, command: String) -> Result<()> {
        debug!(command = %command, "running btrfs command");
        self.exec.exec(&command).await
    }

    async fn delete_subvolume(&self, path: &str) -> Result<()> {
        let p = shell_escape(path);
        self.run_btrfs(format!(
            "if [ -d {p} ]; then btrfs property set -ts {p} ro false && btrfs subvolume delete {p}; fi"
        ))
        .await
        .with_context(|| format!("failed to delete subvolume {}", path))
    }
}

#[async_trait]
impl Storage for Btrfs {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let marker = format!("{}/{}", self.image_dir(image), READY_MARKER);
        let status = self
            .exec
            .run(
                RemoteCommand::new(format!("test -e {}", shell_escape(&marker))).unchecked(),
                &mut Discard,
            )
            .await?;
        Ok(status.success())
    }

    #[instrument(skip(self))]
    async fn destroy_image(&self, image: &str) -> Result<()> {
        self.delete_subvolume(&self.image_dir(image)).await
    }

    #[instrument(skip(self))]
    async fn create_image(&self, image: &str, parent: Option<&str>) -> Result<()> {
        let target = self.image_dir(image);
        let images = shell_escape(&format!("{}/images", self.root));
        let cmd = match parent {
            // The parent's ready marker must not make the child look finished.
            Some(parent) => format!(
                "mkdir -p {} && btrfs subvolume snapshot {} {} && rm -f {}",
                images,
                shell_escape(&self.image_dir(parent)),
                shell_escape(&target),
                shell_escape(&format!("{}/{}", target, READY_MARKER))
            ),
            None => format!("mkdir -p {} && btrfs subvolume create {}", images, shell_escape(&target)),
        };
        self.run_btrfs(cmd)
            .await
            .with_context(|| format!("failed to create subvolume {}", target))
    }

    async fn image_disks(&self, image: &str) -> Result<Vec<Disk>> {
        list_disks(self.exec.as_ref(), &self.image_dir(image)).await
    }

    #[instrument(skip(self))]
    async fn snapshot_image(&self, image: &str) -> Result<()> {
        let dir = shell_escape(&self.image_dir(image));
        let marker = shell_escape(&format!("{}/{}", self.image_dir(image), READY_MARKER));
        self.run_btrfs(format!("touch {marker} && btrfs property set -ts {dir} ro true"))
            .await
            .with_context(|| format!("failed to finalize image {}", image))
    }

    #[instrument(skip(self))]
    async fn clone_volume(&self, image: &str, volume: &str) -> Result<Vec<Disk>> {
        let target = self.volume_dir(volume);
        self.run_btrfs(format!(
            "mkdir -p {} && btrfs subvolume snapshot {} {}",
            shell_escape(&format!("{}/vms", self.root)),
            shell_escape(&self.image_dir(image)),
            shell_escape(&target)
        ))
        .await
        .with_context(|| format!("failed to clone {} -> {}", image, target))?;
        list_disks(self.exec.as_ref(), &target).await
    }

    #[instrument(skip(self))]
    async fn destroy_volume(&self, volume: &str) -> Result<()> {
        self.delete_subvolume(&self.volume_dir(volume)).await
    }

    #[instrument(skip(self))]
    async fn download(&self, image: &str, url: &str) -> Result<()> {
        fetch(self.exec.as_ref(), &self.image_dir(image), image, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeExecutor, Reply};

    #[tokio::test]
    async fn test_image_exists_uses_ready_marker() {
        let exec = Arc::new(FakeExecutor::new("kvm1").on("test -e", Reply::code(1)));
        let b = Btrfs::new("/srv/rally", exec.clone());
        assert!(!b.image_exists("base").await.unwrap());
        assert_eq!(exec.commands(), vec!["test -e '/srv/rally/images/base/.rally-ready'"]);
    }

    #[tokio::test]
    async fn test_create_and_finalize_commands() {
        let exec = Arc::new(FakeExecutor::new("kvm1"));
        let b = Btrfs::new("/srv/rally", exec.clone());
        b.create_image("dev", Some("base")).await.unwrap();
        b.snapshot_image("dev").await.unwrap();
        let cmds = exec.commands();
        assert_eq!(
            cmds[0],
            "mkdir -p '/srv/rally/images' && btrfs subvolume snapshot '/srv/rally/images/base' '/srv/rally/images/dev' \
             && rm -f '/srv/rally/images/dev/.rally-ready'"
        );
        assert!(cmds[1].contains("touch '/srv/rally/images/dev/.rally-ready'"));
        assert!(cmds[1].ends_with("ro true"));
    }

    #[tokio::test]
    async fn test_clone_volume_returns_disks() {
        let exec = Arc::new(FakeExecutor::new("kvm1").on("ls -1", Reply::ok("disk0.img\n.rally-ready\n")));
        let b = Btrfs::new("/srv/rally", exec.clone());
        let disks = b.clone_volume("dev", "rci_1").await.unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].path, "/srv/rally/vms/rci_1/disk0.img");
        assert!(exec.commands()[0].contains("btrfs subvolume snapshot '/srv/rally/images/dev' '/srv/rally/vms/rci_1'"));
    }

    #[tokio::test]
    async fn test_destroy_volume_clears_readonly_first() {
        let exec = Arc::new(FakeExecutor::new("kvm1"));
        let b = Btrfs::new("/srv/rally", exec.clone());
        b.destroy_volume("rci_1").await.unwrap();
        let cmd = &exec.commands()[0];
        assert!(cmd.find("ro false").unwrap() < cmd.find("subvolume delete").unwrap());
    }
}
