pub mod btrfs;
pub mod zfs;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::StorageKind;
use crate::ssh::RemoteExecutor;
use crate::util::shell_escape;

pub use btrfs::Btrfs;
pub use zfs::Zfs;

/// On-disk format of a disk file, as written into the domain descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }

    fn from_file_name(name: &str) -> Self {
        if name.ends_with(".qcow2") {
            DiskFormat::Qcow2
        } else {
            DiskFormat::Raw
        }
    }
}

/// One disk file of an image or volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub path: String,
    pub format: DiskFormat,
}

/// Image artifacts and per-VM copy-on-write volumes on one host.
///
/// Implementations run every command through the host's executor. Images
/// become visible to [`Storage::image_exists`] only after
/// [`Storage::snapshot_image`], so a half-built image is always "missing".
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether the finalized artifact for `image` exists.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Remove any (possibly partial) artifact for `image`. No-op when absent.
    async fn destroy_image(&self, image: &str) -> Result<()>;

    /// Create a writable artifact, branched from the finalized parent when
    /// one is given, empty otherwise.
    async fn create_image(&self, image: &str, parent: Option<&str>) -> Result<()>;

    /// Disk files of the writable image artifact, in declaration order.
    async fn image_disks(&self, image: &str) -> Result<Vec<Disk>>;

    /// Finalize `image` so that clones can be made from it.
    async fn snapshot_image(&self, image: &str) -> Result<()>;

    /// Clone a volume for a VM from a finalized image; returns its disks in
    /// declaration order.
    async fn clone_volume(&self, image: &str, volume: &str) -> Result<Vec<Disk>>;

    async fn destroy_volume(&self, volume: &str) -> Result<()>;

    /// Fetch `url` into a freshly created image artifact.
    async fn download(&self, image: &str, url: &str) -> Result<()>;
}

/// Build the configured backend on top of a host's executor.
pub fn backend(kind: StorageKind, root: &str, exec: Arc<dyn RemoteExecutor>) -> Arc<dyn Storage> {
    match kind {
        StorageKind::Zfs => Arc::new(Zfs::new(root, exec)),
        StorageKind::Btrfs => Arc::new(Btrfs::new(root, exec)),
    }
}

/// Download `url` with wget into `dir` on the host.
pub(crate) async fn fetch(exec: &dyn RemoteExecutor, dir: &str, image: &str, url: &str) -> Result<()> {
    let dest = format!("{}/{}", dir.trim_end_matches('/'), download_file_name(url));
    exec.exec(&format!("wget -nv -O {} {}", shell_escape(&dest), shell_escape(url)))
        .await
        .with_context(|| format!("failed to download {} for image {}", url, image))
}

/// Name of the single disk file a downloaded image lands in.
pub(crate) fn download_file_name(url: &str) -> &'static str {
    if url.ends_with(".qcow2") {
        "disk0.qcow2"
    } else {
        "disk0.img"
    }
}

/// List the disk files in `dir`, sorted by name, hidden files skipped.
pub(crate) async fn list_disks(exec: &dyn RemoteExecutor, dir: &str) -> Result<Vec<Disk>> {
    let out = exec
        .output(&format!("ls -1 {}", shell_escape(dir)))
        .await
        .with_context(|| format!("failed to list disks in {}", dir))?;
    Ok(parse_disk_listing(dir, &out))
}

fn parse_disk_listing(dir: &str, listing: &str) -> Vec<Disk> {
    let mut names: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('.'))
        .collect();
    names.sort_unstable();
    names
        .into_iter()
        .map(|name| Disk {
            path: format!("{}/{}", dir.trim_end_matches('/'), name),
            format: DiskFormat::from_file_name(name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeExecutor, Reply};

    #[test]
    fn test_parse_disk_listing_sorted() {
        let disks = parse_disk_listing("/srv/rally/vms/x/", "disk1.img\n.rally-ready\ndisk0.qcow2\n\n");
        assert_eq!(
            disks,
            vec![
                Disk {
                    path: "/srv/rally/vms/x/disk0.qcow2".into(),
                    format: DiskFormat::Qcow2
                },
                Disk {
                    path: "/srv/rally/vms/x/disk1.img".into(),
                    format: DiskFormat::Raw
                },
            ]
        );
    }

    #[test]
    fn test_download_file_name() {
        assert_eq!(download_file_name("http://x/focal.qcow2"), "disk0.qcow2");
        assert_eq!(download_file_name("http://x/focal.img"), "disk0.img");
    }

    #[tokio::test]
    async fn test_download_runs_wget_into_image_dir() {
        let exec = Arc::new(FakeExecutor::new("kvm1"));
        let storage = backend(StorageKind::Btrfs, "/srv/rally", exec.clone());
        storage.download("base", "http://images/base.qcow2").await.unwrap();
        assert_eq!(
            exec.commands(),
            vec!["wget -nv -O '/srv/rally/images/base/disk0.qcow2' 'http://images/base.qcow2'"]
        );
    }

    #[tokio::test]
    async fn test_download_failure_has_context() {
        let exec = Arc::new(FakeExecutor::new("kvm1").on("wget", Reply::code(8)));
        let storage = backend(StorageKind::Btrfs, "/srv/rally", exec);
        let err = storage.download("base", "http://images/base.img").await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to download"));
    }
}
