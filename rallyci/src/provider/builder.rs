use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{Config, ImageConfig};
use crate::host::Host;
use crate::image::ImageBuilder;
use crate::network::BridgeScope;
use crate::vm::{Vm, VmSettings, VmSpec};

/// Builds configured images on one host: branch or download the artifact,
/// then run build scripts inside a disposable VM booted from it.
pub struct VirshImageBuilder<'a> {
    pub host: &'a Arc<Host>,
    pub config: &'a Config,
    pub settings: &'a VmSettings,
}

impl VirshImageBuilder<'_> {
    fn image(&self, name: &str) -> Result<&ImageConfig> {
        self.config
            .image(name)
            .ok_or_else(|| anyhow!("unknown image '{}'", name))
    }

    async fn run_build_scripts(&self, image: &ImageConfig) -> Result<()> {
        let net = if image.builder_net.is_empty() {
            self.config.provider.default_net.clone()
        } else {
            image.builder_net.clone()
        };
        let spec = VmSpec {
            image: image.name.clone(),
            memory_kib: image.builder_memory_mb * 1024,
            vcpus: image.builder_vcpus,
            net,
            use_image_volume: true,
        };
        // The builder VM counts against the host like any job VM.
        let reservation = self
            .host
            .reserve(spec.memory_kib, spec.vcpus, &self.config.provider)
            .await?;
        let mut vm = Vm::new(self.host.clone(), spec, self.settings.clone());
        let mut scope = BridgeScope::new();

        let result = match vm.boot(&mut scope).await {
            Ok(()) => {
                self.host.settle(reservation, vec![vm.share()]);
                self.provision(&mut vm, image).await
            }
            Err(e) => {
                self.host.release(reservation);
                Err(e)
            }
        };
        vm.destroy().await;
        self.host.release_bridges(&mut scope).await;
        result
    }

    async fn provision(&self, vm: &mut Vm, image: &ImageConfig) -> Result<()> {
        vm.get_address(self.config.provider.address_timeout()).await?;

        let env = BTreeMap::from([("RCI_IMAGE".to_string(), image.name.clone())]);
        // Image builds are shared between jobs and run to completion.
        let never = CancellationToken::new();
        for name in &image.build_scripts {
            let script = self
                .config
                .script(name)
                .ok_or_else(|| anyhow!("unknown script '{}'", name))?;
            vm.run_script(script, &env, &never)
                .await?
                .check(&format!("build script {}", name))?;
        }

        // Flush the guest filesystem before the artifact is snapshotted.
        vm.shutdown(self.config.provider.shutdown_timeout()).await
    }
}

#[async_trait]
impl<'a> ImageBuilder for VirshImageBuilder<'a> {
    fn parent(&self, image: &str) -> Option<String> {
        self.config.image(image).and_then(|i| i.parent.clone())
    }

    async fn exists(&self, image: &str) -> Result<bool> {
        self.host.storage().image_exists(image).await
    }

    async fn discard(&self, image: &str) -> Result<()> {
        self.host.storage().destroy_image(image).await
    }

    #[instrument(skip(self), fields(host = %self.host.name()))]
    async fn build(&self, image: &str) -> Result<()> {
        let cfg = self.image(image)?;
        let storage = self.host.storage();
        storage.create_image(image, cfg.parent.as_deref()).await?;
        if cfg.parent.is_none() {
            if let Some(url) = &cfg.url {
                info!(url = %url, "downloading image");
                storage.download(image, url).await?;
            }
        }
        if !cfg.build_scripts.is_empty() {
            self.run_build_scripts(cfg)
                .await
                .with_context(|| format!("builder vm for {}", image))?;
        }
        Ok(())
    }

    async fn finalize(&self, image: &str) -> Result<()> {
        self.host.storage().snapshot_image(image).await
    }
}
