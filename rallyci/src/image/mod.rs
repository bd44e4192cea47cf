use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::RallyError;

/// Host-specific steps the cache drives to produce an image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Declared parent of `image`, if any.
    fn parent(&self, image: &str) -> Option<String>;

    /// Whether the finalized artifact exists in storage.
    async fn exists(&self, image: &str) -> Result<bool>;

    /// Remove any partial artifact. Must succeed when there is none.
    async fn discard(&self, image: &str) -> Result<()>;

    /// Produce the writable artifact (branch from the parent or download)
    /// and run the build scripts. Any disposable VM is gone on return.
    async fn build(&self, image: &str) -> Result<()>;

    /// Snapshot the artifact so it becomes visible to `exists`.
    async fn finalize(&self, image: &str) -> Result<()>;
}

type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Lock and last outcome for one image name.
#[derive(Default)]
struct BuildSlot {
    /// Held for the whole check-build-snapshot sequence. Stores the failure
    /// reason of the most recent build, `None` after a success.
    last_failure: tokio::sync::Mutex<Option<String>>,
    /// Bumped every time a build finishes.
    generation: AtomicU64,
}

/// Build-once cache of images on a single host.
///
/// Every image name gets its own lock, created on first use. Callers
/// asking for the same name serialize on it; callers that queued while a
/// build was running get that build's outcome instead of starting another.
#[derive(Default)]
pub struct ImageCache {
    slots: Mutex<HashMap<String, Arc<BuildSlot>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<BuildSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(name.to_string()).or_default().clone()
    }

    /// Make sure `name` (and, first, its parent chain) is built.
    pub fn ensure_built<'a>(&'a self, name: &'a str, builder: &'a dyn ImageBuilder) -> BuildFuture<'a> {
        Box::pin(async move {
            let slot = self.slot(name);
            let seen = slot.generation.load(Ordering::SeqCst);
            let mut last_failure = slot.last_failure.lock().await;

            if slot.generation.load(Ordering::SeqCst) != seen {
                if let Some(reason) = last_failure.as_ref() {
                    debug!(image = %name, "observed concurrent build failure");
                    return Err(RallyError::BuildFailed {
                        name: name.to_string(),
                        reason: reason.clone(),
                    }
                    .into());
                }
            }

            if builder.exists(name).await? {
                debug!(image = %name, "image cache hit");
                return Ok(());
            }

            let result = self.build_locked(name, builder).await;
            *last_failure = result.as_ref().err().map(|e| format!("{:#}", e));
            slot.generation.fetch_add(1, Ordering::SeqCst);
            result
        })
    }

    async fn build_locked(&self, name: &str, builder: &dyn ImageBuilder) -> Result<()> {
        info!(image = %name, "building image");
        builder
            .discard(name)
            .await
            .with_context(|| format!("failed to remove stale artifact of {}", name))?;

        if let Some(parent) = builder.parent(name) {
            self.ensure_built(&parent, builder)
                .await
                .with_context(|| format!("parent image of {}", name))?;
        }

        let outcome = match builder.build(name).await {
            Ok(()) => builder.finalize(name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            if let Err(cleanup) = builder.discard(name).await {
                warn!(image = %name, error = %cleanup, "failed to discard partial image");
            }
            return Err(RallyError::BuildFailed {
                name: name.to_string(),
                reason: format!("{:#}", e),
            }
            .into());
        }

        info!(image = %name, "image built");
        Ok(())
    }
}
