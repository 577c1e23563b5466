//! # Layer Catalog
//!
//! Install-on-demand catalog of overlay layers, keyed by content digest.
//! Desired layers are pulled through the [`Downloader`] collaborator into
//! the layers partition; layers no longer desired are demoted to `Cached`
//! and become eligible for TTL removal and space eviction.
//!
//! ## Install Coalescing
//!
//! Concurrent installs of the same digest are coalesced: the first caller
//! inserts a completion channel into the in-flight map and performs the
//! download/unpack; later callers wait on that channel and share the
//! outcome. Exactly one downloader call and one unpack happen per digest.

use crate::error::{Error, Result};
use crate::imagehandler::ImageHandler;
use crate::spaceallocator::{ItemRemover, SpaceAllocator};
use crate::storage::Storage;
use crate::types::{CancelSource, CancelToken, ItemState, LayerData, LayerInfo};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Artifact download collaborator.
///
/// Implementations fetch `url` into `dest`, verifying `sha256` on the fly
/// where possible, and abort promptly when `cancel` fires.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        size: u64,
        sha256: &str,
        cancel: CancelToken,
    ) -> Result<()>;
}

type InstallOutcome = std::result::Result<(), String>;
type InFlightMap = Mutex<HashMap<String, watch::Receiver<Option<InstallOutcome>>>>;

/// Catalog of installed overlay layers.
pub struct LayerManager {
    layers_dir: PathBuf,
    download_dir: PathBuf,
    ttl: Duration,
    storage: Arc<dyn Storage>,
    downloader: Arc<dyn Downloader>,
    image_handler: ImageHandler,
    layers_allocator: Arc<SpaceAllocator>,
    download_allocator: Arc<SpaceAllocator>,
    in_flight: InFlightMap,
    cancel_source: CancelSource,
}

impl LayerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layers_dir: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
        ttl: Duration,
        storage: Arc<dyn Storage>,
        downloader: Arc<dyn Downloader>,
        layers_allocator: Arc<SpaceAllocator>,
        download_allocator: Arc<SpaceAllocator>,
    ) -> Arc<Self> {
        let (cancel_source, _) = CancelSource::new();

        Arc::new(Self {
            layers_dir: layers_dir.into(),
            download_dir: download_dir.into(),
            ttl,
            storage,
            downloader,
            image_handler: ImageHandler::new(),
            layers_allocator,
            download_allocator,
            in_flight: Mutex::new(HashMap::new()),
            cancel_source,
        })
    }

    /// Registers the manager as its partition's eviction callback, drops
    /// damaged rows, and seeds the allocator with cached entries.
    ///
    /// Must run once at startup before any install.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.layers_dir)?;
        fs::create_dir_all(&self.download_dir)?;

        let remover: Arc<dyn ItemRemover> = self.clone();
        self.layers_allocator.register_remover(&remover);

        self.remove_damaged_layer_folders()?;

        for layer in self.storage.layers()? {
            if layer.state == ItemState::Cached {
                self.layers_allocator
                    .add_outdated_item(&layer.digest, layer.size, layer.timestamp);
            }
        }

        Ok(())
    }

    /// Aborts in-flight installs; called during shutdown.
    pub fn stop(&self) {
        self.cancel_source.cancel();
    }

    /// Ensures every desired digest is installed and `Active`, demoting
    /// active layers that are no longer desired.
    ///
    /// Install failures do not abort the sweep; they are returned per
    /// digest so the launcher can fail only the dependent instances.
    pub async fn process_desired_layers(
        &self,
        desired: &[LayerInfo],
    ) -> Result<HashMap<String, Error>> {
        let mut failed = HashMap::new();

        for info in desired {
            if let Err(err) = self.ensure_layer(info).await {
                error!(digest = %info.digest, %err, "layer install failed");
                failed.insert(info.digest.clone(), err);
            }
        }

        // Demote active layers that are no longer referenced.
        for layer in self.storage.layers()? {
            if layer.state == ItemState::Active
                && !desired.iter().any(|info| info.digest == layer.digest)
            {
                self.demote(&layer)?;
            }
        }

        Ok(failed)
    }

    /// Returns the catalog row for a digest.
    pub fn get_layer(&self, digest: &str) -> Result<LayerData> {
        self.storage
            .layers()?
            .into_iter()
            .find(|layer| layer.digest == digest && layer.state != ItemState::Removed)
            .ok_or_else(|| Error::NotFound(format!("layer {digest}")))
    }

    /// Drops rows whose install directory no longer exists and removes
    /// unpacked directories with no row. Startup only.
    pub fn remove_damaged_layer_folders(&self) -> Result<()> {
        let layers = self.storage.layers()?;

        for layer in &layers {
            if !Path::new(&layer.path).exists() {
                warn!(digest = %layer.digest, path = %layer.path, "dropping damaged layer row");
                self.storage.remove_layer(&layer.digest)?;
            }
        }

        // Orphaned directories: unpacked content without a catalog row.
        for shard in fs::read_dir(&self.layers_dir)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for dir in fs::read_dir(&shard)? {
                let dir = dir?.path();
                let known = layers.iter().any(|layer| Path::new(&layer.path) == dir);
                if !known {
                    warn!(path = %dir.display(), "removing orphaned layer folder");
                    let _ = fs::remove_dir_all(&dir);
                }
            }
        }

        Ok(())
    }

    /// Removes cached rows older than the TTL and frees their bytes.
    pub fn remove_outdated(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        for layer in self.storage.layers()? {
            if layer.state == ItemState::Cached && layer.timestamp < cutoff {
                info!(digest = %layer.digest, "removing outdated layer");
                self.layers_allocator.restore_outdated_item(&layer.digest);
                let _ = fs::remove_dir_all(&layer.path);
                self.storage.remove_layer(&layer.digest)?;
            }
        }

        Ok(())
    }

    /// Marks installed layers `Active` on behalf of a service that lists
    /// them in its manifest.
    pub fn use_layers(&self, digests: &[String]) -> Result<()> {
        for digest in digests {
            if let Ok(mut layer) = self.get_layer(digest) {
                if layer.state != ItemState::Active {
                    layer.state = ItemState::Active;
                    layer.timestamp = Utc::now();
                    self.storage.upsert_layer(&layer)?;
                    self.layers_allocator.restore_outdated_item(digest);
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // Install
    // =========================================================================

    async fn ensure_layer(&self, info: &LayerInfo) -> Result<()> {
        // Fast path: already installed.
        if let Ok(layer) = self.get_layer(&info.digest) {
            if layer.state != ItemState::Active {
                self.promote(layer)?;
            }
            return Ok(());
        }

        // Coalesce with a concurrent install of the same digest.
        let waiter = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            match in_flight.get(&info.digest) {
                Some(rx) => Waiter::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(info.digest.clone(), rx);
                    Waiter::Lead(tx)
                }
            }
        };

        match waiter {
            Waiter::Join(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| Error::Failed("layer install aborted".to_string()))?
                    .clone()
                    .expect("in-flight outcome set");
                outcome.map_err(Error::Failed)
            }
            Waiter::Lead(tx) => {
                let result = self.install_layer(info).await;
                let _ = tx.send(Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string())));
                self.in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&info.digest);
                result
            }
        }
    }

    async fn install_layer(&self, info: &LayerInfo) -> Result<()> {
        debug!(digest = %info.digest, url = %info.url, "installing layer");

        let download_space = self.download_allocator.allocate_space(info.size)?;
        let install_space = match self
            .layers_allocator
            .allocate_space(info.size * crate::constants::UNPACK_SIZE_FACTOR)
        {
            Ok(space) => space,
            Err(err) => {
                self.download_allocator.free_space(download_space);
                return Err(err);
            }
        };

        let archive = self
            .download_dir
            .join(format!("layer-{}", uuid::Uuid::new_v4()));

        let result = self.fetch_and_unpack(info, &archive).await;
        let _ = fs::remove_file(&archive);

        match result {
            Ok(installed_size) => {
                self.download_allocator.free_space(download_space);
                self.layers_allocator.accept_space(install_space)?;
                info!(digest = %info.digest, size = installed_size, "layer active");
                Ok(())
            }
            Err(err) => {
                self.download_allocator.free_space(download_space);
                self.layers_allocator.free_space(install_space);
                Err(err)
            }
        }
    }

    async fn fetch_and_unpack(&self, info: &LayerInfo, archive: &Path) -> Result<u64> {
        self.downloader
            .download(
                &info.url,
                archive,
                info.size,
                &info.sha256,
                self.cancel_source.token(),
            )
            .await?;

        let installed = self
            .image_handler
            .install_layer(archive, &self.layers_dir, info)?;

        // The row lands only after a verified install.
        self.storage.upsert_layer(&LayerData {
            layer_id: info.layer_id.clone(),
            digest: info.digest.clone(),
            version: info.version.clone(),
            url: info.url.clone(),
            sha256: info.sha256.clone(),
            size: installed.size,
            path: installed.path.to_string_lossy().to_string(),
            timestamp: Utc::now(),
            state: ItemState::Active,
        })?;

        Ok(installed.size)
    }

    fn promote(&self, mut layer: LayerData) -> Result<()> {
        debug!(digest = %layer.digest, "promoting cached layer");

        layer.state = ItemState::Active;
        layer.timestamp = Utc::now();
        self.storage.upsert_layer(&layer)?;
        self.layers_allocator.restore_outdated_item(&layer.digest);

        Ok(())
    }

    fn demote(&self, layer: &LayerData) -> Result<()> {
        debug!(digest = %layer.digest, "demoting unused layer");

        let mut cached = layer.clone();
        cached.state = ItemState::Cached;
        cached.timestamp = Utc::now();
        self.storage.upsert_layer(&cached)?;
        self.layers_allocator
            .add_outdated_item(&layer.digest, layer.size, cached.timestamp);

        Ok(())
    }
}

enum Waiter {
    Lead(watch::Sender<Option<InstallOutcome>>),
    Join(watch::Receiver<Option<InstallOutcome>>),
}

impl ItemRemover for LayerManager {
    /// Space-eviction callback: deletes the layer's files and row.
    /// Only `Cached` layers are ever registered as evictable.
    fn remove_item(&self, key: &str) -> Result<()> {
        let layer = self.get_layer(key)?;
        let _ = fs::remove_dir_all(&layer.path);
        self.storage.remove_layer(key)
    }
}
