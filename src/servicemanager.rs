//! # Service Catalog
//!
//! Mirror of the layer catalog for service images, keyed by
//! `(service_id, version)`. A service may keep several installed versions
//! but at most one is `Active`; promotion from `Cached` is metadata-only.
//! Installing a service pins the overlay layers its manifest lists.

use crate::error::{Error, Result};
use crate::imagehandler::{read_manifest, ImageHandler, ImageManifest};
use crate::layermanager::{Downloader, LayerManager};
use crate::spaceallocator::{ItemRemover, SpaceAllocator};
use crate::storage::Storage;
use crate::types::{CancelSource, ItemState, ServiceData, ServiceInfo};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type InstallOutcome = std::result::Result<(), String>;
type InFlightMap = Mutex<HashMap<String, watch::Receiver<Option<InstallOutcome>>>>;

/// Catalog of installed service versions.
pub struct ServiceManager {
    services_dir: PathBuf,
    download_dir: PathBuf,
    ttl: Duration,
    storage: Arc<dyn Storage>,
    downloader: Arc<dyn Downloader>,
    layer_manager: Arc<LayerManager>,
    image_handler: ImageHandler,
    services_allocator: Arc<SpaceAllocator>,
    download_allocator: Arc<SpaceAllocator>,
    in_flight: InFlightMap,
    cancel_source: CancelSource,
}

impl ServiceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services_dir: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
        ttl: Duration,
        storage: Arc<dyn Storage>,
        downloader: Arc<dyn Downloader>,
        layer_manager: Arc<LayerManager>,
        services_allocator: Arc<SpaceAllocator>,
        download_allocator: Arc<SpaceAllocator>,
    ) -> Arc<Self> {
        let (cancel_source, _) = CancelSource::new();

        Arc::new(Self {
            services_dir: services_dir.into(),
            download_dir: download_dir.into(),
            ttl,
            storage,
            downloader,
            layer_manager,
            image_handler: ImageHandler::new(),
            services_allocator,
            download_allocator,
            in_flight: Mutex::new(HashMap::new()),
            cancel_source,
        })
    }

    /// Registers the eviction callback, drops damaged rows, and seeds the
    /// allocator with cached entries. Must run once at startup.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.services_dir)?;
        fs::create_dir_all(&self.download_dir)?;

        let remover: Arc<dyn ItemRemover> = self.clone();
        self.services_allocator.register_remover(&remover);

        self.remove_damaged_service_folders()?;

        for service in self.storage.services()? {
            if service.state == ItemState::Cached {
                self.services_allocator.add_outdated_item(
                    &row_key(&service.service_id, &service.version),
                    service.size,
                    service.timestamp,
                );
            }
        }

        Ok(())
    }

    /// Aborts in-flight installs; called during shutdown.
    pub fn stop(&self) {
        self.cancel_source.cancel();
    }

    /// Ensures every desired `(service_id, version)` is installed and
    /// `Active`, demoting versions no longer desired. Install failures are
    /// returned per service ID.
    pub async fn process_desired_services(
        &self,
        desired: &[ServiceInfo],
    ) -> Result<HashMap<String, Error>> {
        let mut failed = HashMap::new();

        for info in desired {
            if let Err(err) = self.ensure_service(info).await {
                error!(service = %info.service_id, version = %info.version, %err,
                    "service install failed");
                failed.insert(info.service_id.clone(), err);
            }
        }

        for service in self.storage.services()? {
            let still_desired = desired.iter().any(|info| {
                info.service_id == service.service_id && info.version == service.version
            });
            if service.state == ItemState::Active && !still_desired {
                self.demote(&service)?;
            }
        }

        Ok(failed)
    }

    /// Returns the `Active` row for a service ID.
    pub fn get_service(&self, service_id: &str) -> Result<ServiceData> {
        self.storage
            .services()?
            .into_iter()
            .find(|service| service.service_id == service_id && service.state == ItemState::Active)
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))
    }

    /// Returns every known service row; used by the launcher removal sweep.
    pub fn get_all_services(&self) -> Result<Vec<ServiceData>> {
        self.storage.services()
    }

    /// Reads the installed image manifest of a service row.
    pub fn service_manifest(&self, service: &ServiceData) -> Result<ImageManifest> {
        read_manifest(&Path::new(&service.image_path).join(crate::imagehandler::MANIFEST_FILE_NAME))
    }

    /// Drops rows whose install directory no longer exists. Startup only.
    pub fn remove_damaged_service_folders(&self) -> Result<()> {
        for service in self.storage.services()? {
            if !Path::new(&service.image_path).exists() {
                warn!(
                    service = %service.service_id,
                    version = %service.version,
                    "dropping damaged service row"
                );
                self.storage
                    .remove_service(&service.service_id, &service.version)?;
            }
        }

        Ok(())
    }

    /// Removes cached rows older than the TTL and frees their bytes.
    pub fn remove_outdated(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        for service in self.storage.services()? {
            if service.state == ItemState::Cached && service.timestamp < cutoff {
                info!(
                    service = %service.service_id,
                    version = %service.version,
                    "removing outdated service"
                );
                self.services_allocator
                    .restore_outdated_item(&row_key(&service.service_id, &service.version));
                let _ = fs::remove_dir_all(&service.image_path);
                self.storage
                    .remove_service(&service.service_id, &service.version)?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Install
    // =========================================================================

    async fn ensure_service(&self, info: &ServiceInfo) -> Result<()> {
        if let Some(existing) = self.find_version(&info.service_id, &info.version)? {
            if existing.state != ItemState::Active {
                self.promote(existing)?;
            }
            // Re-pin the manifest layers; an earlier sweep may have
            // demoted them.
            if let Ok(manifest) = self.service_manifest(&self.get_service(&info.service_id)?) {
                self.pin_layers(&manifest)?;
            }
            return Ok(());
        }

        let key = row_key(&info.service_id, &info.version);
        let waiter = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            match in_flight.get(&key) {
                Some(rx) => Waiter::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.clone(), rx);
                    Waiter::Lead(tx)
                }
            }
        };

        match waiter {
            Waiter::Join(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| Error::Failed("service install aborted".to_string()))?
                    .clone()
                    .expect("in-flight outcome set");
                outcome.map_err(Error::Failed)
            }
            Waiter::Lead(tx) => {
                let result = self.install_service(info).await;
                let _ = tx.send(Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string())));
                self.in_flight
                    .lock()
                    .expect("in-flight lock poisoned")
                    .remove(&key);
                result
            }
        }
    }

    async fn install_service(&self, info: &ServiceInfo) -> Result<()> {
        debug!(service = %info.service_id, version = %info.version, "installing service");

        let download_space = self.download_allocator.allocate_space(info.size)?;
        let install_space = match self
            .services_allocator
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
            .join(format!("service-{}", uuid::Uuid::new_v4()));

        let result = self.fetch_and_unpack(info, &archive).await;
        let _ = fs::remove_file(&archive);

        match result {
            Ok(()) => {
                self.download_allocator.free_space(download_space);
                self.services_allocator.accept_space(install_space)?;
                info!(service = %info.service_id, version = %info.version, "service active");
                Ok(())
            }
            Err(err) => {
                self.download_allocator.free_space(download_space);
                self.services_allocator.free_space(install_space);
                Err(err)
            }
        }
    }

    async fn fetch_and_unpack(&self, info: &ServiceInfo, archive: &Path) -> Result<()> {
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
            .install_service(archive, &self.services_dir, info)?;

        // A newly active version displaces any previously active one.
        self.deactivate_other_versions(&info.service_id, &info.version)?;

        self.storage.upsert_service(&ServiceData {
            service_id: info.service_id.clone(),
            provider_id: info.provider_id.clone(),
            version: info.version.clone(),
            gid: info.gid,
            url: info.url.clone(),
            sha256: info.sha256.clone(),
            size: installed.size,
            image_path: installed.path.to_string_lossy().to_string(),
            timestamp: Utc::now(),
            state: ItemState::Active,
            manifest_digest: installed.manifest_digest,
        })?;

        self.pin_layers(&installed.manifest)?;

        Ok(())
    }

    /// Marks the manifest's layer digests `Active` in the layer catalog.
    fn pin_layers(&self, manifest: &ImageManifest) -> Result<()> {
        let digests: Vec<String> = manifest
            .layers
            .iter()
            .map(|descriptor| descriptor.digest.clone())
            .collect();
        self.layer_manager.use_layers(&digests)
    }

    fn find_version(&self, service_id: &str, version: &str) -> Result<Option<ServiceData>> {
        Ok(self.storage.services()?.into_iter().find(|service| {
            service.service_id == service_id
                && service.version == version
                && service.state != ItemState::Removed
        }))
    }

    /// Metadata-only promotion of a cached version to `Active`.
    fn promote(&self, mut service: ServiceData) -> Result<()> {
        debug!(
            service = %service.service_id,
            version = %service.version,
            "promoting cached service"
        );

        self.deactivate_other_versions(&service.service_id, &service.version)?;

        let key = row_key(&service.service_id, &service.version);
        service.state = ItemState::Active;
        service.timestamp = Utc::now();
        self.storage.upsert_service(&service)?;
        self.services_allocator.restore_outdated_item(&key);

        Ok(())
    }

    fn demote(&self, service: &ServiceData) -> Result<()> {
        debug!(
            service = %service.service_id,
            version = %service.version,
            "demoting unused service"
        );

        let mut cached = service.clone();
        cached.state = ItemState::Cached;
        cached.timestamp = Utc::now();
        self.storage.upsert_service(&cached)?;
        self.services_allocator.add_outdated_item(
            &row_key(&service.service_id, &service.version),
            service.size,
            cached.timestamp,
        );

        Ok(())
    }

    /// Keeps the single-active-version invariant: demotes every other
    /// `Active` row of the same service ID.
    fn deactivate_other_versions(&self, service_id: &str, version: &str) -> Result<()> {
        for service in self.storage.services()? {
            if service.service_id == service_id
                && service.version != version
                && service.state == ItemState::Active
            {
                self.demote(&service)?;
            }
        }

        Ok(())
    }
}

impl ItemRemover for ServiceManager {
    /// Space-eviction callback; `key` is `<service_id>/<version>`.
    fn remove_item(&self, key: &str) -> Result<()> {
        let (service_id, version) = key
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("bad service key '{key}'")))?;

        let service = self
            .find_version(service_id, version)?
            .ok_or_else(|| Error::NotFound(format!("service {key}")))?;

        let _ = fs::remove_dir_all(&service.image_path);
        self.storage.remove_service(service_id, version)
    }
}

fn row_key(service_id: &str, version: &str) -> String {
    format!("{service_id}/{version}")
}

enum Waiter {
    Lead(watch::Sender<Option<InstallOutcome>>),
    Join(watch::Receiver<Option<InstallOutcome>>),
}
