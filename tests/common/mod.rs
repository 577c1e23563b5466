//! Shared test doubles and archive builders for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use edgerun::bundle::{OverlayMount, RootfsMounter};
use edgerun::error::{Error, Result};
use edgerun::imagehandler::ImageHandler;
use edgerun::launcher::{NetworkManager, SmClient};
use edgerun::layermanager::Downloader;
use edgerun::runner::{HostSupervisor, UnitState, UnitStatus};
use edgerun::spaceallocator::PlatformFs;
use edgerun::types::{Alert, CancelToken, LayerInfo, NetworkParameters, RunStatus, ServiceInfo};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Archive Builders
// =============================================================================

/// A built test archive with everything a desired-state entry needs.
pub struct TestArchive {
    pub path: PathBuf,
    /// Tree digest of the unpacked content, `sha256:<hex>`.
    pub digest: String,
    /// Hex transport checksum of the archive file.
    pub sha256: String,
    pub size: u64,
}

/// Packs `staging` into a gzipped tar at `archive_path`.
fn pack(staging: &Path, archive_path: &Path) -> TestArchive {
    let file = File::create(archive_path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", staging).unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    let content = fs::read(archive_path).unwrap();
    let sha256 = hex::encode(Sha256::digest(&content));
    let digest = ImageHandler::new().calculate_digest(staging).unwrap();

    TestArchive {
        path: archive_path.to_path_buf(),
        digest,
        sha256,
        size: content.len() as u64,
    }
}

/// Builds a layer archive containing the given files.
pub fn build_layer_archive(work_dir: &Path, name: &str, files: &[(&str, &[u8])]) -> TestArchive {
    let staging = work_dir.join(format!("{name}-staging"));
    for (rel, content) in files {
        let path = staging.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pack(&staging, &work_dir.join(format!("{name}.tar.gz")))
}

/// Builds a service archive (manifest + config + rootfs) depending on the
/// given layer digests.
pub fn build_service_archive(
    work_dir: &Path,
    name: &str,
    layer_digests: &[&str],
) -> TestArchive {
    build_service_archive_with_config(
        work_dir,
        name,
        layer_digests,
        serde_json::json!({
            "entrypoint": ["/bin/app"],
            "cmd": [],
            "env": ["APP_MODE=edge"],
            "workingDir": "/",
            "devices": []
        }),
    )
}

/// Like [`build_service_archive`] with a caller-supplied runtime config
/// section (`devices`, `groups`, `resources`, ...).
pub fn build_service_archive_with_config(
    work_dir: &Path,
    name: &str,
    layer_digests: &[&str],
    runtime_config: serde_json::Value,
) -> TestArchive {
    let staging = work_dir.join(format!("{name}-staging"));
    fs::create_dir_all(staging.join("rootfs/bin")).unwrap();
    fs::write(staging.join("rootfs/bin/app"), b"#!/bin/sh\necho app\n").unwrap();

    let config = serde_json::json!({ "config": runtime_config });
    fs::write(
        staging.join("config.json"),
        serde_json::to_vec_pretty(&config).unwrap(),
    )
    .unwrap();

    let config_bytes = fs::read(staging.join("config.json")).unwrap();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", hex::encode(Sha256::digest(&config_bytes))),
            "size": config_bytes.len()
        },
        "layers": layer_digests
            .iter()
            .map(|digest| serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": 0
            }))
            .collect::<Vec<_>>()
    });
    fs::write(
        staging.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();

    pack(&staging, &work_dir.join(format!("{name}.tar.gz")))
}

/// Desired-state layer entry for a built archive.
pub fn layer_info(layer_id: &str, archive: &TestArchive) -> LayerInfo {
    LayerInfo {
        layer_id: layer_id.to_string(),
        digest: archive.digest.clone(),
        version: "1.0".to_string(),
        url: format!("https://downloads.test/{layer_id}"),
        sha256: archive.sha256.clone(),
        size: archive.size,
    }
}

/// Desired-state service entry for a built archive.
pub fn service_info(service_id: &str, version: &str, archive: &TestArchive) -> ServiceInfo {
    ServiceInfo {
        service_id: service_id.to_string(),
        provider_id: "provider1".to_string(),
        version: version.to_string(),
        gid: 1000,
        url: format!("https://downloads.test/{service_id}/{version}"),
        sha256: archive.sha256.clone(),
        size: archive.size,
    }
}

// =============================================================================
// Downloader Double
// =============================================================================

/// Serves registered archives from disk, counting calls per URL.
#[derive(Default)]
pub struct FileDownloader {
    sources: Mutex<HashMap<String, PathBuf>>,
    counts: Mutex<HashMap<String, usize>>,
    /// Artificial transfer time, to widen concurrency windows.
    pub delay: Option<Duration>,
}

impl FileDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: &str, path: &Path) {
        self.sources
            .lock()
            .unwrap()
            .insert(url.to_string(), path.to_path_buf());
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.counts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Downloader for FileDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        _size: u64,
        _sha256: &str,
        _cancel: CancelToken,
    ) -> Result<()> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let source = self
            .sources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::DownloadFailed {
                url: url.to_string(),
                reason: "no such test artifact".to_string(),
            })?;

        fs::copy(&source, dest)?;
        Ok(())
    }
}

// =============================================================================
// Filesystem Double
// =============================================================================

/// Fixed-capacity partition double.
pub struct FakeFs {
    pub total: u64,
    pub used: AtomicU64,
}

impl FakeFs {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            used: AtomicU64::new(0),
        })
    }

    pub fn with_used(total: u64, used: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            used: AtomicU64::new(used),
        })
    }

    pub fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl PlatformFs for FakeFs {
    fn total_size(&self, _path: &Path) -> Result<u64> {
        Ok(self.total)
    }

    fn available_size(&self, _path: &Path) -> Result<u64> {
        Ok(self.total - self.used.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Supervisor Double
// =============================================================================

#[derive(Default)]
pub struct SupervisorInner {
    pub units: HashMap<String, UnitStatus>,
    /// State a unit enters right after `start_unit`; `Active` by default.
    pub start_state: HashMap<String, UnitState>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub reset: Vec<String>,
    /// Scripted `list_units` responses; when drained, the unit map is used.
    pub poll_script: VecDeque<Vec<UnitStatus>>,
}

/// Programmable host-supervisor double.
#[derive(Default)]
pub struct MockSupervisor {
    pub inner: Mutex<SupervisorInner>,
}

impl MockSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next start of `unit` land in `state` instead of `active`.
    pub fn set_start_state(&self, unit: &str, state: UnitState) {
        self.inner
            .lock()
            .unwrap()
            .start_state
            .insert(unit.to_string(), state);
    }

    /// Queues a scripted poll response, also applied to the unit map.
    pub fn push_poll(&self, statuses: Vec<UnitStatus>) {
        self.inner.lock().unwrap().poll_script.push_back(statuses);
    }

    pub fn started_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn stopped_units(&self) -> Vec<String> {
        self.inner.lock().unwrap().stopped.clone()
    }
}

#[async_trait]
impl HostSupervisor for MockSupervisor {
    async fn start_unit(&self, name: &str, _mode: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.started.push(name.to_string());

        let state = inner
            .start_state
            .get(name)
            .copied()
            .unwrap_or(UnitState::Active);
        inner.units.insert(
            name.to_string(),
            UnitStatus {
                name: name.to_string(),
                active_state: state,
                exit_code: None,
            },
        );
        Ok(())
    }

    async fn stop_unit(&self, name: &str, _mode: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped.push(name.to_string());

        if inner.units.remove(name).is_none() {
            return Err(Error::NotFound(format!("unit {name}")));
        }
        Ok(())
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().reset.push(name.to_string());
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<UnitStatus>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(scripted) = inner.poll_script.pop_front() {
            for status in &scripted {
                inner.units.insert(status.name.clone(), status.clone());
            }
            return Ok(scripted);
        }

        Ok(inner.units.values().cloned().collect())
    }

    async fn get_unit_status(&self, name: &str) -> Result<UnitStatus> {
        self.inner
            .lock()
            .unwrap()
            .units
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unit {name}")))
    }
}

// =============================================================================
// Run Status Receiver Double
// =============================================================================

/// Records run-status snapshots published by the runner monitor.
#[derive(Default)]
pub struct RecordingReceiver {
    pub snapshots: Mutex<Vec<Vec<RunStatus>>>,
}

impl RecordingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<Vec<RunStatus>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Vec<RunStatus>> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

impl edgerun::runner::RunStatusReceiver for RecordingReceiver {
    fn update_run_status(&self, statuses: Vec<RunStatus>) {
        self.snapshots.lock().unwrap().push(statuses);
    }
}

// =============================================================================
// Uplink Double
// =============================================================================

/// Records everything sent toward the communication manager.
#[derive(Default)]
pub struct RecordingClient {
    pub run_statuses: Mutex<Vec<Vec<RunStatus>>>,
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_run_status(&self) -> Option<Vec<RunStatus>> {
        self.run_statuses.lock().unwrap().last().cloned()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

#[async_trait]
impl SmClient for RecordingClient {
    async fn send_run_status(&self, statuses: Vec<RunStatus>) -> Result<()> {
        self.run_statuses.lock().unwrap().push(statuses);
        Ok(())
    }

    async fn send_monitoring_data(&self, _data: edgerun::monitoring::MonitoringData) -> Result<()> {
        Ok(())
    }

    async fn send_alert(&self, alert: Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }

    async fn send_log(&self, _log: edgerun::logprovider::LogPart) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Network Double
// =============================================================================

#[derive(Default)]
pub struct MockNetwork {
    pub setups: Mutex<Vec<String>>,
    pub releases: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl NetworkManager for MockNetwork {
    async fn setup_instance_network(
        &self,
        instance_id: &str,
        _params: &NetworkParameters,
    ) -> Result<PathBuf> {
        self.setups.lock().unwrap().push(instance_id.to_string());
        Ok(PathBuf::from(format!("/run/netns/{instance_id}")))
    }

    async fn release_instance_network(&self, instance_id: &str) -> Result<()> {
        self.releases.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Mounter Double
// =============================================================================

/// Records overlay mount calls without touching the kernel.
#[derive(Default)]
pub struct NoopMounter {
    pub mounts: Mutex<Vec<OverlayMount>>,
    pub umounts: Mutex<Vec<OverlayMount>>,
}

impl NoopMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RootfsMounter for NoopMounter {
    fn mount(&self, overlay: &OverlayMount) -> Result<()> {
        self.mounts.lock().unwrap().push(overlay.clone());
        Ok(())
    }

    fn umount(&self, overlay: &OverlayMount) -> Result<()> {
        self.umounts.lock().unwrap().push(overlay.clone());
        Ok(())
    }
}
