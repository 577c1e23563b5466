//! End-to-end reconciler tests.
//!
//! Wires the launcher to real managers and catalogs over test doubles for
//! the downloader, supervisor, network, and uplink, then drives full
//! desired-state pushes through it.

mod common;

use common::{
    build_layer_archive, build_service_archive, build_service_archive_with_config, layer_info,
    service_info, FakeFs, FileDownloader, MockNetwork, MockSupervisor, NoopMounter,
    RecordingClient,
};
use edgerun::bundle::BundleBuilder;
use edgerun::launcher::{Launcher, StatusForwarder};
use edgerun::layermanager::LayerManager;
use edgerun::runner::{create_unit_name, RunStatusReceiver, Runner};
use edgerun::servicemanager::ServiceManager;
use edgerun::spaceallocator::SpaceAllocator;
use edgerun::storage::{FileStorage, Storage};
use edgerun::types::{
    Alert, DesiredState, InstanceIdent, InstanceInfo, ItemState, NetworkParameters, RunState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const MIB: u64 = 1024 * 1024;

struct Fixture {
    temp: TempDir,
    storage: Arc<FileStorage>,
    downloader: Arc<FileDownloader>,
    supervisor: Arc<MockSupervisor>,
    client: Arc<RecordingClient>,
    network: Arc<MockNetwork>,
    layers: Arc<LayerManager>,
    services: Arc<ServiceManager>,
    launcher: Launcher,
    work_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(FileStorage::open(temp.path().join("state.json")).unwrap());
    let downloader = Arc::new(FileDownloader::new());
    let supervisor = MockSupervisor::new();
    let client = RecordingClient::new();
    let network = MockNetwork::new();
    let fs = FakeFs::new(512 * MIB);

    let download_allocator =
        Arc::new(SpaceAllocator::new(temp.path().join("downloads"), 0, fs.clone()));

    let layers = LayerManager::new(
        temp.path().join("layers"),
        temp.path().join("downloads"),
        Duration::from_secs(60 * 60),
        storage.clone(),
        downloader.clone(),
        Arc::new(SpaceAllocator::new(temp.path().join("layers"), 0, fs.clone())),
        download_allocator.clone(),
    );
    layers.init().unwrap();

    let services = ServiceManager::new(
        temp.path().join("services"),
        temp.path().join("downloads"),
        Duration::from_secs(60 * 60),
        storage.clone(),
        downloader.clone(),
        layers.clone(),
        Arc::new(SpaceAllocator::new(temp.path().join("services"), 0, fs)),
        download_allocator,
    );
    services.init().unwrap();

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let forwarder: Arc<dyn RunStatusReceiver> = Arc::new(StatusForwarder::new(status_tx));
    let runner = Arc::new(Runner::new(
        supervisor.clone(),
        forwarder,
        temp.path().join("dropins"),
    ));

    let host_root = temp.path().join("host");
    std::fs::create_dir_all(&host_root).unwrap();
    let bundle_builder =
        BundleBuilder::new(temp.path().join("runtimes"), vec![], vec![]).with_host_root(host_root);

    let launcher = Launcher::new(
        services.clone(),
        layers.clone(),
        bundle_builder,
        NoopMounter::new(),
        runner,
        network.clone(),
        client.clone(),
        storage.clone(),
        status_rx,
        8,
        Duration::from_secs(60 * 60),
    );
    launcher.start();

    let work_dir = temp.path().join("build");
    std::fs::create_dir_all(&work_dir).unwrap();

    Fixture {
        work_dir,
        temp,
        storage,
        downloader,
        supervisor,
        client,
        network,
        layers,
        services,
        launcher,
    }
}

impl Fixture {
    fn instance(&self, service_id: &str, subject: &str, index: u64, priority: u64) -> InstanceInfo {
        InstanceInfo {
            ident: InstanceIdent::new(service_id, subject, index),
            uid: 5000 + index as u32,
            priority,
            storage_path: self
                .temp
                .path()
                .join(format!("storages/{service_id}-{index}"))
                .to_string_lossy()
                .to_string(),
            state_path: self
                .temp
                .path()
                .join(format!("states/{service_id}-{index}"))
                .to_string_lossy()
                .to_string(),
            network_parameters: NetworkParameters::default(),
        }
    }

    async fn apply(&self, desired: DesiredState) {
        let mut settled = self.launcher.subscribe_settled();
        self.launcher.run_instances(desired);
        tokio::time::timeout(Duration::from_secs(10), settled.changed())
            .await
            .expect("reconcile must settle")
            .unwrap();
    }

    fn instance_id(&self, ident: &InstanceIdent) -> String {
        self.storage.instance_id(ident).unwrap().unwrap()
    }
}

// =============================================================================
// Scenario: cold start
// =============================================================================

#[tokio::test]
async fn empty_node_converges_to_desired_instance() {
    let fx = fixture();

    let layer_archive = build_layer_archive(&fx.work_dir, "l1", &[("lib/base.so", b"base")]);
    let layer = layer_info("L1", &layer_archive);
    fx.downloader.register(&layer.url, &layer_archive.path);

    let service_archive = build_service_archive(&fx.work_dir, "svc-a", &[&layer_archive.digest]);
    let service = service_info("serviceA", "1.0", &service_archive);
    fx.downloader.register(&service.url, &service_archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    fx.apply(DesiredState {
        instances: vec![instance],
        services: vec![service],
        layers: vec![layer],
        force_restart: false,
    })
    .await;

    // Artifacts are installed and active.
    assert_eq!(
        fx.layers.get_layer(&layer_archive.digest).unwrap().state,
        ItemState::Active
    );
    assert_eq!(
        fx.services.get_service("serviceA").unwrap().state,
        ItemState::Active
    );

    // The supervisor unit was started under the canonical name.
    let instance_id = fx.instance_id(&ident);
    assert_eq!(
        fx.supervisor.started_units(),
        vec![create_unit_name(&instance_id)]
    );

    // Current state equals the desired identity set.
    assert_eq!(fx.launcher.current_idents(), vec![ident]);

    let statuses = fx.launcher.run_status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, RunState::Active);
    assert_eq!(statuses[0].instance_id, instance_id);

    // The aggregate went to the communication manager.
    let sent = fx.client.last_run_status().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].state, RunState::Active);

    assert_eq!(fx.network.setups.lock().unwrap().as_slice(), [instance_id]);

    fx.launcher.stop().await;
}

// =============================================================================
// Scenario: instance removed
// =============================================================================

#[tokio::test]
async fn removed_instance_stops_and_artifacts_demote() {
    let fx = fixture();

    let layer_archive = build_layer_archive(&fx.work_dir, "l1", &[("lib/base.so", b"base")]);
    let layer = layer_info("L1", &layer_archive);
    fx.downloader.register(&layer.url, &layer_archive.path);

    let service_archive = build_service_archive(&fx.work_dir, "svc-a", &[&layer_archive.digest]);
    let service = service_info("serviceA", "1.0", &service_archive);
    fx.downloader.register(&service.url, &service_archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    fx.apply(DesiredState {
        instances: vec![instance],
        services: vec![service],
        layers: vec![layer],
        force_restart: false,
    })
    .await;

    let instance_id = fx.instance_id(&ident);
    let unit = create_unit_name(&instance_id);
    let drop_in_dir = fx.temp.path().join("dropins").join(format!("{unit}.d"));
    assert!(drop_in_dir.exists());

    // The next push no longer wants anything.
    fx.apply(DesiredState::default()).await;

    assert_eq!(fx.supervisor.stopped_units(), vec![unit]);
    assert!(!drop_in_dir.exists(), "drop-in must go with the instance");

    // No active row remains, but the version stays cached on disk.
    assert!(matches!(
        fx.services.get_service("serviceA"),
        Err(edgerun::Error::NotFound(_))
    ));
    let cached = fx
        .services
        .get_all_services()
        .unwrap()
        .into_iter()
        .find(|row| row.service_id == "serviceA")
        .unwrap();
    assert_eq!(cached.state, ItemState::Cached);
    assert_eq!(
        fx.layers.get_layer(&layer_archive.digest).unwrap().state,
        ItemState::Cached
    );

    assert!(fx.launcher.current_idents().is_empty());
    assert!(fx.launcher.run_status().is_empty());
    assert_eq!(
        fx.network.releases.lock().unwrap().as_slice(),
        [instance_id]
    );

    fx.launcher.stop().await;
}

// =============================================================================
// Scenario: bad layer only fails its dependents
// =============================================================================

#[tokio::test]
async fn corrupt_layer_fails_only_dependent_instances() {
    let fx = fixture();

    let good_layer_archive = build_layer_archive(&fx.work_dir, "good", &[("lib/ok.so", b"ok")]);
    let good_layer = layer_info("good", &good_layer_archive);
    fx.downloader.register(&good_layer.url, &good_layer_archive.path);

    let bad_layer_archive = build_layer_archive(&fx.work_dir, "bad", &[("lib/bad.so", b"bad")]);
    let mut bad_layer = layer_info("bad", &bad_layer_archive);
    bad_layer.sha256 = "00".repeat(32);
    fx.downloader.register(&bad_layer.url, &bad_layer_archive.path);

    let good_service_archive =
        build_service_archive(&fx.work_dir, "svc-good", &[&good_layer_archive.digest]);
    let good_service = service_info("goodService", "1.0", &good_service_archive);
    fx.downloader.register(&good_service.url, &good_service_archive.path);

    let bad_service_archive =
        build_service_archive(&fx.work_dir, "svc-bad", &[&bad_layer_archive.digest]);
    let bad_service = service_info("badService", "1.0", &bad_service_archive);
    fx.downloader.register(&bad_service.url, &bad_service_archive.path);

    let good_instance = fx.instance("goodService", "subject1", 0, 0);
    let bad_instance = fx.instance("badService", "subject1", 0, 0);

    fx.apply(DesiredState {
        instances: vec![good_instance.clone(), bad_instance.clone()],
        services: vec![good_service, bad_service],
        layers: vec![good_layer, bad_layer],
        force_restart: false,
    })
    .await;

    // The corrupt layer was never persisted.
    assert!(fx.layers.get_layer(&bad_layer_archive.digest).is_err());

    // Both identities are tracked; only the dependent one failed.
    let mut idents = fx.launcher.current_idents();
    idents.sort();
    assert_eq!(idents, vec![bad_instance.ident.clone(), good_instance.ident.clone()]);

    let statuses = fx.launcher.run_status();
    let bad_status = statuses
        .iter()
        .find(|s| s.instance_id == fx.instance_id(&bad_instance.ident))
        .unwrap();
    assert_eq!(bad_status.state, RunState::Failed);
    assert!(bad_status.error.as_deref().unwrap().contains("mismatch"));

    let good_status = statuses
        .iter()
        .find(|s| s.instance_id == fx.instance_id(&good_instance.ident))
        .unwrap();
    assert_eq!(good_status.state, RunState::Active);

    fx.launcher.stop().await;
}

// =============================================================================
// Restarts
// =============================================================================

#[tokio::test]
async fn force_restart_cycles_running_instances() {
    let fx = fixture();

    let service_archive = build_service_archive(&fx.work_dir, "svc-a", &[]);
    let service = service_info("serviceA", "1.0", &service_archive);
    fx.downloader.register(&service.url, &service_archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    let desired = DesiredState {
        instances: vec![instance],
        services: vec![service],
        layers: vec![],
        force_restart: false,
    };
    fx.apply(desired.clone()).await;

    let unit = create_unit_name(&fx.instance_id(&ident));
    assert_eq!(fx.supervisor.started_units(), vec![unit.clone()]);

    // Same desired state again: steady, nothing restarts.
    fx.apply(desired.clone()).await;
    assert_eq!(fx.supervisor.started_units().len(), 1);
    assert!(fx.supervisor.stopped_units().is_empty());

    // Force restart cycles the unit exactly once.
    let mut forced = desired;
    forced.force_restart = true;
    fx.apply(forced).await;

    assert_eq!(fx.supervisor.stopped_units(), vec![unit.clone()]);
    assert_eq!(fx.supervisor.started_units(), vec![unit.clone(), unit]);

    fx.launcher.stop().await;
}

#[tokio::test]
async fn version_change_restarts_instance() {
    let fx = fixture();

    let v1_archive = build_service_archive(&fx.work_dir, "svc-v1", &[]);
    let v1 = service_info("serviceA", "1.0", &v1_archive);
    fx.downloader.register(&v1.url, &v1_archive.path);

    let v2_archive = build_service_archive(&fx.work_dir, "svc-v2", &[]);
    let v2 = service_info("serviceA", "2.0", &v2_archive);
    fx.downloader.register(&v2.url, &v2_archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    fx.apply(DesiredState {
        instances: vec![instance.clone()],
        services: vec![v1],
        layers: vec![],
        force_restart: false,
    })
    .await;

    fx.apply(DesiredState {
        instances: vec![instance],
        services: vec![v2],
        layers: vec![],
        force_restart: false,
    })
    .await;

    let unit = create_unit_name(&fx.instance_id(&ident));
    assert_eq!(fx.supervisor.stopped_units(), vec![unit.clone()]);
    assert_eq!(fx.supervisor.started_units(), vec![unit.clone(), unit]);
    assert_eq!(fx.services.get_service("serviceA").unwrap().version, "2.0");

    fx.launcher.stop().await;
}

// =============================================================================
// Device and Resource Binding
// =============================================================================

#[tokio::test]
async fn unknown_host_device_fails_instance_with_alert() {
    let fx = fixture();

    let archive = build_service_archive_with_config(
        &fx.work_dir,
        "svc-dev",
        &[],
        serde_json::json!({
            "entrypoint": ["/bin/app"],
            "devices": ["/dev/null:/dev/video0", "/dev/no-such-device"]
        }),
    );
    let service = service_info("serviceA", "1.0", &archive);
    fx.downloader.register(&service.url, &archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    fx.apply(DesiredState {
        instances: vec![instance],
        services: vec![service],
        layers: vec![],
        force_restart: false,
    })
    .await;

    // The denied device fails the instance before any unit starts.
    assert!(fx.supervisor.started_units().is_empty());
    let statuses = fx.launcher.run_status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, RunState::Failed);
    assert!(statuses[0].error.as_deref().unwrap().contains("not found"));

    let alerts = fx.client.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        Alert::DeviceAllocate { ident: alert_ident, device, .. } => {
            assert_eq!(alert_ident, &ident);
            assert_eq!(device, "/dev/no-such-device");
        }
        other => panic!("unexpected alert {other:?}"),
    }

    fx.launcher.stop().await;
}

#[tokio::test]
async fn unknown_host_group_fails_instance_with_alert() {
    let fx = fixture();

    let archive = build_service_archive_with_config(
        &fx.work_dir,
        "svc-grp",
        &[],
        serde_json::json!({
            "entrypoint": ["/bin/app"],
            "groups": ["no-such-group-on-any-host"]
        }),
    );
    let service = service_info("serviceA", "1.0", &archive);
    fx.downloader.register(&service.url, &archive.path);

    fx.apply(DesiredState {
        instances: vec![fx.instance("serviceA", "subject1", 0, 0)],
        services: vec![service],
        layers: vec![],
        force_restart: false,
    })
    .await;

    assert!(fx.supervisor.started_units().is_empty());
    assert_eq!(fx.launcher.run_status()[0].state, RunState::Failed);

    let alerts = fx.client.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert!(matches!(
        &alerts[0],
        Alert::ResourceValidate { name, .. } if name == "no-such-group-on-any-host"
    ));

    fx.launcher.stop().await;
}

#[tokio::test]
async fn resource_limit_change_restarts_instance() {
    let fx = fixture();

    let archive = build_service_archive(&fx.work_dir, "svc-a", &[]);
    let service = service_info("serviceA", "1.0", &archive);
    fx.downloader.register(&service.url, &archive.path);

    let instance = fx.instance("serviceA", "subject1", 0, 0);
    let ident = instance.ident.clone();

    let desired = DesiredState {
        instances: vec![instance],
        services: vec![service],
        layers: vec![],
        force_restart: false,
    };
    fx.apply(desired.clone()).await;

    let unit = create_unit_name(&fx.instance_id(&ident));
    assert_eq!(fx.supervisor.started_units(), vec![unit.clone()]);

    // Tighten the installed image's limits in place; same version, same
    // desired state.
    let image_path = fx.services.get_service("serviceA").unwrap().image_path;
    std::fs::write(
        std::path::Path::new(&image_path).join("config.json"),
        serde_json::json!({
            "config": {
                "entrypoint": ["/bin/app"],
                "resources": { "ramBytes": 64 * 1024 * 1024 }
            }
        })
        .to_string(),
    )
    .unwrap();

    fx.apply(desired).await;

    assert_eq!(fx.supervisor.stopped_units(), vec![unit.clone()]);
    assert_eq!(fx.supervisor.started_units(), vec![unit.clone(), unit]);

    fx.launcher.stop().await;
}

// =============================================================================
// Start Ordering
// =============================================================================

#[tokio::test]
async fn higher_priority_instances_start_first() {
    let fx = fixture();

    let service_archive = build_service_archive(&fx.work_dir, "svc-a", &[]);
    let service = service_info("serviceA", "1.0", &service_archive);
    fx.downloader.register(&service.url, &service_archive.path);

    let low = fx.instance("serviceA", "subject1", 0, 10);
    let high = fx.instance("serviceA", "subject1", 1, 100);

    fx.apply(DesiredState {
        instances: vec![low.clone(), high.clone()],
        services: vec![service],
        layers: vec![],
        force_restart: false,
    })
    .await;

    let started = fx.supervisor.started_units();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0], create_unit_name(&fx.instance_id(&high.ident)));
    assert_eq!(started[1], create_unit_name(&fx.instance_id(&low.ident)));

    fx.launcher.stop().await;
}
