//! # Instance Reconciler
//!
//! Drives the node from its current instance set to the desired set pushed
//! by the communication manager.
//!
//! ```text
//!  run_instances(desired)                 runner monitor
//!          │                                   │
//!          ▼                                   ▼
//!   ┌─ reconcile task ───────────────────────────────────────┐
//!   │  ensure services/layers → diff → stop → start → publish │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Reconciliation is serialized: a new desired state replaces any queued
//! one, and at most one sweep runs at a time. Run-status updates from the
//! runner and artifact TTL sweeps are handled on the same task, so they
//! never interleave with a sweep.

use crate::bundle::{Bundle, BundleBuilder, RootfsMounter};
use crate::error::{Error, Result};
use crate::imagehandler::{ImageHandler, ResourceLimits};
use crate::layermanager::LayerManager;
use crate::resourcemanager::HostDeviceManager;
use crate::runner::{Runner, RunStatusReceiver};
use crate::servicemanager::ServiceManager;
use crate::storage::Storage;
use crate::types::{
    Alert, DesiredState, InstanceIdent, InstanceInfo, NetworkParameters, RunParameters, RunState,
    RunStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Instance network provisioning capability.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Allocates the instance's network namespace and firewall rules;
    /// returns the namespace path for the bundle config.
    async fn setup_instance_network(
        &self,
        instance_id: &str,
        params: &NetworkParameters,
    ) -> Result<PathBuf>;

    /// Releases the instance's network namespace and firewall rules.
    async fn release_instance_network(&self, instance_id: &str) -> Result<()>;
}

/// Uplink to the communication manager.
#[async_trait]
pub trait SmClient: Send + Sync {
    async fn send_run_status(&self, statuses: Vec<RunStatus>) -> Result<()>;

    async fn send_monitoring_data(&self, data: crate::monitoring::MonitoringData) -> Result<()>;

    async fn send_alert(&self, alert: Alert) -> Result<()>;

    async fn send_log(&self, log: crate::logprovider::LogPart) -> Result<()>;
}

/// Forwards runner snapshots into the launcher's event loop.
///
/// The runner holds this small forwarder rather than the launcher itself,
/// so the start/status cycle carries no ownership back-edge.
pub struct StatusForwarder {
    tx: mpsc::UnboundedSender<Vec<RunStatus>>,
}

impl StatusForwarder {
    pub fn new(tx: mpsc::UnboundedSender<Vec<RunStatus>>) -> Self {
        Self { tx }
    }
}

impl RunStatusReceiver for StatusForwarder {
    fn update_run_status(&self, statuses: Vec<RunStatus>) {
        let _ = self.tx.send(statuses);
    }
}

// =============================================================================
// Launcher State
// =============================================================================

/// Book-keeping for one tracked instance.
#[derive(Debug, Clone)]
struct CurrentInstance {
    info: InstanceInfo,
    instance_id: String,
    service_version: String,
    layer_digests: Vec<String>,
    /// Limits the instance was started with; part of the restart diff.
    resource_limits: ResourceLimits,
    run_status: RunStatus,
    bundle: Option<Bundle>,
}

#[derive(Default)]
struct LauncherState {
    current: HashMap<InstanceIdent, CurrentInstance>,
    /// Latest queued desired state; replaced by newer pushes.
    pending: Option<DesiredState>,
    closed: bool,
}

struct LauncherShared {
    state: Mutex<LauncherState>,
    wakeup: Notify,
    settled_tx: watch::Sender<u64>,

    service_manager: Arc<ServiceManager>,
    layer_manager: Arc<LayerManager>,
    bundle_builder: BundleBuilder,
    mounter: Arc<dyn RootfsMounter>,
    runner: Arc<Runner>,
    network: Arc<dyn NetworkManager>,
    client: Arc<dyn SmClient>,
    storage: Arc<dyn Storage>,
    device_manager: HostDeviceManager,

    ops: Arc<Semaphore>,
    remove_outdated_period: Duration,
}

/// The reconciler; owns the desired-state queue and the current-instance
/// map.
pub struct Launcher {
    shared: Arc<LauncherShared>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<RunStatus>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_manager: Arc<ServiceManager>,
        layer_manager: Arc<LayerManager>,
        bundle_builder: BundleBuilder,
        mounter: Arc<dyn RootfsMounter>,
        runner: Arc<Runner>,
        network: Arc<dyn NetworkManager>,
        client: Arc<dyn SmClient>,
        storage: Arc<dyn Storage>,
        status_rx: mpsc::UnboundedReceiver<Vec<RunStatus>>,
        max_parallel_ops: usize,
        remove_outdated_period: Duration,
    ) -> Self {
        let (settled_tx, _) = watch::channel(0);

        Self {
            shared: Arc::new(LauncherShared {
                state: Mutex::new(LauncherState::default()),
                wakeup: Notify::new(),
                settled_tx,
                service_manager,
                layer_manager,
                bundle_builder,
                mounter,
                runner,
                network,
                client,
                storage,
                device_manager: HostDeviceManager::new(),
                ops: Arc::new(Semaphore::new(max_parallel_ops.max(1))),
                remove_outdated_period,
            }),
            status_rx: Mutex::new(Some(status_rx)),
            task: Mutex::new(None),
        }
    }

    /// Spawns the reconcile task.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let status_rx = self
            .status_rx
            .lock()
            .expect("launcher lock poisoned")
            .take()
            .expect("launcher already started");

        let handle = tokio::spawn(async move { reconcile_loop(shared, status_rx).await });
        *self.task.lock().expect("launcher lock poisoned") = Some(handle);
    }

    /// Stops the reconcile task; queued desired states are dropped.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("launcher lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending = None;
        }
        // notify_one stores a permit for a task that is not parked yet.
        self.shared.wakeup.notify_one();

        let handle = self.task.lock().expect("launcher lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Queues a desired state, replacing any not-yet-applied one.
    pub fn run_instances(&self, desired: DesiredState) {
        {
            let mut state = self.shared.state.lock().expect("launcher lock poisoned");
            if state.closed {
                warn!("run instances ignored: launcher closed");
                return;
            }
            state.pending = Some(desired);
        }
        self.shared.wakeup.notify_one();
    }

    /// Current run statuses, ordered by instance identity.
    pub fn run_status(&self) -> Vec<RunStatus> {
        let state = self.shared.state.lock().expect("launcher lock poisoned");
        snapshot(&state)
    }

    /// Identities currently tracked by the launcher.
    pub fn current_idents(&self) -> Vec<InstanceIdent> {
        let state = self.shared.state.lock().expect("launcher lock poisoned");
        let mut idents: Vec<InstanceIdent> = state.current.keys().cloned().collect();
        idents.sort();
        idents
    }

    /// Subscribes to the reconcile generation counter; it is bumped after
    /// every completed sweep.
    pub fn subscribe_settled(&self) -> watch::Receiver<u64> {
        self.shared.settled_tx.subscribe()
    }
}

fn snapshot(state: &LauncherState) -> Vec<RunStatus> {
    let mut entries: Vec<(&InstanceIdent, &CurrentInstance)> = state.current.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(_, instance)| instance.run_status.clone())
        .collect()
}

// =============================================================================
// Reconcile Loop
// =============================================================================

async fn reconcile_loop(
    shared: Arc<LauncherShared>,
    mut status_rx: mpsc::UnboundedReceiver<Vec<RunStatus>>,
) {
    loop {
        tokio::select! {
            _ = shared.wakeup.notified() => {}
            Some(statuses) = status_rx.recv() => {
                handle_run_status(&shared, statuses).await;
                continue;
            }
            _ = tokio::time::sleep(shared.remove_outdated_period) => {
                remove_outdated(&shared);
                continue;
            }
        }

        loop {
            let (pending, closed) = {
                let mut state = shared.state.lock().expect("launcher lock poisoned");
                (state.pending.take(), state.closed)
            };

            if closed {
                return;
            }

            let Some(desired) = pending else { break };
            reconcile(&shared, desired).await;

            shared.settled_tx.send_modify(|generation| *generation += 1);
        }
    }
}

/// Applies runner snapshots to the tracked instances and forwards the
/// aggregate. Snapshots are eventually consistent and keyed by instance
/// ID; unknown IDs are ignored.
async fn handle_run_status(shared: &Arc<LauncherShared>, statuses: Vec<RunStatus>) {
    let aggregate = {
        let mut state = shared.state.lock().expect("launcher lock poisoned");

        for status in statuses {
            if let Some(instance) = state
                .current
                .values_mut()
                .find(|instance| instance.instance_id == status.instance_id)
            {
                instance.run_status = status;
            }
        }

        snapshot(&state)
    };

    if let Err(err) = shared.client.send_run_status(aggregate).await {
        warn!(%err, "run status forwarding failed");
    }
}

/// Artifact TTL sweep, coalesced onto the reconcile task so it never runs
/// concurrently with a sweep.
fn remove_outdated(shared: &Arc<LauncherShared>) {
    if let Err(err) = shared.service_manager.remove_outdated() {
        error!(%err, "outdated service sweep failed");
    }
    if let Err(err) = shared.layer_manager.remove_outdated() {
        error!(%err, "outdated layer sweep failed");
    }
}

async fn reconcile(shared: &Arc<LauncherShared>, desired: DesiredState) {
    info!(
        instances = desired.instances.len(),
        services = desired.services.len(),
        layers = desired.layers.len(),
        force_restart = desired.force_restart,
        "reconciling desired state"
    );

    // Phase 1: ensure artifacts. Failures are per artifact; they fail the
    // dependent instances below but never the sweep.
    let service_errors = match shared
        .service_manager
        .process_desired_services(&desired.services)
        .await
    {
        Ok(errors) => errors,
        Err(err) => {
            error!(%err, "service sweep failed");
            HashMap::new()
        }
    };

    let layer_errors = match shared
        .layer_manager
        .process_desired_layers(&desired.layers)
        .await
    {
        Ok(errors) => errors,
        Err(err) => {
            error!(%err, "layer sweep failed");
            HashMap::new()
        }
    };

    // Phase 2: diff instances.
    let desired_idents: HashSet<InstanceIdent> = desired
        .instances
        .iter()
        .map(|instance| instance.ident.clone())
        .collect();

    let (to_stop, to_start) = {
        let state = shared.state.lock().expect("launcher lock poisoned");

        let mut to_stop: Vec<CurrentInstance> = Vec::new();
        let mut to_start: Vec<InstanceInfo> = Vec::new();

        for instance in &desired.instances {
            match state.current.get(&instance.ident) {
                None => to_start.push(instance.clone()),
                Some(current) => {
                    if desired.force_restart
                        || bundle_inputs_changed(shared, current, instance, &desired)
                    {
                        to_stop.push(current.clone());
                        to_start.push(instance.clone());
                    }
                }
            }
        }

        for (ident, current) in &state.current {
            if !desired_idents.contains(ident) {
                to_stop.push(current.clone());
            }
        }

        (to_stop, to_start)
    };

    // Phase 3: stop, in parallel, bounded.
    stop_instances(shared, to_stop).await;

    // Phase 4: start, priority descending; instances of equal priority
    // start in parallel, ordered groups start one after another.
    start_instances(shared, to_start, &desired, &service_errors, &layer_errors).await;

    // Phase 5: publish the aggregate.
    let aggregate = {
        let state = shared.state.lock().expect("launcher lock poisoned");
        snapshot(&state)
    };
    if let Err(err) = shared.client.send_run_status(aggregate).await {
        warn!(%err, "run status forwarding failed");
    }
}

/// True when any input that feeds the instance's bundle changed.
fn bundle_inputs_changed(
    shared: &Arc<LauncherShared>,
    current: &CurrentInstance,
    desired_instance: &InstanceInfo,
    desired: &DesiredState,
) -> bool {
    if &current.info != desired_instance {
        return true;
    }

    let desired_version = desired
        .services
        .iter()
        .find(|service| service.service_id == desired_instance.ident.service_id)
        .map(|service| service.version.as_str());
    if desired_version != Some(current.service_version.as_str()) {
        return true;
    }

    let Ok(service) = shared
        .service_manager
        .get_service(&desired_instance.ident.service_id)
    else {
        return true;
    };

    match shared.service_manager.service_manifest(&service) {
        Ok(manifest) => {
            let digests: Vec<String> = manifest
                .layers
                .iter()
                .map(|descriptor| descriptor.digest.clone())
                .collect();
            if digests != current.layer_digests {
                return true;
            }
        }
        Err(_) => return true,
    }

    // Changed resource limits restart the instance like any other bundle
    // input.
    match ImageHandler::new().service_config(Path::new(&service.image_path)) {
        Ok(config) => config.config.resources != current.resource_limits,
        Err(_) => true,
    }
}

// =============================================================================
// Stop Phase
// =============================================================================

async fn stop_instances(shared: &Arc<LauncherShared>, to_stop: Vec<CurrentInstance>) {
    let mut tasks = tokio::task::JoinSet::new();

    for instance in to_stop {
        let shared = shared.clone();
        tasks.spawn(async move {
            let _permit = shared.ops.clone().acquire_owned().await;

            debug!(instance = %instance.instance_id, ident = %instance.info.ident, "stopping instance");

            if let Err(err) = shared.runner.stop_instance(&instance.instance_id).await {
                warn!(instance = %instance.instance_id, %err, "stop instance failed");
            }

            if let Some(bundle) = &instance.bundle {
                if let Err(err) = shared.mounter.umount(&bundle.overlay) {
                    warn!(instance = %instance.instance_id, %err, "rootfs unmount failed");
                }
            }

            if let Err(err) = shared
                .bundle_builder
                .teardown_bundle(&instance.instance_id)
            {
                warn!(instance = %instance.instance_id, %err, "bundle teardown failed");
            }

            if let Err(err) = shared
                .network
                .release_instance_network(&instance.instance_id)
                .await
            {
                warn!(instance = %instance.instance_id, %err, "network release failed");
            }

            instance.info.ident
        });
    }

    while let Some(result) = tasks.join_next().await {
        if let Ok(ident) = result {
            shared
                .state
                .lock()
                .expect("launcher lock poisoned")
                .current
                .remove(&ident);
        }
    }
}

// =============================================================================
// Start Phase
// =============================================================================

async fn start_instances(
    shared: &Arc<LauncherShared>,
    mut to_start: Vec<InstanceInfo>,
    desired: &DesiredState,
    service_errors: &HashMap<String, Error>,
    layer_errors: &HashMap<String, Error>,
) {
    to_start.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.ident.service_id.cmp(&b.ident.service_id))
            .then_with(|| a.ident.instance.cmp(&b.ident.instance))
    });

    // Group by priority; higher priorities fully start first.
    let mut index = 0;
    while index < to_start.len() {
        let priority = to_start[index].priority;
        let mut group = Vec::new();
        while index < to_start.len() && to_start[index].priority == priority {
            group.push(to_start[index].clone());
            index += 1;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for instance in group {
            let shared = shared.clone();
            let desired_services = desired.services.clone();
            let service_error = service_errors
                .get(&instance.ident.service_id)
                .map(|err| err.to_string());
            let layer_errors = layer_errors
                .iter()
                .map(|(digest, err)| (digest.clone(), err.to_string()))
                .collect::<HashMap<_, _>>();

            tasks.spawn(async move {
                let _permit = shared.ops.clone().acquire_owned().await;
                let current = start_instance(
                    &shared,
                    instance,
                    &desired_services,
                    service_error,
                    &layer_errors,
                )
                .await;
                (current.info.ident.clone(), current)
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Ok((ident, current)) = result {
                shared
                    .state
                    .lock()
                    .expect("launcher lock poisoned")
                    .current
                    .insert(ident, current);
            }
        }
    }
}

async fn start_instance(
    shared: &Arc<LauncherShared>,
    instance: InstanceInfo,
    desired_services: &[crate::types::ServiceInfo],
    service_error: Option<String>,
    layer_errors: &HashMap<String, String>,
) -> CurrentInstance {
    let instance_id = match instance_id_for(shared, &instance.ident) {
        Ok(id) => id,
        Err(err) => return failed_instance(instance, String::new(), err.to_string()),
    };

    // A failed service install fails every instance depending on it.
    if let Some(message) = service_error {
        return failed_instance(instance, instance_id, message);
    }

    let desired_version = desired_services
        .iter()
        .find(|service| service.service_id == instance.ident.service_id)
        .map(|service| service.version.clone());
    let Some(service_version) = desired_version else {
        let message = format!("service {} not in desired state", instance.ident.service_id);
        return failed_instance(instance, instance_id, message);
    };

    let service = match shared.service_manager.get_service(&instance.ident.service_id) {
        Ok(service) => service,
        Err(err) => return failed_instance(instance, instance_id, err.to_string()),
    };

    let manifest = match shared.service_manager.service_manifest(&service) {
        Ok(manifest) => manifest,
        Err(err) => return failed_instance(instance, instance_id, err.to_string()),
    };

    let mut layer_digests = Vec::new();
    let mut layer_paths = Vec::new();
    for descriptor in &manifest.layers {
        if let Some(message) = layer_errors.get(&descriptor.digest) {
            return failed_instance(instance, instance_id, message.clone());
        }
        match shared.layer_manager.get_layer(&descriptor.digest) {
            Ok(layer) => {
                layer_digests.push(layer.digest.clone());
                layer_paths.push(PathBuf::from(&layer.path));
            }
            Err(err) => return failed_instance(instance, instance_id, err.to_string()),
        }
    }

    let image_config = match ImageHandler::new().service_config(Path::new(&service.image_path)) {
        Ok(config) => config,
        Err(err) => return failed_instance(instance, instance_id, err.to_string()),
    };

    // Authorize requested host devices and groups before anything is
    // bundled; a denial fails only this instance.
    for entry in &image_config.config.devices {
        if let Err(err) = shared.device_manager.check_device(entry) {
            send_alert(
                shared,
                Alert::DeviceAllocate {
                    ident: instance.ident.clone(),
                    device: entry.clone(),
                    message: err.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
            return failed_instance(instance, instance_id, err.to_string());
        }
    }

    for group in &image_config.config.groups {
        if let Err(err) = shared.device_manager.check_group(group) {
            send_alert(
                shared,
                Alert::ResourceValidate {
                    name: group.clone(),
                    message: err.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
            return failed_instance(instance, instance_id, err.to_string());
        }
    }

    let netns = match shared
        .network
        .setup_instance_network(&instance_id, &instance.network_parameters)
        .await
    {
        Ok(path) => path,
        Err(err) => return failed_instance(instance, instance_id, err.to_string()),
    };

    let bundle = match shared.bundle_builder.prepare_bundle(
        &instance_id,
        &instance,
        &service,
        &image_config,
        &layer_paths,
        Some(&netns),
    ) {
        Ok(bundle) => bundle,
        Err(err) => return failed_instance(instance, instance_id, err.to_string()),
    };

    if let Err(err) = shared.mounter.mount(&bundle.overlay) {
        return failed_instance(instance, instance_id, err.to_string());
    }

    let mut run_status = shared
        .runner
        .start_instance(&instance_id, &bundle.path, RunParameters::default())
        .await;
    run_status.instance_id = instance_id.clone();

    CurrentInstance {
        info: instance,
        instance_id,
        service_version,
        layer_digests,
        resource_limits: image_config.config.resources,
        run_status,
        bundle: Some(bundle),
    }
}

async fn send_alert(shared: &Arc<LauncherShared>, alert: Alert) {
    if let Err(err) = shared.client.send_alert(alert).await {
        warn!(%err, "alert forwarding failed");
    }
}

/// Resolves (or generates and persists) the stable instance UUID for an
/// identity.
fn instance_id_for(shared: &Arc<LauncherShared>, ident: &InstanceIdent) -> Result<String> {
    if let Some(existing) = shared.storage.instance_id(ident)? {
        return Ok(existing);
    }

    let generated = uuid::Uuid::new_v4().to_string();
    shared.storage.set_instance_id(ident, &generated)?;
    Ok(generated)
}

fn failed_instance(instance: InstanceInfo, instance_id: String, message: String) -> CurrentInstance {
    error!(ident = %instance.ident, %message, "instance start failed");

    CurrentInstance {
        run_status: RunStatus {
            instance_id: instance_id.clone(),
            state: RunState::Failed,
            error: Some(message),
            exit_code: None,
        },
        service_version: String::new(),
        layer_digests: Vec::new(),
        resource_limits: ResourceLimits::default(),
        bundle: None,
        instance_id,
        info: instance,
    }
}
