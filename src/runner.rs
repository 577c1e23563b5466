//! # Host Supervisor Adapter
//!
//! Translates instance start/stop requests into transient supervisor unit
//! operations and asynchronously publishes run status.
//!
//! Each instance maps to one unit named `aos-service@<instanceID>.service`.
//! Before a start, the unit's start/restart limits are written as a
//! drop-in; the drop-in directory is removed again on stop.
//!
//! ## State Machine
//!
//! ```text
//!             start_instance
//! Absent ─────────────────► Starting ──(active)────► Running ──(stop or crash)──► Absent
//!                            │                          │
//!                            └──(other terminal)────────┘
//!                                         ▼
//!                                (Failed surfaced once)
//! ```
//!
//! A single monitor task polls the supervisor's unit list, wakes starting
//! waiters on `failed`, and publishes a fresh `RunStatus` snapshot whenever
//! a running unit changes or the running set changes size.

use crate::constants::{
    DEFAULT_START_BURST, DEFAULT_START_INTERVAL, DEFAULT_STOP_TIMEOUT, DEFAULT_RESTART_INTERVAL,
    PARAMETERS_FILE_NAME, START_TIME_MULTIPLIER, STATUS_POLL_PERIOD, UNIT_NAME_PREFIX,
    UNIT_NAME_SUFFIX,
};
use crate::error::{Error, Result};
use crate::types::{RunParameters, RunState, RunStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Supervisor Interface
// =============================================================================

/// Unit activation state as reported by the host supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Failed,
}

impl UnitState {
    /// Parses a supervisor `ActiveState` string; unknown values map to
    /// `Inactive`.
    pub fn parse(value: &str) -> Self {
        match value {
            "active" | "reloading" => Self::Active,
            "activating" => Self::Activating,
            "deactivating" => Self::Deactivating,
            "failed" => Self::Failed,
            _ => Self::Inactive,
        }
    }

    /// True for states that end a start attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Snapshot of one supervisor unit.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub name: String,
    pub active_state: UnitState,
    pub exit_code: Option<i32>,
}

/// Host init supervisor capability (systemd over D-Bus in production).
#[async_trait]
pub trait HostSupervisor: Send + Sync {
    async fn start_unit(&self, name: &str, mode: &str, timeout: Duration) -> Result<()>;

    async fn stop_unit(&self, name: &str, mode: &str, timeout: Duration) -> Result<()>;

    async fn reset_failed_unit(&self, name: &str) -> Result<()>;

    async fn list_units(&self) -> Result<Vec<UnitStatus>>;

    async fn get_unit_status(&self, name: &str) -> Result<UnitStatus>;
}

/// Run-status sink the runner publishes into.
///
/// Held as a plain capability; the runner never owns the implementor.
pub trait RunStatusReceiver: Send + Sync {
    fn update_run_status(&self, statuses: Vec<RunStatus>);
}

// =============================================================================
// Unit Naming
// =============================================================================

/// Builds the supervisor unit name for an instance ID.
pub fn create_unit_name(instance_id: &str) -> String {
    format!("{UNIT_NAME_PREFIX}{instance_id}{UNIT_NAME_SUFFIX}")
}

/// Extracts the instance ID from a unit name.
///
/// The prefix and suffix are both enforced; anything else is
/// `InvalidArgument`.
pub fn instance_id_from_unit(unit_name: &str) -> Result<String> {
    unit_name
        .strip_prefix(UNIT_NAME_PREFIX)
        .and_then(|rest| rest.strip_suffix(UNIT_NAME_SUFFIX))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument(format!("not a service unit name: {unit_name}")))
}

// =============================================================================
// Runner
// =============================================================================

struct StartingUnit {
    state: UnitState,
    exit_code: Option<i32>,
    /// Signals the start waiter on a failed transition.
    failed_tx: watch::Sender<()>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct RunningUnit {
    run_state: RunState,
    exit_code: Option<i32>,
}

#[derive(Default)]
struct RunnerState {
    starting: HashMap<String, StartingUnit>,
    running: HashMap<String, RunningUnit>,
    closed: bool,
    /// Size of the last published snapshot.
    last_published: usize,
}

struct RunnerShared {
    supervisor: Arc<dyn HostSupervisor>,
    receiver: Arc<dyn RunStatusReceiver>,
    state: Mutex<RunnerState>,
    shutdown: Notify,
}

/// Instance lifecycle adapter over the host supervisor.
pub struct Runner {
    shared: Arc<RunnerShared>,
    drop_ins_dir: PathBuf,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    pub fn new(
        supervisor: Arc<dyn HostSupervisor>,
        receiver: Arc<dyn RunStatusReceiver>,
        drop_ins_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                supervisor,
                receiver,
                state: Mutex::new(RunnerState::default()),
                shutdown: Notify::new(),
            }),
            drop_ins_dir: drop_ins_dir.into(),
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the monitor task. Called once after construction and again
    /// after a supervisor transport loss stopped the previous monitor.
    pub fn start(&self) {
        debug!("start runner");

        self.shared.state.lock().expect("runner lock poisoned").closed = false;

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { monitor_units(shared).await });
        *self.monitor.lock().expect("runner lock poisoned") = Some(handle);
    }

    /// Stops the monitor task and wakes every start waiter.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("runner lock poisoned");
            if state.closed {
                return;
            }

            debug!("stop runner");

            state.closed = true;
            for unit in state.starting.values() {
                let _ = unit.failed_tx.send(());
            }
        }

        // notify_one stores a permit for a monitor that is mid-poll.
        self.shared.shutdown.notify_one();

        let handle = self.monitor.lock().expect("runner lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Starts one instance and waits for the outcome.
    ///
    /// `runtime_dir` is the bundle location referenced by the unit
    /// template; the runner itself only supplies run parameters.
    pub async fn start_instance(
        &self,
        instance_id: &str,
        runtime_dir: &Path,
        params: RunParameters,
    ) -> RunStatus {
        let _ = runtime_dir;

        let start_interval = params.start_interval.unwrap_or(DEFAULT_START_INTERVAL);
        let start_burst = params.start_burst.unwrap_or(DEFAULT_START_BURST);
        let restart_interval = params.restart_interval.unwrap_or(DEFAULT_RESTART_INTERVAL);

        debug!(
            instance = %instance_id,
            start_interval_sec = start_interval.as_secs(),
            start_burst,
            restart_interval_sec = restart_interval.as_secs(),
            "start service instance"
        );

        let unit_name = create_unit_name(instance_id);

        if let Err(err) =
            self.set_run_parameters(&unit_name, start_interval, start_burst, restart_interval)
        {
            return failed_status(instance_id, &err);
        }

        let start_timeout = start_interval * START_TIME_MULTIPLIER;
        if let Err(err) = self
            .shared
            .supervisor
            .start_unit(&unit_name, "replace", start_timeout)
            .await
        {
            return failed_status(instance_id, &err);
        }

        let outcome = self.wait_starting_unit(&unit_name, start_interval).await;

        info!(
            unit = %unit_name,
            state = ?outcome.state,
            instance = %instance_id,
            "start instance finished"
        );

        RunStatus {
            instance_id: instance_id.to_string(),
            ..outcome
        }
    }

    /// Stops one instance's unit and removes its drop-in.
    ///
    /// A unit the supervisor no longer knows is treated as already
    /// stopped; the failed-state reset and drop-in removal always run.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        debug!(instance = %instance_id, "stop service instance");

        let unit_name = create_unit_name(instance_id);

        self.shared
            .state
            .lock()
            .expect("runner lock poisoned")
            .running
            .remove(&unit_name);

        let mut result = match self
            .shared
            .supervisor
            .stop_unit(&unit_name, "replace", DEFAULT_STOP_TIMEOUT)
            .await
        {
            Err(Error::NotFound(_)) => {
                debug!(instance = %instance_id, "unit not loaded");
                Ok(())
            }
            other => other,
        };

        if let Err(err) = self.shared.supervisor.reset_failed_unit(&unit_name).await {
            if !matches!(err, Error::NotFound(_)) && result.is_ok() {
                result = Err(err);
            }
        }

        if let Err(err) = self.remove_run_parameters(&unit_name) {
            if result.is_ok() {
                result = Err(err);
            }
        }

        result
    }

    // =========================================================================
    // Start Waiting
    // =========================================================================

    /// Reads the unit's initial state and, if it is not terminal, waits up
    /// to `start_interval` for the monitor to observe a transition.
    async fn wait_starting_unit(&self, unit_name: &str, start_interval: Duration) -> RunStatus {
        let initial = match self.shared.supervisor.get_unit_status(unit_name).await {
            Ok(status) => status,
            Err(err) => return failed_status("", &err),
        };

        let mut state = initial.active_state;
        let mut exit_code = initial.exit_code;

        if !state.is_terminal() {
            let failed_rx = {
                let mut runner = self.shared.state.lock().expect("runner lock poisoned");
                if runner.closed {
                    return failed_status("", &Error::Cancelled);
                }

                let (failed_tx, failed_rx) = watch::channel(());
                runner.starting.insert(
                    unit_name.to_string(),
                    StartingUnit {
                        state,
                        exit_code,
                        failed_tx,
                    },
                );
                failed_rx
            };

            let mut failed_rx = failed_rx;
            let _ = tokio::time::timeout(start_interval, failed_rx.changed()).await;

            let mut runner = self.shared.state.lock().expect("runner lock poisoned");
            if let Some(unit) = runner.starting.remove(unit_name) {
                state = unit.state;
                exit_code = unit.exit_code;
            }
        }

        let mut runner = self.shared.state.lock().expect("runner lock poisoned");

        if state != UnitState::Active {
            let message = "failed to start unit".to_string();
            return RunStatus {
                instance_id: String::new(),
                state: RunState::Failed,
                error: Some(message),
                exit_code,
            };
        }

        runner.running.insert(
            unit_name.to_string(),
            RunningUnit {
                run_state: RunState::Active,
                exit_code,
            },
        );

        RunStatus {
            instance_id: String::new(),
            state: RunState::Active,
            error: None,
            exit_code: None,
        }
    }

    // =========================================================================
    // Drop-ins
    // =========================================================================

    /// Writes the per-unit start/restart limit drop-in.
    fn set_run_parameters(
        &self,
        unit_name: &str,
        start_interval: Duration,
        start_burst: u32,
        restart_interval: Duration,
    ) -> Result<()> {
        let content = format!(
            "[Unit]\nStartLimitIntervalSec={}s\nStartLimitBurst={}\n\n[Service]\nRestartSec={}s\n",
            start_interval.as_secs(),
            start_burst,
            restart_interval.as_secs()
        );

        let parameters_dir = self.drop_ins_dir.join(format!("{unit_name}.d"));
        fs::create_dir_all(&parameters_dir)?;
        set_permissions(&parameters_dir, 0o755)?;

        let parameters_file = parameters_dir.join(PARAMETERS_FILE_NAME);
        fs::write(&parameters_file, content)?;
        set_permissions(&parameters_file, 0o644)?;

        Ok(())
    }

    /// Removes the per-unit drop-in directory.
    fn remove_run_parameters(&self, unit_name: &str) -> Result<()> {
        let parameters_dir = self.drop_ins_dir.join(format!("{unit_name}.d"));
        if parameters_dir.exists() {
            fs::remove_dir_all(&parameters_dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn failed_status(instance_id: &str, err: &Error) -> RunStatus {
    RunStatus {
        instance_id: instance_id.to_string(),
        state: RunState::Failed,
        error: Some(err.to_string()),
        exit_code: None,
    }
}

// =============================================================================
// Monitor Task
// =============================================================================

/// Polls the supervisor and publishes run-status snapshots.
///
/// A transport failure logs, publishes nothing, and exits; the next
/// `Runner::start` brings the monitor back.
async fn monitor_units(shared: Arc<RunnerShared>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_POLL_PERIOD) => {}
            _ = shared.shutdown.notified() => return,
        }

        if shared.state.lock().expect("runner lock poisoned").closed {
            return;
        }

        let units = match shared.supervisor.list_units().await {
            Ok(units) => units,
            Err(err) => {
                error!(%err, "supervisor list units failed");
                return;
            }
        };

        let snapshot = {
            let mut state = shared.state.lock().expect("runner lock poisoned");
            let mut unit_changed = false;

            for unit in &units {
                if let Some(starting) = state.starting.get_mut(&unit.name) {
                    starting.state = unit.active_state;
                    starting.exit_code = unit.exit_code;

                    // systemd does not change the state of a failed unit.
                    if unit.active_state == UnitState::Failed {
                        let _ = starting.failed_tx.send(());
                    }
                }

                if let Some(running) = state.running.get_mut(&unit.name) {
                    let observed = RunningUnit {
                        run_state: if unit.active_state == UnitState::Active {
                            RunState::Active
                        } else {
                            RunState::Failed
                        },
                        exit_code: unit.exit_code,
                    };

                    if *running != observed {
                        *running = observed;
                        unit_changed = true;
                    }
                }
            }

            if unit_changed || state.running.len() != state.last_published {
                state.last_published = state.running.len();
                Some(running_snapshot(&state))
            } else {
                None
            }
        };

        if let Some(statuses) = snapshot {
            shared.receiver.update_run_status(statuses);
        }
    }
}

fn running_snapshot(state: &RunnerState) -> Vec<RunStatus> {
    let mut statuses: Vec<RunStatus> = state
        .running
        .iter()
        .filter_map(|(unit_name, unit)| {
            let instance_id = match instance_id_from_unit(unit_name) {
                Ok(id) => id,
                Err(err) => {
                    warn!(unit = %unit_name, %err, "skipping unparsable unit");
                    return None;
                }
            };

            Some(RunStatus {
                instance_id,
                state: unit.run_state,
                error: match unit.run_state {
                    RunState::Failed => Some("unit failed".to_string()),
                    RunState::Active => None,
                },
                exit_code: unit.exit_code,
            })
        })
        .collect();

    statuses.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    statuses
}
