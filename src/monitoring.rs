//! # Resource Monitoring
//!
//! Collects node and per-instance resource usage through the
//! [`ResourceUsageProvider`] collaborator, keeps a sliding window average,
//! forwards snapshots to the communication manager every poll period, and
//! raises quota alerts when averaged usage crosses the configured limits.

use crate::error::Result;
use crate::imagehandler::ResourceLimits;
use crate::launcher::SmClient;
use crate::types::{Alert, InstanceIdent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// One usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

/// Averaged usage of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMonitoring {
    pub instance_id: String,
    pub usage: ResourceUsage,
}

/// Snapshot forwarded to the communication manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringData {
    pub node: ResourceUsage,
    pub instances: Vec<InstanceMonitoring>,
    pub timestamp: DateTime<Utc>,
}

/// One instance under observation, with the limits it was started with.
#[derive(Debug, Clone)]
pub struct MonitoredInstance {
    pub ident: InstanceIdent,
    pub instance_id: String,
    pub limits: ResourceLimits,
}

/// Host usage probe capability.
pub trait ResourceUsageProvider: Send + Sync {
    fn node_usage(&self) -> Result<ResourceUsage>;

    fn instance_usage(&self, instance_id: &str) -> Result<ResourceUsage>;
}

// =============================================================================
// Window Average
// =============================================================================

/// Incremental sliding-window average: the first `window` samples grow the
/// divisor, afterwards old weight decays away.
#[derive(Debug, Clone, Copy)]
struct Average {
    window: u32,
    count: u32,
    value: f64,
}

impl Average {
    fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            count: 0,
            value: 0.0,
        }
    }

    fn push(&mut self, sample: f64) -> f64 {
        self.count = (self.count + 1).min(self.window);
        self.value += (sample - self.value) / self.count as f64;
        self.value
    }
}

#[derive(Default)]
struct Averages {
    cpu: Option<Average>,
    ram: Option<Average>,
    disk: Option<Average>,
}

impl Averages {
    fn push(&mut self, window: u32, sample: ResourceUsage) -> ResourceUsage {
        let cpu = self.cpu.get_or_insert_with(|| Average::new(window));
        let ram = self.ram.get_or_insert_with(|| Average::new(window));
        let disk = self.disk.get_or_insert_with(|| Average::new(window));

        ResourceUsage {
            cpu_percent: cpu.push(sample.cpu_percent),
            ram_bytes: ram.push(sample.ram_bytes as f64) as u64,
            disk_bytes: disk.push(sample.disk_bytes as f64) as u64,
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Periodic usage collector and quota watchdog.
pub struct ResourceMonitor {
    provider: Arc<dyn ResourceUsageProvider>,
    client: Arc<dyn SmClient>,
    window: u32,
    /// Node-wide thresholds for system quota alerts.
    node_limits: ResourceLimits,
    state: Mutex<MonitorState>,
}

#[derive(Default)]
struct MonitorState {
    instances: Vec<MonitoredInstance>,
    node: Averages,
    per_instance: HashMap<String, Averages>,
}

impl ResourceMonitor {
    pub fn new(
        provider: Arc<dyn ResourceUsageProvider>,
        client: Arc<dyn SmClient>,
        poll_period: Duration,
        average_window: Duration,
        node_limits: ResourceLimits,
    ) -> Self {
        let window = (average_window.as_secs() / poll_period.as_secs().max(1)).max(1) as u32;

        Self {
            provider,
            client,
            window,
            node_limits,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Replaces the set of instances being monitored. Averages of removed
    /// instances are dropped.
    pub fn set_instances(&self, instances: Vec<MonitoredInstance>) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        state.per_instance.retain(|instance_id, _| {
            instances
                .iter()
                .any(|instance| &instance.instance_id == instance_id)
        });
        state.instances = instances;
    }

    /// Collects one sample round and returns the averaged snapshot.
    pub fn poll_once(&self) -> Result<MonitoringData> {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        let window = self.window;

        let node_sample = self.provider.node_usage()?;
        let node = state.node.push(window, node_sample);

        let monitored = state.instances.clone();
        let mut instances = Vec::with_capacity(monitored.len());
        for instance in monitored {
            match self.provider.instance_usage(&instance.instance_id) {
                Ok(sample) => {
                    let averages = state
                        .per_instance
                        .entry(instance.instance_id.clone())
                        .or_default();
                    instances.push(InstanceMonitoring {
                        instance_id: instance.instance_id,
                        usage: averages.push(window, sample),
                    });
                }
                Err(err) => {
                    warn!(instance = %instance.instance_id, %err, "instance usage probe failed");
                }
            }
        }

        Ok(MonitoringData {
            node,
            instances,
            timestamp: Utc::now(),
        })
    }

    /// Quota violations in an averaged snapshot: one alert per exceeded
    /// dimension, instance limits first, node thresholds last.
    pub fn quota_alerts(&self, data: &MonitoringData) -> Vec<Alert> {
        let state = self.state.lock().expect("monitor lock poisoned");
        let mut alerts = Vec::new();

        for entry in &data.instances {
            let Some(monitored) = state
                .instances
                .iter()
                .find(|instance| instance.instance_id == entry.instance_id)
            else {
                continue;
            };

            for (parameter, value) in exceeded(&monitored.limits, &entry.usage) {
                alerts.push(Alert::InstanceQuota {
                    ident: monitored.ident.clone(),
                    parameter,
                    value,
                    timestamp: data.timestamp,
                });
            }
        }

        for (parameter, value) in exceeded(&self.node_limits, &data.node) {
            alerts.push(Alert::SystemQuota {
                parameter,
                value,
                timestamp: data.timestamp,
            });
        }

        alerts
    }

    /// Collects one snapshot, forwards it, and raises any quota alerts.
    pub async fn publish_once(&self) -> Result<()> {
        let data = self.poll_once()?;
        let alerts = self.quota_alerts(&data);

        self.client.send_monitoring_data(data).await?;
        for alert in alerts {
            self.client.send_alert(alert).await?;
        }

        Ok(())
    }
}

/// Dimensions of `usage` exceeding `limits`, as `(parameter, value)` pairs.
fn exceeded(limits: &ResourceLimits, usage: &ResourceUsage) -> Vec<(String, u64)> {
    let mut over = Vec::new();

    if let Some(ram_limit) = limits.ram_bytes {
        if usage.ram_bytes > ram_limit {
            over.push(("ram".to_string(), usage.ram_bytes));
        }
    }

    if let Some(cpu_limit) = limits.cpu_percent {
        if usage.cpu_percent > cpu_limit {
            over.push(("cpu".to_string(), usage.cpu_percent.round() as u64));
        }
    }

    over
}
