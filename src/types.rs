//! Domain model shared across the service manager.
//!
//! These types mirror the desired-state payload received from the
//! communication manager and the durable catalog rows kept in [`Storage`].
//!
//! [`Storage`]: crate::storage::Storage

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Instance Identity
// =============================================================================

/// Identity triple of a service instance, unique on the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdent {
    /// Service this instance runs.
    pub service_id: String,
    /// Subject the instance belongs to.
    pub subject_id: String,
    /// Index among instances of the same service and subject.
    pub instance: u64,
}

impl InstanceIdent {
    pub fn new(
        service_id: impl Into<String>,
        subject_id: impl Into<String>,
        instance: u64,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            subject_id: subject_id.into(),
            instance,
        }
    }
}

impl std::fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}

// =============================================================================
// Desired State (from the communication manager)
// =============================================================================

/// Network settings assigned to one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkParameters {
    /// Network the instance joins.
    pub network_id: String,
    /// Assigned IP address.
    pub ip: String,
    /// Subnet in CIDR notation.
    pub subnet: String,
    /// DNS servers visible inside the instance.
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// One desired instance as supplied by the communication manager.
///
/// Immutable per run; a changed field makes the launcher restart the
/// instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    /// UID the instance process runs as.
    pub uid: u32,
    /// Start priority; higher starts first.
    pub priority: u64,
    /// Persistent storage bind for the instance.
    pub storage_path: String,
    /// Overlay upper/work state location.
    pub state_path: String,
    #[serde(default)]
    pub network_parameters: NetworkParameters,
}

/// One desired service version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_id: String,
    pub provider_id: String,
    pub version: String,
    /// Group owning the unpacked image.
    pub gid: u32,
    /// Download location for the service archive.
    pub url: String,
    /// Expected SHA-256 of the archive, hex encoded.
    pub sha256: String,
    /// Archive size in bytes.
    pub size: u64,
}

/// One desired overlay layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub layer_id: String,
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
    pub version: String,
    pub url: String,
    /// Expected SHA-256 of the archive, hex encoded.
    pub sha256: String,
    /// Archive size in bytes.
    pub size: u64,
}

/// Full desired-state push from the communication manager.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub instances: Vec<InstanceInfo>,
    pub services: Vec<ServiceInfo>,
    pub layers: Vec<LayerInfo>,
    /// Restart every instance even if its inputs did not change.
    pub force_restart: bool,
}

// =============================================================================
// Catalog Rows
// =============================================================================

/// Lifecycle state of an installed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Referenced by at least one desired instance.
    Active,
    /// Installed but unreferenced; eligible for TTL eviction.
    Cached,
    /// Marked for deletion; files may already be gone.
    Removed,
}

/// Catalog row for an installed service version.
///
/// Key: `(service_id, version)`. At most one row per `service_id` is
/// `Active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceData {
    pub service_id: String,
    pub provider_id: String,
    pub version: String,
    pub gid: u32,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    /// Unpacked image location.
    pub image_path: String,
    pub timestamp: DateTime<Utc>,
    pub state: ItemState,
    /// Digest of the image manifest, `sha256:<hex>`.
    pub manifest_digest: String,
}

/// Catalog row for an installed layer, keyed by content digest.
///
/// Layers are immutable once installed; a re-install with the same digest
/// is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerData {
    pub layer_id: String,
    pub digest: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    /// Unpacked layer location.
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub state: ItemState,
}

// =============================================================================
// Run Status
// =============================================================================

/// Run state of an instance as seen by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Active,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of one instance, published by the runner and forwarded to the
/// communication manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub instance_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Start and restart limits for one instance, applied through the host
/// supervisor drop-in. Missing values are filled with defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunParameters {
    pub start_interval: Option<Duration>,
    pub start_burst: Option<u32>,
    pub restart_interval: Option<Duration>,
}

// =============================================================================
// Alerts
// =============================================================================

/// Alert payloads forwarded to the communication manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum Alert {
    System {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Core {
        component: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    SystemQuota {
        parameter: String,
        value: u64,
        timestamp: DateTime<Utc>,
    },
    InstanceQuota {
        ident: InstanceIdent,
        parameter: String,
        value: u64,
        timestamp: DateTime<Utc>,
    },
    DeviceAllocate {
        ident: InstanceIdent,
        device: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ResourceValidate {
        name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Download {
        url: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ServiceInstance {
        instance: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancellation handle passed to blocking collaborator calls.
///
/// Cloned freely; all clones observe the same cancel signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Owner side of a [`CancelToken`]; dropping it does not cancel.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Creates a cancel source and its initial token.
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Signals cancellation to every token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Creates another token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// True once the source has cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the source cancels.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// =============================================================================
// Wire Boundaries
// =============================================================================

/// Maps the wire representation of an instance filter: `-1` means absent.
pub fn instance_from_wire(value: i64) -> Option<u64> {
    if value < 0 { None } else { Some(value as u64) }
}

/// Maps an optional instance filter to its wire representation.
pub fn instance_to_wire(value: Option<u64>) -> i64 {
    value.map_or(-1, |v| v as i64)
}

/// Maps the wire representation of a timestamp: `seconds == 0` means absent.
pub fn timestamp_from_wire(seconds: i64, nanos: u32) -> Option<DateTime<Utc>> {
    if seconds == 0 {
        None
    } else {
        Utc.timestamp_opt(seconds, nanos).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ident_display() {
        let ident = InstanceIdent::new("svc", "subj", 2);
        assert_eq!(ident.to_string(), "svc:subj:2");
    }

    #[test]
    fn instance_wire_boundary() {
        assert_eq!(instance_from_wire(-1), None);
        assert_eq!(instance_from_wire(0), Some(0));
        assert_eq!(instance_from_wire(7), Some(7));
        assert_eq!(instance_to_wire(None), -1);
        assert_eq!(instance_to_wire(Some(7)), 7);
    }

    #[test]
    fn timestamp_wire_boundary() {
        assert_eq!(timestamp_from_wire(0, 0), None);
        assert!(timestamp_from_wire(1_700_000_000, 0).is_some());
    }

    #[tokio::test]
    async fn cancel_token_observes_source() {
        let (source, mut token) = CancelSource::new();
        assert!(!token.is_cancelled());
        source.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
