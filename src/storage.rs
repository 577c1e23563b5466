//! Durable state persistence.
//!
//! The service manager keeps its catalog rows in one JSON state document
//! written atomically (temp file + rename), so a crash mid-write never
//! leaves a torn document behind. The [`Storage`] trait is the seam the
//! rest of the crate consumes; tests substitute an in-memory double.

use crate::error::{Error, Result};
use crate::types::{InstanceIdent, LayerData, ServiceData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Per-chain traffic counters persisted across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Durable store consumed by the managers and the launcher.
///
/// Single writer; implementations serialize access internally.
pub trait Storage: Send + Sync {
    /// Returns the generated instance ID for an identity, if any.
    fn instance_id(&self, ident: &InstanceIdent) -> Result<Option<String>>;

    /// Records the generated instance ID for an identity.
    fn set_instance_id(&self, ident: &InstanceIdent, instance_id: &str) -> Result<()>;

    /// Drops the instance row for an identity.
    fn remove_instance(&self, ident: &InstanceIdent) -> Result<()>;

    /// Returns all service rows.
    fn services(&self) -> Result<Vec<ServiceData>>;

    /// Inserts or replaces the row keyed by `(service_id, version)`.
    fn upsert_service(&self, service: &ServiceData) -> Result<()>;

    /// Drops the row keyed by `(service_id, version)`.
    fn remove_service(&self, service_id: &str, version: &str) -> Result<()>;

    /// Returns all layer rows.
    fn layers(&self) -> Result<Vec<LayerData>>;

    /// Inserts or replaces the row keyed by content digest.
    fn upsert_layer(&self, layer: &LayerData) -> Result<()>;

    /// Drops the row keyed by content digest.
    fn remove_layer(&self, digest: &str) -> Result<()>;

    /// Returns the persisted journal cursor.
    fn journal_cursor(&self) -> Result<Option<String>>;

    /// Persists the journal cursor.
    fn set_journal_cursor(&self, cursor: &str) -> Result<()>;

    /// Returns the persisted traffic counters for a firewall chain.
    fn traffic(&self, chain: &str) -> Result<Option<TrafficCounters>>;

    /// Persists the traffic counters for a firewall chain.
    fn set_traffic(&self, chain: &str, counters: TrafficCounters) -> Result<()>;
}

// =============================================================================
// File Storage
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceRow {
    ident: InstanceIdent,
    instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StateDocument {
    instances: Vec<InstanceRow>,
    services: Vec<ServiceData>,
    layers: Vec<LayerData>,
    journal_cursor: Option<String>,
    traffic: HashMap<String, TrafficCounters>,
}

/// File-backed [`Storage`] implementation.
pub struct FileStorage {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl FileStorage {
    /// Opens (or creates) the state document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| Error::Storage {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        }

        let state = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|err| Error::Storage {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            serde_json::from_str(&content).map_err(|err| Error::Storage {
                path: path.clone(),
                reason: format!("corrupt state document: {err}"),
            })?
        } else {
            StateDocument::default()
        };

        info!(path = %path.display(), "opened state document");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Serializes the document atomically via temp file + rename.
    fn persist(&self, state: &StateDocument) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|err| Error::Storage {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        fs::rename(&temp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            Error::Storage {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        })
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut StateDocument) -> R) -> Result<R> {
        let mut state = self.state.lock().expect("storage lock poisoned");
        let result = op(&mut state);
        self.persist(&state)?;
        Ok(result)
    }

    fn read<R>(&self, op: impl FnOnce(&StateDocument) -> R) -> R {
        let state = self.state.lock().expect("storage lock poisoned");
        op(&state)
    }
}

impl Storage for FileStorage {
    fn instance_id(&self, ident: &InstanceIdent) -> Result<Option<String>> {
        Ok(self.read(|s| {
            s.instances
                .iter()
                .find(|row| &row.ident == ident)
                .map(|row| row.instance_id.clone())
        }))
    }

    fn set_instance_id(&self, ident: &InstanceIdent, instance_id: &str) -> Result<()> {
        self.mutate(|s| {
            s.instances.retain(|row| &row.ident != ident);
            s.instances.push(InstanceRow {
                ident: ident.clone(),
                instance_id: instance_id.to_string(),
            });
        })
    }

    fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        self.mutate(|s| s.instances.retain(|row| &row.ident != ident))
    }

    fn services(&self) -> Result<Vec<ServiceData>> {
        Ok(self.read(|s| s.services.clone()))
    }

    fn upsert_service(&self, service: &ServiceData) -> Result<()> {
        self.mutate(|s| {
            s.services.retain(|row| {
                !(row.service_id == service.service_id && row.version == service.version)
            });
            s.services.push(service.clone());
        })
    }

    fn remove_service(&self, service_id: &str, version: &str) -> Result<()> {
        self.mutate(|s| {
            s.services
                .retain(|row| !(row.service_id == service_id && row.version == version));
        })
    }

    fn layers(&self) -> Result<Vec<LayerData>> {
        Ok(self.read(|s| s.layers.clone()))
    }

    fn upsert_layer(&self, layer: &LayerData) -> Result<()> {
        self.mutate(|s| {
            s.layers.retain(|row| row.digest != layer.digest);
            s.layers.push(layer.clone());
        })
    }

    fn remove_layer(&self, digest: &str) -> Result<()> {
        self.mutate(|s| s.layers.retain(|row| row.digest != digest))
    }

    fn journal_cursor(&self) -> Result<Option<String>> {
        Ok(self.read(|s| s.journal_cursor.clone()))
    }

    fn set_journal_cursor(&self, cursor: &str) -> Result<()> {
        self.mutate(|s| s.journal_cursor = Some(cursor.to_string()))
    }

    fn traffic(&self, chain: &str) -> Result<Option<TrafficCounters>> {
        Ok(self.read(|s| s.traffic.get(chain).copied()))
    }

    fn set_traffic(&self, chain: &str, counters: TrafficCounters) -> Result<()> {
        self.mutate(|s| {
            s.traffic.insert(chain.to_string(), counters);
        })
    }
}
