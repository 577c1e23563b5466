//! # Journal Alerts
//!
//! Turns host journal entries into alerts for the communication manager.
//! Entries attributed to a supervised instance unit become
//! `Alert::ServiceInstance`; everything else above the system threshold
//! becomes `Alert::System`. The journal cursor is persisted so entries are
//! emitted exactly once across restarts.

use crate::config::JournalAlertsConfig;
use crate::error::Result;
use crate::launcher::SmClient;
use crate::runner::instance_id_from_unit;
use crate::storage::Storage;
use crate::types::Alert;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// One decoded journal entry.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub message: String,
    /// `_SYSTEMD_UNIT` field; may be a full slice path.
    pub systemd_unit: Option<String>,
    /// Syslog priority, 0 (emerg) .. 7 (debug).
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub cursor: String,
}

/// Host journal capability (sd-journal in production).
pub trait JournalReader: Send {
    /// Positions the reader just after the given cursor.
    fn seek_after(&mut self, cursor: &str) -> Result<()>;

    /// Returns the next entry, or `None` when the journal is drained.
    fn next_entry(&mut self) -> Result<Option<JournalEntry>>;
}

// =============================================================================
// Mapping
// =============================================================================

/// Stateless journal-entry → alert mapping.
pub struct AlertMapper {
    filters: Vec<Regex>,
    service_priority: u8,
    system_priority: u8,
}

impl AlertMapper {
    /// Builds a mapper from validated configuration. Unparsable filter
    /// expressions are skipped with a warning.
    pub fn new(config: &JournalAlertsConfig) -> Self {
        let filters = config
            .filter
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(%pattern, %err, "skipping invalid alert filter");
                    None
                }
            })
            .collect();

        Self {
            filters,
            service_priority: config.service_alert_priority,
            system_priority: config.system_alert_priority,
        }
    }

    /// Maps one journal entry; `None` means the entry is not alert-worthy.
    pub fn map_entry(&self, entry: &JournalEntry) -> Option<Alert> {
        if self.filters.iter().any(|regex| regex.is_match(&entry.message)) {
            return None;
        }

        if let Some(instance) = entry
            .systemd_unit
            .as_deref()
            .and_then(instance_from_unit_field)
        {
            if entry.priority <= self.service_priority {
                return Some(Alert::ServiceInstance {
                    instance,
                    message: entry.message.clone(),
                    timestamp: entry.timestamp,
                });
            }
            return None;
        }

        if entry.priority <= self.system_priority {
            return Some(Alert::System {
                message: entry.message.clone(),
                timestamp: entry.timestamp,
            });
        }

        None
    }
}

/// Extracts the instance ID from a `_SYSTEMD_UNIT` value, which may be the
/// bare unit name or a full slice path such as
/// `/system.slice/system-aos@service.slice/aos-service@service0.service`.
fn instance_from_unit_field(unit_field: &str) -> Option<String> {
    let unit_name = unit_field.rsplit('/').next().unwrap_or(unit_field);
    instance_id_from_unit(unit_name).ok()
}

// =============================================================================
// Monitor
// =============================================================================

/// Drains the journal, forwards alerts, and persists the cursor.
pub struct JournalAlerts {
    reader: Box<dyn JournalReader>,
    mapper: AlertMapper,
    client: Arc<dyn SmClient>,
    storage: Arc<dyn Storage>,
}

impl JournalAlerts {
    pub fn new(
        reader: Box<dyn JournalReader>,
        config: &JournalAlertsConfig,
        client: Arc<dyn SmClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let mut reader = reader;
        if let Some(cursor) = storage.journal_cursor()? {
            reader.seek_after(&cursor)?;
        }

        Ok(Self {
            reader,
            mapper: AlertMapper::new(config),
            client,
            storage,
        })
    }

    /// Processes every pending journal entry; returns how many alerts were
    /// sent. The cursor is persisted after each entry, so a crash never
    /// duplicates an alert.
    pub async fn process_pending(&mut self) -> Result<usize> {
        let mut sent = 0;

        while let Some(entry) = self.reader.next_entry()? {
            if let Some(alert) = self.mapper.map_entry(&entry) {
                debug!(cursor = %entry.cursor, "forwarding journal alert");
                self.client.send_alert(alert).await?;
                sent += 1;
            }
            self.storage.set_journal_cursor(&entry.cursor)?;
        }

        Ok(sent)
    }
}
