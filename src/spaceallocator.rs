//! # Partition Space Allocation
//!
//! Bounded byte reservations over one filesystem directory. Each managed
//! partition (services, layers, downloads) gets its own allocator; the
//! owning manager registers cached artifacts as *outdated items* which the
//! allocator may evict, oldest first, when a reservation would not fit.
//!
//! ## Reservation Lifecycle
//!
//! ```text
//!   allocate_space(size) ──► Space ──► accept_space()   (bytes now on disk)
//!                              │
//!                              └─────► free_space()     (cancelled)
//! ```
//!
//! A reservation is all-or-nothing: either the full size fits (possibly
//! after eviction) or the call fails with `OutOfSpace` and nothing is
//! reserved.
//!
//! ## Eviction
//!
//! Eviction calls back into the owning manager through [`ItemRemover`],
//! held as a `Weak` capability. Removers delete the artifact's files and
//! mark its row removed; they MUST NOT re-enter the allocator, which holds
//! its partition lock across the callback to keep reservations serialized.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Partition size and free-space probes.
pub trait PlatformFs: Send + Sync {
    /// Total capacity of the partition holding `path`.
    fn total_size(&self, path: &Path) -> Result<u64>;

    /// Bytes currently available on the partition holding `path`.
    fn available_size(&self, path: &Path) -> Result<u64>;
}

/// Eviction callback implemented by the catalog owning the partition.
///
/// `remove_item` deletes the artifact's files and catalog row for `key`.
/// Implementations must not call back into the allocator.
pub trait ItemRemover: Send + Sync {
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// [`PlatformFs`] backed by `statvfs(2)`.
pub struct HostFs;

#[cfg(unix)]
impl PlatformFs for HostFs {
    fn total_size(&self, path: &Path) -> Result<u64> {
        let stat = statvfs(path)?;
        Ok(stat.0)
    }

    fn available_size(&self, path: &Path) -> Result<u64> {
        let stat = statvfs(path)?;
        Ok(stat.1)
    }
}

#[cfg(unix)]
fn statvfs(path: &Path) -> Result<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("invalid path {}", path.display())))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let frsize = stat.f_frsize as u64;
    Ok((stat.f_blocks as u64 * frsize, stat.f_bavail as u64 * frsize))
}

// =============================================================================
// Space Handle
// =============================================================================

/// Handle for a not-yet-committed reservation.
///
/// Returned by [`SpaceAllocator::allocate_space`]; passed back to either
/// [`SpaceAllocator::accept_space`] or [`SpaceAllocator::free_space`].
#[derive(Debug)]
pub struct Space {
    id: u64,
    size: u64,
}

impl Space {
    /// Reserved size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Clone)]
struct OutdatedItem {
    key: String,
    size: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct AllocatorState {
    /// Outstanding (pending + accepted-in-flight) reservation bytes.
    reserved: u64,
    next_id: u64,
    pending: HashMap<u64, u64>,
    outdated: Vec<OutdatedItem>,
}

// =============================================================================
// Allocator
// =============================================================================

/// Byte-budget allocator for one partition directory.
pub struct SpaceAllocator {
    partition: PathBuf,
    /// Percent of partition capacity usable; 0 means the full capacity.
    part_limit_percent: u32,
    fs: Arc<dyn PlatformFs>,
    remover: Mutex<Option<Weak<dyn ItemRemover>>>,
    state: Mutex<AllocatorState>,
}

impl SpaceAllocator {
    pub fn new(
        partition: impl Into<PathBuf>,
        part_limit_percent: u32,
        fs: Arc<dyn PlatformFs>,
    ) -> Self {
        Self {
            partition: partition.into(),
            part_limit_percent,
            fs,
            remover: Mutex::new(None),
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Registers the catalog that owns evictable items on this partition.
    ///
    /// Held weakly so the allocator never keeps its owner alive.
    pub fn register_remover(&self, remover: &Arc<dyn ItemRemover>) {
        *self.remover.lock().expect("allocator lock poisoned") = Some(Arc::downgrade(remover));
    }

    /// Partition directory this allocator governs.
    pub fn partition(&self) -> &Path {
        &self.partition
    }

    /// Reserves `size` bytes, evicting outdated items if required.
    pub fn allocate_space(&self, size: u64) -> Result<Space> {
        let mut state = self.state.lock().expect("allocator lock poisoned");

        let mut available = self.available_budget(&state)?;

        while available < size {
            let Some(oldest) = state
                .outdated
                .iter()
                .enumerate()
                .min_by_key(|(_, item)| item.timestamp)
                .map(|(idx, _)| idx)
            else {
                warn!(
                    partition = %self.partition.display(),
                    requested = size,
                    available,
                    "space request cannot be satisfied"
                );
                return Err(Error::OutOfSpace {
                    requested: size,
                    available,
                });
            };

            let item = state.outdated.remove(oldest);
            self.evict(&item)?;
            available += item.size;
        }

        state.reserved += size;
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id, size);

        debug!(
            partition = %self.partition.display(),
            size,
            reserved = state.reserved,
            "space reserved"
        );

        Ok(Space { id, size })
    }

    /// Commits a reservation; the bytes are now on disk and tracked by the
    /// filesystem itself.
    pub fn accept_space(&self, space: Space) -> Result<()> {
        let mut state = self.state.lock().expect("allocator lock poisoned");

        let size = state.pending.remove(&space.id).ok_or_else(|| {
            Error::InvalidArgument("reservation already accepted or freed".to_string())
        })?;
        state.reserved = state.reserved.saturating_sub(size);

        Ok(())
    }

    /// Cancels a reservation, returning its bytes to the free pool.
    pub fn free_space(&self, space: Space) {
        let mut state = self.state.lock().expect("allocator lock poisoned");

        if let Some(size) = state.pending.remove(&space.id) {
            state.reserved = state.reserved.saturating_sub(size);
        }
    }

    /// Registers a cached artifact as eligible for eviction.
    pub fn add_outdated_item(&self, key: &str, size: u64, timestamp: DateTime<Utc>) {
        let mut state = self.state.lock().expect("allocator lock poisoned");

        state.outdated.retain(|item| item.key != key);
        state.outdated.push(OutdatedItem {
            key: key.to_string(),
            size,
            timestamp,
        });
    }

    /// Pins a previously registered artifact; it can no longer be evicted.
    pub fn restore_outdated_item(&self, key: &str) {
        let mut state = self.state.lock().expect("allocator lock poisoned");
        state.outdated.retain(|item| item.key != key);
    }

    fn evict(&self, item: &OutdatedItem) -> Result<()> {
        let remover = self
            .remover
            .lock()
            .expect("allocator lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Failed("no item remover registered".to_string()))?;

        info!(
            partition = %self.partition.display(),
            key = %item.key,
            size = item.size,
            "evicting outdated item"
        );

        remover.remove_item(&item.key)
    }

    /// Bytes still allocatable: bounded by the partition limit, the real
    /// free space, and outstanding reservations.
    fn available_budget(&self, state: &AllocatorState) -> Result<u64> {
        let total = self.fs.total_size(&self.partition)?;
        let available_fs = self.fs.available_size(&self.partition)?;

        let limit = if self.part_limit_percent > 0 {
            total / 100 * self.part_limit_percent as u64
        } else {
            total
        };

        let used = total.saturating_sub(available_fs);
        let budget = limit.saturating_sub(used).min(available_fs);

        Ok(budget.saturating_sub(state.reserved))
    }
}
