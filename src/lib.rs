//! # edgerun
//!
//! **Per-Node Service Manager for Edge Devices**
//!
//! This crate makes one node converge to the set of service instances a
//! central communication manager asks for, and continuously reports run
//! status back. Workloads run as OCI-style containers under the host init
//! supervisor; their images and overlay layers live in content-addressed,
//! reference-counted, TTL-governed catalogs with bounded disk usage.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Launcher                               │
//! │        desired InstanceInfo[] ──► diff ──► stop / start          │
//! ├──────────────┬──────────────────┬────────────────┬───────────────┤
//! │ ServiceManager│   LayerManager  │  BundleBuilder │    Runner     │
//! │  (catalog +   │  (catalog +     │  (rootfs overlay│ (supervisor  │
//! │   pinning)    │   dedup install)│   + config.json)│  units +     │
//! │               │                 │                 │  monitor)    │
//! ├───────────────┴─────────────────┴────────────────┴───────────────┤
//! │ SpaceAllocator (per partition)  │  ImageHandler  │   Storage     │
//! │  bounded reservations, eviction │  verify/unpack │  state file   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! External collaborators (downloader, host supervisor, network manager,
//! communication-manager uplink, journal, usage probes) are capability
//! traits; production wiring and test doubles implement the same traits.
//!
//! # Instance Lifecycle
//!
//! ```text
//!   run_instances(desired)
//!        │ ensure services + layers (download, verify, unpack)
//!        │ stop removed / changed instances
//!        │ build bundles, mount overlay rootfs
//!        ▼
//!   aos-service@<id>.service started ──► monitor ──► RunStatus to CM
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod alerts;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod imagehandler;
pub mod launcher;
pub mod layermanager;
pub mod logprovider;
pub mod monitoring;
pub mod resourcemanager;
pub mod runner;
pub mod servicemanager;
pub mod spaceallocator;
pub mod storage;
pub mod supervisor;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::Config;
pub use error::{Error, Result};
pub use launcher::{Launcher, NetworkManager, SmClient, StatusForwarder};
pub use layermanager::{Downloader, LayerManager};
pub use resourcemanager::HostDeviceManager;
pub use runner::{HostSupervisor, RunStatusReceiver, Runner};
pub use servicemanager::ServiceManager;
pub use spaceallocator::{PlatformFs, SpaceAllocator};
pub use storage::{FileStorage, Storage};
pub use types::{
    DesiredState, InstanceIdent, InstanceInfo, ItemState, LayerData, LayerInfo, RunState,
    RunStatus, ServiceData, ServiceInfo,
};
