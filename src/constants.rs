//! Constants for the service manager.
//!
//! All limits, timeouts, and naming templates are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Unit Naming
// =============================================================================

/// Prefix of every supervised instance unit.
pub const UNIT_NAME_PREFIX: &str = "aos-service@";

/// Suffix of every supervised instance unit.
pub const UNIT_NAME_SUFFIX: &str = ".service";

/// File name of the per-unit run-parameters drop-in.
pub const PARAMETERS_FILE_NAME: &str = "parameters.conf";

/// Default systemd drop-in directory.
pub const DEFAULT_DROP_INS_DIR: &str = "/run/systemd/system";

// =============================================================================
// Runner Timing
// =============================================================================

/// Default start limit interval when the instance does not specify one.
pub const DEFAULT_START_INTERVAL: Duration = Duration::from_secs(5);

/// Default start burst when the instance does not specify one.
pub const DEFAULT_START_BURST: u32 = 3;

/// Default restart interval when the instance does not specify one.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(1);

/// The start-unit call is given this many start intervals to complete.
pub const START_TIME_MULTIPLIER: u32 = 5;

/// Timeout for stopping a unit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Period between supervisor unit-list polls in the monitor task.
pub const STATUS_POLL_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Artifact Lifetimes
// =============================================================================

/// Default TTL for cached service versions (30 days).
pub const DEFAULT_SERVICE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default TTL for cached layers (30 days).
pub const DEFAULT_LAYER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default period between outdated-artifact sweeps (1 day).
pub const DEFAULT_REMOVE_OUTDATED_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Unpacked artifacts are assumed to need at most this multiple of the
/// archive size on the install partition.
pub const UNPACK_SIZE_FACTOR: u64 = 2;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of a single layer or service archive (512 MiB).
/// Prevents disk exhaustion from malicious images.
pub const MAX_ARCHIVE_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total unpacked size of one artifact (4 GiB).
pub const MAX_UNPACKED_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of entries in one archive.
pub const MAX_FILES_PER_ARCHIVE: usize = 262_144;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Launcher
// =============================================================================

/// Default number of instances started or stopped in parallel.
pub const DEFAULT_MAX_PARALLEL_OPS: usize = 8;

// =============================================================================
// Alerts
// =============================================================================

/// Default syslog priority threshold for service-instance alerts.
pub const DEFAULT_SERVICE_ALERT_PRIORITY: u8 = 4;

/// Default syslog priority threshold for system alerts.
pub const DEFAULT_SYSTEM_ALERT_PRIORITY: u8 = 3;

/// Highest valid syslog priority value.
pub const MAX_ALERT_PRIORITY: u8 = 7;

// =============================================================================
// Logging
// =============================================================================

/// Default maximum size of one log part sent to the communication manager.
pub const DEFAULT_LOG_PART_SIZE: usize = 64 * 1024;

/// Default maximum number of log parts per request.
pub const DEFAULT_LOG_PART_COUNT: usize = 80;

// =============================================================================
// Monitoring
// =============================================================================

/// Default resource-usage poll period.
pub const DEFAULT_MONITORING_POLL_PERIOD: Duration = Duration::from_secs(35);

/// Default resource-usage averaging window.
pub const DEFAULT_MONITORING_AVERAGE_WINDOW: Duration = Duration::from_secs(35);

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version emitted in bundle config.json.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation key carrying the instance identity in bundle config.json.
pub const ANNOTATION_INSTANCE_IDENT: &str = "io.edgerun.instance";

/// Annotation key carrying the service version in bundle config.json.
pub const ANNOTATION_SERVICE_VERSION: &str = "io.edgerun.version";
