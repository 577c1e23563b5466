//! # Instance Bundle Assembly
//!
//! Builds the per-instance OCI runtime bundle the host supervisor points
//! its unit at: an overlay rootfs description, `config.json`, generated
//! `/etc` files, host-filesystem whiteouts, and host device entries.
//!
//! ## Rootfs Layout
//!
//! The instance rootfs is an overlayfs. Lower directories, uppermost
//! first:
//!
//! ```text
//!   layer 1 … layer N        (manifest order)
//!   service rootfs
//!   whiteouts                (masks host entries not in hostBinds)
//!   host /
//! ```
//!
//! with `upperdir`/`workdir` under the instance's state path. The actual
//! `mount(2)` call is isolated in [`mount_service_rootfs`] so everything
//! else can run (and be tested) unprivileged.
//!
//! ## Whiteouts
//!
//! For every top-level host entry not listed in `hostBinds`, a
//! character-device whiteout (mode 0, device 0:0) is created in the
//! whiteouts directory. Existing correct whiteouts are left alone, so
//! bundle preparation is idempotent.

use crate::config::HostEntry;
use crate::constants::{
    ANNOTATION_INSTANCE_IDENT, ANNOTATION_SERVICE_VERSION, OCI_RUNTIME_SPEC_VERSION,
};
use crate::error::{Error, Result};
use crate::imagehandler::{ImageConfig, ROOTFS_DIR_NAME};
use crate::types::{InstanceInfo, ServiceData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI runtime spec written to each bundle's `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: SpecRoot,
    pub process: SpecProcess,
    pub hostname: String,
    pub mounts: Vec<SpecMount>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<SpecLinux>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecProcess {
    pub terminal: bool,
    pub user: SpecUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecLinux {
    pub namespaces: Vec<SpecNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<SpecResources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Host device exposed to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: u64,
    pub minor: u64,
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsLimit {
    pub limit: i64,
}

/// CFS period used when translating a CPU percentage into a quota.
const CPU_QUOTA_PERIOD_US: u64 = 100_000;

/// Maps image-config resource limits onto the runtime spec; `None` when
/// nothing is limited.
pub fn spec_resources(limits: &crate::imagehandler::ResourceLimits) -> Option<SpecResources> {
    if limits.is_unlimited() {
        return None;
    }

    Some(SpecResources {
        memory: limits.ram_bytes.map(|bytes| MemoryLimit {
            limit: Some(bytes as i64),
        }),
        cpu: limits.cpu_percent.map(|percent| CpuLimit {
            shares: None,
            quota: Some((percent / 100.0 * CPU_QUOTA_PERIOD_US as f64) as i64),
            period: Some(CPU_QUOTA_PERIOD_US),
        }),
        pids: limits.pids.map(|limit| PidsLimit { limit }),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

// =============================================================================
// Overlay Description
// =============================================================================

/// Overlay rootfs description produced with every bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    /// Lower directories, uppermost first.
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Mount target: `<bundle>/rootfs`.
    pub target: PathBuf,
}

impl OverlayMount {
    /// Renders the overlayfs mount options string.
    pub fn options(&self) -> String {
        let lower: Vec<String> = self
            .lower_dirs
            .iter()
            .map(|dir| dir.to_string_lossy().to_string())
            .collect();
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// A prepared instance bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle directory holding `config.json` and `rootfs/`.
    pub path: PathBuf,
    pub overlay: OverlayMount,
}

// =============================================================================
// Bundle Builder
// =============================================================================

/// Assembles per-instance bundles under a runtime directory.
pub struct BundleBuilder {
    runtime_dir: PathBuf,
    host_root: PathBuf,
    host_binds: Vec<String>,
    hosts: Vec<HostEntry>,
}

impl BundleBuilder {
    pub fn new(
        runtime_dir: impl Into<PathBuf>,
        host_binds: Vec<String>,
        hosts: Vec<HostEntry>,
    ) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            host_root: PathBuf::from("/"),
            host_binds,
            hosts,
        }
    }

    /// Overrides the host filesystem root; used by tests.
    pub fn with_host_root(mut self, host_root: impl Into<PathBuf>) -> Self {
        self.host_root = host_root.into();
        self
    }

    /// Builds (or refreshes) the bundle for one instance. Idempotent.
    pub fn prepare_bundle(
        &self,
        instance_id: &str,
        instance: &InstanceInfo,
        service: &ServiceData,
        image_config: &ImageConfig,
        layer_paths: &[PathBuf],
        netns_path: Option<&Path>,
    ) -> Result<Bundle> {
        let bundle_dir = self.runtime_dir.join(instance_id);
        let rootfs = bundle_dir.join(ROOTFS_DIR_NAME);
        fs::create_dir_all(&rootfs)?;

        let whiteouts_dir = bundle_dir.join("whiteouts");
        self.create_host_fs_whiteouts(&whiteouts_dir)?;

        let etc_dir = bundle_dir.join("etc");
        self.write_etc_files(&etc_dir, instance_id, instance)?;

        let upper_dir = PathBuf::from(&instance.state_path).join("upper");
        let work_dir = PathBuf::from(&instance.state_path).join("work");
        fs::create_dir_all(&upper_dir)?;
        fs::create_dir_all(&work_dir)?;

        // Uppermost first: layers in manifest order, service rootfs,
        // whiteouts masking the host, then the host itself.
        let mut lower_dirs: Vec<PathBuf> = layer_paths.to_vec();
        lower_dirs.push(PathBuf::from(&service.image_path).join(ROOTFS_DIR_NAME));
        lower_dirs.push(whiteouts_dir);
        lower_dirs.push(self.host_root.clone());

        let overlay = OverlayMount {
            lower_dirs,
            upper_dir,
            work_dir,
            target: rootfs,
        };

        let mut devices = Vec::new();
        for entry in &image_config.config.devices {
            let host_path = crate::resourcemanager::device_host_path(entry);
            populate_host_devices(Path::new(host_path), &mut devices)?;
        }

        let spec = self.generate_spec(instance_id, instance, service, image_config, devices, netns_path);
        let config_json = serde_json::to_string_pretty(&spec)?;
        fs::write(bundle_dir.join("config.json"), config_json)?;

        info!(instance = %instance_id, path = %bundle_dir.display(), "bundle prepared");

        Ok(Bundle {
            path: bundle_dir,
            overlay,
        })
    }

    /// Removes an instance's bundle directory. Idempotent.
    pub fn teardown_bundle(&self, instance_id: &str) -> Result<()> {
        let bundle_dir = self.runtime_dir.join(instance_id);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir)?;
        }
        Ok(())
    }

    /// Creates whiteouts for every top-level host entry that is not bound
    /// into instances. Existing whiteouts are kept.
    fn create_host_fs_whiteouts(&self, whiteouts_dir: &Path) -> Result<()> {
        fs::create_dir_all(whiteouts_dir)?;

        for name in whiteout_targets(&self.host_root, &self.host_binds)? {
            let whiteout = whiteouts_dir.join(&name);
            if whiteout.exists() {
                continue;
            }
            create_whiteout(&whiteout)?;
            debug!(entry = %name, "created host whiteout");
        }

        Ok(())
    }

    /// Generates `/etc/hosts`, `/etc/hostname`, `/etc/resolv.conf` from the
    /// instance network and the configured host list.
    fn write_etc_files(
        &self,
        etc_dir: &Path,
        instance_id: &str,
        instance: &InstanceInfo,
    ) -> Result<()> {
        fs::create_dir_all(etc_dir)?;

        let mut hosts = String::from("127.0.0.1\tlocalhost\n");
        if !instance.network_parameters.ip.is_empty() {
            hosts.push_str(&format!("{}\t{instance_id}\n", instance.network_parameters.ip));
        }
        for entry in &self.hosts {
            hosts.push_str(&format!("{}\t{}\n", entry.ip, entry.hostname));
        }
        fs::write(etc_dir.join("hosts"), hosts)?;

        fs::write(etc_dir.join("hostname"), format!("{instance_id}\n"))?;

        let mut resolv = String::new();
        for server in &instance.network_parameters.dns_servers {
            resolv.push_str(&format!("nameserver {server}\n"));
        }
        fs::write(etc_dir.join("resolv.conf"), resolv)?;

        Ok(())
    }

    fn generate_spec(
        &self,
        instance_id: &str,
        instance: &InstanceInfo,
        service: &ServiceData,
        image_config: &ImageConfig,
        devices: Vec<LinuxDevice>,
        netns_path: Option<&Path>,
    ) -> RuntimeSpec {
        let runtime = &image_config.config;

        let mut args = runtime.entrypoint.clone();
        args.extend(runtime.cmd.iter().cloned());
        if args.is_empty() {
            args.push("/bin/sh".to_string());
        }

        let mut env = runtime.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            );
        }

        let cwd = if runtime.working_dir.is_empty() {
            "/".to_string()
        } else {
            runtime.working_dir.clone()
        };

        let mut namespaces = vec![
            SpecNamespace {
                ns_type: "pid".to_string(),
                path: None,
            },
            SpecNamespace {
                ns_type: "uts".to_string(),
                path: None,
            },
            SpecNamespace {
                ns_type: "ipc".to_string(),
                path: None,
            },
            SpecNamespace {
                ns_type: "mount".to_string(),
                path: None,
            },
        ];
        namespaces.push(SpecNamespace {
            ns_type: "network".to_string(),
            path: netns_path.map(|p| p.to_string_lossy().to_string()),
        });

        let mut annotations = HashMap::new();
        annotations.insert(
            ANNOTATION_INSTANCE_IDENT.to_string(),
            instance.ident.to_string(),
        );
        annotations.insert(
            ANNOTATION_SERVICE_VERSION.to_string(),
            service.version.clone(),
        );

        RuntimeSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: SpecRoot {
                path: ROOTFS_DIR_NAME.to_string(),
                readonly: false,
            },
            process: SpecProcess {
                terminal: false,
                user: SpecUser { uid: 0, gid: 0 },
                args,
                env,
                cwd,
            },
            hostname: instance_id.to_string(),
            mounts: self.instance_mounts(&self.runtime_dir.join(instance_id), instance),
            annotations,
            linux: Some(SpecLinux {
                namespaces,
                devices,
                resources: spec_resources(&image_config.config.resources),
                uid_mappings: vec![IdMapping {
                    container_id: 0,
                    host_id: instance.uid,
                    size: 1,
                }],
                gid_mappings: vec![IdMapping {
                    container_id: 0,
                    host_id: service.gid,
                    size: 1,
                }],
            }),
        }
    }

    fn instance_mounts(&self, bundle_dir: &Path, instance: &InstanceInfo) -> Vec<SpecMount> {
        let bind = |source: String, destination: &str| SpecMount {
            destination: destination.to_string(),
            mount_type: "bind".to_string(),
            source,
            options: vec!["bind".to_string(), "rw".to_string()],
        };

        let mut mounts = vec![
            SpecMount {
                destination: "/proc".to_string(),
                mount_type: "proc".to_string(),
                source: "proc".to_string(),
                options: vec![],
            },
            SpecMount {
                destination: "/dev".to_string(),
                mount_type: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "strictatime".to_string(),
                    "mode=755".to_string(),
                ],
            },
            SpecMount {
                destination: "/sys".to_string(),
                mount_type: "sysfs".to_string(),
                source: "sysfs".to_string(),
                options: vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                    "ro".to_string(),
                ],
            },
        ];

        for file in ["hosts", "hostname", "resolv.conf"] {
            mounts.push(SpecMount {
                destination: format!("/etc/{file}"),
                mount_type: "bind".to_string(),
                source: bundle_dir.join("etc").join(file).to_string_lossy().to_string(),
                options: vec!["bind".to_string(), "ro".to_string()],
            });
        }

        if !instance.storage_path.is_empty() {
            mounts.push(bind(instance.storage_path.clone(), "/storage"));
        }

        mounts
    }
}

/// Top-level host entries that must be masked: everything under the host
/// root that is not listed in `host_binds`.
pub fn whiteout_targets(host_root: &Path, host_binds: &[String]) -> Result<Vec<String>> {
    let mut targets = Vec::new();

    for entry in fs::read_dir(host_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !host_binds.iter().any(|bind| bind.trim_matches('/') == name) {
            targets.push(name);
        }
    }

    targets.sort();
    Ok(targets)
}

/// Creates one overlay whiteout: a character device, mode 0, device 0:0.
#[cfg(unix)]
fn create_whiteout(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("invalid path {}", path.display())))?;

    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR, 0) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(())
}

// =============================================================================
// Host Devices
// =============================================================================

/// Resolves a host device path (possibly a symlink) into OCI device
/// entries; directories are recursed.
#[cfg(unix)]
pub fn populate_host_devices(device_path: &Path, devices: &mut Vec<LinuxDevice>) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let resolved = fs::canonicalize(device_path)
        .map_err(|_| Error::NotFound(format!("device {}", device_path.display())))?;
    let meta = fs::metadata(&resolved)?;

    if meta.is_dir() {
        for entry in fs::read_dir(&resolved)? {
            populate_host_devices(&entry?.path(), devices)?;
        }
        return Ok(());
    }

    let mode = meta.mode();
    let device_type = match mode & libc::S_IFMT {
        libc::S_IFCHR => "c",
        libc::S_IFBLK => "b",
        _ => return Ok(()), // not a device node
    };

    let rdev = meta.rdev();
    devices.push(LinuxDevice {
        path: resolved.to_string_lossy().to_string(),
        device_type: device_type.to_string(),
        major: dev_major(rdev),
        minor: dev_minor(rdev),
        file_mode: mode & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
    });

    Ok(())
}

/// Extracts the major number from a Linux `dev_t`.
pub fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfffu64)
}

/// Extracts the minor number from a Linux `dev_t`.
pub fn dev_minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xffu64)
}

// =============================================================================
// Rootfs Mounting
// =============================================================================

/// Seam for the privileged overlay mount/unmount calls.
///
/// The launcher drives this around instance start/stop; tests substitute
/// a no-op double.
pub trait RootfsMounter: Send + Sync {
    fn mount(&self, overlay: &OverlayMount) -> Result<()>;
    fn umount(&self, overlay: &OverlayMount) -> Result<()>;
}

/// [`RootfsMounter`] backed by `mount(2)`/`umount2(2)`.
pub struct OverlayFsMounter;

#[cfg(target_os = "linux")]
impl RootfsMounter for OverlayFsMounter {
    fn mount(&self, overlay: &OverlayMount) -> Result<()> {
        mount_service_rootfs(overlay)
    }

    fn umount(&self, overlay: &OverlayMount) -> Result<()> {
        umount_service_rootfs(overlay)
    }
}

/// Mounts the instance overlay rootfs. Requires privileges; kept separate
/// so bundle preparation stays unprivileged.
#[cfg(target_os = "linux")]
pub fn mount_service_rootfs(overlay: &OverlayMount) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let target = std::ffi::CString::new(overlay.target.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("invalid mount target".to_string()))?;
    let fstype = std::ffi::CString::new("overlay").expect("static string");
    let options = std::ffi::CString::new(overlay.options())
        .map_err(|_| Error::InvalidArgument("invalid overlay options".to_string()))?;

    let rc = unsafe {
        libc::mount(
            fstype.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            options.as_ptr() as *const libc::c_void,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(())
}

/// Unmounts an instance overlay rootfs. Idempotent: an already-unmounted
/// target is not an error.
#[cfg(target_os = "linux")]
pub fn umount_service_rootfs(overlay: &OverlayMount) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let target = std::ffi::CString::new(overlay.target.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("invalid mount target".to_string()))?;

    let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) || err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        return Err(Error::Io(err));
    }

    Ok(())
}
