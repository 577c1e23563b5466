//! # OCI Archive Installation
//!
//! Validates and unpacks service and layer archives into their install
//! directories, and computes content digests over files and directory
//! trees.
//!
//! ## Security Model
//!
//! Unpacking untrusted archives is a critical boundary. Every tar entry is
//! validated before extraction:
//!
//! - Paths containing `..` or starting with `/` are rejected
//! - Symlink and hardlink targets escaping the install directory are rejected
//! - Cumulative unpacked size is bounded by `MAX_UNPACKED_SIZE`
//! - Entry count is bounded by `MAX_FILES_PER_ARCHIVE`
//!
//! The archive's SHA-256 is verified against the transport checksum
//! *before* unpacking; the unpacked tree digest is verified against the
//! content address afterwards.

use crate::constants::{
    MAX_ARCHIVE_SIZE, MAX_FILES_PER_ARCHIVE, MAX_MANIFEST_SIZE, MAX_UNPACKED_SIZE,
};
use crate::error::{Error, Result};
use crate::types::{LayerInfo, ServiceInfo};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// File name of the image manifest inside a service archive.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// File name of the image config inside a service archive.
pub const IMAGE_CONFIG_FILE_NAME: &str = "config.json";

/// Directory name of the service root filesystem inside a service archive.
pub const ROOTFS_DIR_NAME: &str = "rootfs";

// =============================================================================
// Manifest Types
// =============================================================================

/// Content descriptor inside an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    /// `sha256:<hex>` content address.
    pub digest: String,
    pub size: u64,
}

/// OCI image manifest shipped with every service archive.
///
/// `layers` lists the overlay layer digests the service depends on, in
/// mount order (bottom to top).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Resource limits requested by a service image.
///
/// Unset fields leave the corresponding dimension unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub ram_bytes: Option<u64>,
    /// CPU budget as a percentage of one core.
    pub cpu_percent: Option<f64>,
    /// Maximum process count.
    pub pids: Option<i64>,
}

impl ResourceLimits {
    /// True when no dimension is limited.
    pub fn is_unlimited(&self) -> bool {
        self.ram_bytes.is_none() && self.cpu_percent.is_none() && self.pids.is_none()
    }
}

/// Runtime section of the image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    /// Host devices the service needs, as `host[:container]` entries.
    pub devices: Vec<String>,
    /// Host groups the service needs.
    pub groups: Vec<String>,
    pub resources: ResourceLimits,
}

/// Image config shipped with every service archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub config: RuntimeConfig,
}

// =============================================================================
// Install Results
// =============================================================================

/// Result of a layer installation.
#[derive(Debug, Clone)]
pub struct InstalledLayer {
    pub path: PathBuf,
    /// Unpacked size in bytes.
    pub size: u64,
}

/// Result of a service installation.
#[derive(Debug, Clone)]
pub struct InstalledService {
    pub path: PathBuf,
    /// Unpacked size in bytes.
    pub size: u64,
    pub manifest: ImageManifest,
    /// `sha256:<hex>` digest of the manifest document.
    pub manifest_digest: String,
}

// =============================================================================
// Image Handler
// =============================================================================

/// Validates and unpacks OCI archives.
pub struct ImageHandler;

impl ImageHandler {
    pub fn new() -> Self {
        Self
    }

    /// Installs a layer archive under `install_base`.
    ///
    /// Verifies the transport checksum before unpacking and the content
    /// digest afterwards. The install path is content-addressed:
    /// `<install_base>/<first two hex chars>/<hex>`.
    pub fn install_layer(
        &self,
        archive: &Path,
        install_base: &Path,
        layer: &LayerInfo,
    ) -> Result<InstalledLayer> {
        self.verify_archive_checksum(archive, &layer.sha256)?;

        let hash = digest_hex(&layer.digest);
        if hash.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "invalid layer digest '{}'",
                layer.digest
            )));
        }

        let dest = install_base.join(&hash[..2.min(hash.len())]).join(&hash);
        if dest.exists() {
            // Layers are immutable; same digest means same content.
            debug!(digest = %layer.digest, "layer already installed");
            let size = dir_size(&dest)?;
            return Ok(InstalledLayer { path: dest, size });
        }

        unpack_archive(archive, &dest)?;

        let computed = self.calculate_digest(&dest)?;
        if computed != layer.digest {
            let _ = fs::remove_dir_all(&dest);
            return Err(Error::Validation(format!(
                "layer digest mismatch: expected {}, computed {computed}",
                layer.digest
            )));
        }

        let size = dir_size(&dest)?;

        info!(digest = %layer.digest, path = %dest.display(), size, "layer installed");

        Ok(InstalledLayer { path: dest, size })
    }

    /// Installs a service archive under `install_base`.
    ///
    /// The install path is `<install_base>/<service_id>/<version>`; the
    /// archive must contain `manifest.json`, `config.json`, and `rootfs/`.
    pub fn install_service(
        &self,
        archive: &Path,
        install_base: &Path,
        service: &ServiceInfo,
    ) -> Result<InstalledService> {
        self.verify_archive_checksum(archive, &service.sha256)?;

        let dest = install_base.join(&service.service_id).join(&service.version);
        if dest.exists() {
            // Leftover from an interrupted install; re-unpack from scratch.
            fs::remove_dir_all(&dest)?;
        }

        unpack_archive(archive, &dest)?;
        self.validate_service(&dest)?;

        let manifest_path = dest.join(MANIFEST_FILE_NAME);
        let manifest = read_manifest(&manifest_path)?;
        let manifest_digest = self.calculate_digest(&manifest_path)?;
        let size = dir_size(&dest)?;

        info!(
            service = %service.service_id,
            version = %service.version,
            path = %dest.display(),
            size,
            "service installed"
        );

        Ok(InstalledService {
            path: dest,
            size,
            manifest,
            manifest_digest,
        })
    }

    /// Checks that an unpacked service directory is complete.
    pub fn validate_service(&self, path: &Path) -> Result<()> {
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        let manifest = read_manifest(&manifest_path)?;

        if manifest.schema_version != 2 {
            return Err(Error::Validation(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }

        let config_path = path.join(IMAGE_CONFIG_FILE_NAME);
        if !config_path.is_file() {
            return Err(Error::Validation("image config missing".to_string()));
        }
        let _: ImageConfig = serde_json::from_reader(File::open(&config_path)?)?;

        if !path.join(ROOTFS_DIR_NAME).is_dir() {
            return Err(Error::Validation("service rootfs missing".to_string()));
        }

        Ok(())
    }

    /// Reads the image config of an installed service.
    pub fn service_config(&self, path: &Path) -> Result<ImageConfig> {
        let config_path = path.join(IMAGE_CONFIG_FILE_NAME);
        Ok(serde_json::from_reader(File::open(&config_path)?)?)
    }

    /// Computes the `sha256:<hex>` digest of a file, or of a directory tree.
    ///
    /// Directory digests are deterministic: entries are hashed as
    /// `<sorted relative path>\0<content>` so two trees with identical
    /// content produce identical digests on any host.
    pub fn calculate_digest(&self, path: &Path) -> Result<String> {
        let mut hasher = Sha256::new();

        if path.is_file() {
            hash_file(path, &mut hasher)?;
        } else if path.is_dir() {
            let mut entries = Vec::new();
            collect_files(path, path, &mut entries)?;
            entries.sort();

            for relative in entries {
                hasher.update(relative.as_os_str().as_encoded_bytes());
                hasher.update([0u8]);
                hash_file(&path.join(&relative), &mut hasher)?;
            }
        } else {
            return Err(Error::NotFound(format!("{}", path.display())));
        }

        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Verifies an archive's SHA-256 against its hex transport checksum.
    fn verify_archive_checksum(&self, archive: &Path, expected_hex: &str) -> Result<()> {
        let meta = fs::metadata(archive)?;
        if meta.len() > MAX_ARCHIVE_SIZE {
            return Err(Error::TooLarge {
                size: meta.len(),
                limit: MAX_ARCHIVE_SIZE,
            });
        }

        let mut hasher = Sha256::new();
        hash_file(archive, &mut hasher)?;
        let computed = hex::encode(hasher.finalize());

        if !computed.eq_ignore_ascii_case(expected_hex) {
            return Err(Error::Validation(format!(
                "archive checksum mismatch: expected {expected_hex}, computed {computed}"
            )));
        }

        Ok(())
    }
}

impl Default for ImageHandler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Archive Extraction
// =============================================================================

/// Unpacks a gzipped tar archive into `dest` with traversal and size
/// validation. `dest` is removed again on any failure.
fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    let result = unpack_entries(archive, dest);
    if result.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    result
}

fn unpack_entries(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut tar = Archive::new(decoder);
    tar.set_preserve_permissions(true);

    let mut total_size = 0u64;
    let mut file_count = 0usize;

    for entry in tar.entries().map_err(|err| {
        Error::Validation(format!("cannot read archive {}: {err}", archive.display()))
    })? {
        file_count += 1;
        if file_count > MAX_FILES_PER_ARCHIVE {
            return Err(Error::TooLarge {
                size: file_count as u64,
                limit: MAX_FILES_PER_ARCHIVE as u64,
            });
        }

        let mut entry =
            entry.map_err(|err| Error::Validation(format!("corrupt archive entry: {err}")))?;

        let path = entry
            .path()
            .map_err(|err| Error::Validation(format!("invalid entry path: {err}")))?
            .into_owned();

        let path_str = path.to_string_lossy();
        if path_str.contains("..") || path_str.starts_with('/') {
            return Err(Error::PathTraversal {
                path: path_str.to_string(),
            });
        }

        total_size += entry.size();
        if total_size > MAX_UNPACKED_SIZE {
            return Err(Error::TooLarge {
                size: total_size,
                limit: MAX_UNPACKED_SIZE,
            });
        }

        // Link targets must stay inside the install directory.
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            if let Ok(Some(target)) = entry.link_name() {
                validate_link_target(&path, &target)?;
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|err| Error::Validation(format!("cannot unpack {path_str}: {err}")))?;
    }

    Ok(())
}

/// Rejects link targets that resolve outside the extraction root.
fn validate_link_target(entry_path: &Path, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();

    if target_str.starts_with('/') {
        if target_str.contains("..") {
            return Err(Error::PathTraversal {
                path: format!("link target {target_str}"),
            });
        }
        return Ok(());
    }

    let parent = entry_path.parent().unwrap_or(Path::new(""));
    let resolved = parent.join(target);

    let mut depth: i32 = 0;
    for component in resolved.components() {
        match component {
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::PathTraversal {
                path: format!("link target {target_str}"),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Reads and bounds-checks an image manifest document.
pub fn read_manifest(path: &Path) -> Result<ImageManifest> {
    let meta =
        fs::metadata(path).map_err(|_| Error::Validation("image manifest missing".to_string()))?;
    if meta.len() > MAX_MANIFEST_SIZE {
        return Err(Error::TooLarge {
            size: meta.len(),
            limit: MAX_MANIFEST_SIZE,
        });
    }

    Ok(serde_json::from_reader(File::open(path)?)?)
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            out.push(
                path.strip_prefix(root)
                    .map_err(|err| Error::Failed(err.to_string()))?
                    .to_path_buf(),
            );
        }
    }
    Ok(())
}

/// Total size of all regular files under `path`.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }

    Ok(total)
}

/// Strips the algorithm prefix from a `sha256:<hex>` digest, keeping only
/// hex characters.
pub fn digest_hex(digest: &str) -> String {
    let (_, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    hash.chars().filter(|c| c.is_ascii_hexdigit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_strips_prefix() {
        assert_eq!(digest_hex("sha256:abcd12"), "abcd12");
        assert_eq!(digest_hex("abcd12"), "abcd12");
        assert_eq!(digest_hex("sha256:../evil"), "e");
    }

    #[test]
    fn link_target_validation() {
        assert!(validate_link_target(Path::new("usr/bin/sh"), Path::new("busybox")).is_ok());
        assert!(validate_link_target(Path::new("usr/bin/sh"), Path::new("../lib/x")).is_ok());
        assert!(
            validate_link_target(Path::new("bin"), Path::new("../../etc/passwd")).is_err()
        );
        assert!(
            validate_link_target(Path::new("bin"), Path::new("/abs/../../etc")).is_err()
        );
    }

    #[test]
    fn tree_digest_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(a.join("sub")).unwrap();
        fs::write(a.join("sub/file1"), b"one").unwrap();
        fs::write(a.join("file2"), b"two").unwrap();

        let b = dir.path().join("b");
        fs::create_dir_all(b.join("sub")).unwrap();
        fs::write(b.join("file2"), b"two").unwrap();
        fs::write(b.join("sub/file1"), b"one").unwrap();

        let handler = ImageHandler::new();
        assert_eq!(
            handler.calculate_digest(&a).unwrap(),
            handler.calculate_digest(&b).unwrap()
        );
    }
}
