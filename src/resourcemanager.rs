//! Host device and group authorization.
//!
//! Image configs request host devices as `host[:container]` entries and
//! host groups by name. Before an instance is bundled, every request is
//! checked against what the host actually provides; an unknown device or
//! group is `NotFound` and fails only that instance.

use crate::error::{Error, Result};
use std::path::Path;

/// Splits a device entry into its host path; the optional part after the
/// first `:` is the in-instance path.
pub fn device_host_path(entry: &str) -> &str {
    entry.split(':').next().unwrap_or(entry)
}

/// Authorizes host devices and groups for instance bundles.
#[derive(Debug, Default)]
pub struct HostDeviceManager;

impl HostDeviceManager {
    pub fn new() -> Self {
        Self
    }

    /// Checks that the host side of a `host[:container]` device entry
    /// exists.
    pub fn check_device(&self, device: &str) -> Result<()> {
        let host_path = device_host_path(device);

        if host_path.is_empty() || !Path::new(host_path).exists() {
            return Err(Error::NotFound(format!("device {host_path}")));
        }

        Ok(())
    }

    /// Checks that a host group exists.
    #[cfg(unix)]
    pub fn check_group(&self, group: &str) -> Result<()> {
        let c_group = std::ffi::CString::new(group)
            .map_err(|_| Error::InvalidArgument(format!("invalid group name '{group}'")))?;

        let entry = unsafe { libc::getgrnam(c_group.as_ptr()) };
        if entry.is_null() {
            return Err(Error::NotFound(format!("group {group}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_entry_splits_on_colon() {
        assert_eq!(device_host_path("/dev/null"), "/dev/null");
        assert_eq!(device_host_path("/dev/null:/dev/test"), "/dev/null");
        assert_eq!(device_host_path(""), "");
    }

    #[test]
    fn check_device_accepts_existing_host_path() {
        let manager = HostDeviceManager::new();

        assert!(manager.check_device("/dev/null").is_ok());
        assert!(manager.check_device("/dev/null:/dev/test").is_ok());
    }

    #[test]
    fn check_device_returns_not_found() {
        let manager = HostDeviceManager::new();

        assert!(matches!(
            manager.check_device("not found test folder"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(manager.check_device(""), Err(Error::NotFound(_))));
    }

    #[test]
    fn check_group_accepts_existing_group() {
        let manager = HostDeviceManager::new();

        assert!(manager.check_group("root").is_ok());
    }

    #[test]
    fn check_group_returns_not_found() {
        let manager = HostDeviceManager::new();

        assert!(matches!(
            manager.check_group("not found test group"),
            Err(Error::NotFound(_))
        ));
    }
}
