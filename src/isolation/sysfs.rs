//! Walks sysfs topology from a block device up to its USB device's `authorized` file.

use super::IsolationError;
use crate::device::DeviceIdentity;
use std::path::{Path, PathBuf};

pub const AUTHORIZED_FILE: &str = "authorized";

/// Resolve the authorization control file for a block device.
///
/// Starts at the SCSI device behind the disk (partition nodes step up to their
/// disk first) and walks at most `max_depth` parents. The first ancestor that
/// sits under a `usb` segment, is a USB device rather than an interface (no `:`
/// in its name) and exposes an `authorized` file wins.
pub fn resolve_authorized_control(
    identity: &DeviceIdentity,
    sysfs_root: &Path,
    max_depth: usize,
) -> Result<PathBuf, IsolationError> {
    let unresolved = || IsolationError::SysfsPathUnresolved {
        node: identity.node.clone(),
    };

    let start = match &identity.devpath {
        Some(devpath) => sysfs_root.join(devpath.trim_start_matches('/')),
        None => sysfs_root
            .join("class")
            .join("block")
            .join(identity.kernel_name()),
    };
    let mut dir = start.canonicalize().map_err(|_| unresolved())?;
    if dir.join("partition").is_file() {
        if let Some(disk) = dir.parent() {
            dir = disk.to_path_buf();
        }
    }
    if let Ok(device) = dir.join("device").canonicalize() {
        dir = device;
    }

    let mut current = dir.as_path();
    for _ in 0..max_depth {
        let Some(parent) = current.parent() else {
            break;
        };
        if is_usb_device_dir(parent) {
            return Ok(parent.join(AUTHORIZED_FILE));
        }
        current = parent;
    }
    Err(unresolved())
}

fn is_usb_device_dir(dir: &Path) -> bool {
    let name_is_device = dir
        .file_name()
        .is_some_and(|n| !n.to_string_lossy().contains(':'));
    let under_usb = dir
        .components()
        .any(|c| c.as_os_str().to_string_lossy().contains("usb"));
    name_is_device && under_usb && dir.join(AUTHORIZED_FILE).is_file()
}
