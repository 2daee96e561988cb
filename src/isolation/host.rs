//! Host-side block device commands (mount, umount, lsblk, blockdev, udisksctl, sysfs `authorized`).
//! Behind a trait so the lifecycle can run against fakes without root.

use super::{AccessMode, IsolationError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub trait HostCommands: Send + Sync {
    /// Current mount points of a block device (and its children)
    fn mount_points(&self, node: &Path) -> Result<Vec<PathBuf>, IsolationError>;

    fn mount(&self, node: &Path, target: &Path, mode: AccessMode) -> Result<(), IsolationError>;

    fn unmount(&self, target: &Path) -> Result<(), IsolationError>;

    /// Mark the block device read-only at the kernel level
    fn set_read_only(&self, node: &Path) -> Result<(), IsolationError>;

    /// Power the device off at the bus level
    fn power_off(&self, node: &Path) -> Result<(), IsolationError>;

    /// Write a USB `authorized` control file. `false` unbinds every driver and the
    /// block nodes disappear; `true` re-enumerates the device.
    fn set_authorized(&self, control: &Path, authorized: bool) -> Result<(), IsolationError> {
        super::write_control(control, if authorized { "1" } else { "0" })
    }
}

/// Real host commands via `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommands;

impl SystemCommands {
    fn run(program: &str, args: &[&OsStr]) -> Result<String, IsolationError> {
        let rendered = std::iter::once(program.to_string())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %rendered, "running host command");

        let output = Command::new(program).args(args).output().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => IsolationError::PrivilegeDenied {
                operation: rendered.clone(),
            },
            _ => IsolationError::CommandFailed {
                command: rendered.clone(),
                detail: e.to_string(),
            },
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_lowercase();
        if lowered.contains("permission denied") || lowered.contains("only root") {
            return Err(IsolationError::PrivilegeDenied { operation: rendered });
        }
        Err(IsolationError::CommandFailed {
            command: rendered,
            detail: format!("{}: {}", output.status, stderr),
        })
    }
}

impl HostCommands for SystemCommands {
    fn mount_points(&self, node: &Path) -> Result<Vec<PathBuf>, IsolationError> {
        let out = Self::run("lsblk", &[OsStr::new("-lnpo"), OsStr::new("MOUNTPOINT"), node.as_os_str()])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    fn mount(&self, node: &Path, target: &Path, mode: AccessMode) -> Result<(), IsolationError> {
        let options = match mode {
            AccessMode::ReadOnly => "ro,nosuid,nodev,noexec",
            AccessMode::ReadWrite => "rw,nosuid,nodev",
        };
        Self::run(
            "mount",
            &[OsStr::new("-o"), OsStr::new(options), node.as_os_str(), target.as_os_str()],
        )
        .map(|_| ())
    }

    fn unmount(&self, target: &Path) -> Result<(), IsolationError> {
        Self::run("umount", &[target.as_os_str()]).map(|_| ())
    }

    fn set_read_only(&self, node: &Path) -> Result<(), IsolationError> {
        Self::run("blockdev", &[OsStr::new("--setro"), node.as_os_str()]).map(|_| ())
    }

    fn power_off(&self, node: &Path) -> Result<(), IsolationError> {
        Self::run("udisksctl", &[OsStr::new("power-off"), OsStr::new("-b"), node.as_os_str()]).map(|_| ())
    }
}
