//! Isolation controller: keeps a device away from filesystem drivers until a decision is made.
//!
//! Two primitives, chosen by configuration:
//! - `bus`: toggle the USB device's sysfs `authorized` control file ("0" isolates, "1" restores)
//! - `unmount`: force-unmount every mount of the device; authorization remounts it

pub mod host;
pub mod sysfs;

use crate::config::{IsolationConfig, IsolationStrategy};
use crate::device::{self, DeviceIdentity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use host::{HostCommands, SystemCommands};

const NODE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("no USB authorization control file found for {node}")]
    SysfsPathUnresolved { node: PathBuf },
    #[error("insufficient privileges for {operation}")]
    PrivilegeDenied { operation: String },
    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("cannot access {path}: {source}")]
    ControlFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Terminal isolation action for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationAction {
    Authorize(AccessMode),
    Quarantine,
    Eject,
    KeepIsolated,
}

/// What `isolate` did, so the same primitive can be reversed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IsolationHandle {
    Deauthorized { node: PathBuf, control: PathBuf },
    Unmounted { node: PathBuf, partition: Option<PathBuf> },
}

impl IsolationHandle {
    pub fn node(&self) -> &Path {
        match self {
            Self::Deauthorized { node, .. } | Self::Unmounted { node, .. } => node,
        }
    }
}

pub struct IsolationController {
    strategy: IsolationStrategy,
    host: Arc<dyn HostCommands>,
    sysfs_root: PathBuf,
    access_dir: PathBuf,
    max_depth: usize,
    node_wait: Duration,
}

impl IsolationController {
    pub fn new(config: &IsolationConfig, host: Arc<dyn HostCommands>) -> Self {
        Self {
            strategy: config.strategy,
            host,
            sysfs_root: config.sysfs_root.clone(),
            access_dir: config.access_dir.clone(),
            max_depth: config.max_topology_depth,
            node_wait: Duration::from_secs(config.node_wait_secs),
        }
    }

    /// Isolate a device. Isolating an already-isolated device succeeds without side effects.
    pub fn isolate(&self, identity: &DeviceIdentity) -> Result<IsolationHandle, IsolationError> {
        match self.strategy {
            IsolationStrategy::Bus => {
                let control =
                    sysfs::resolve_authorized_control(identity, &self.sysfs_root, self.max_depth)?;
                if read_control(&control)? == "0" {
                    debug!(control = %control.display(), "device already deauthorized");
                } else {
                    self.host.set_authorized(&control, false)?;
                    info!(device = %identity.node.display(), control = %control.display(), "device deauthorized");
                }
                Ok(IsolationHandle::Deauthorized {
                    node: identity.node.clone(),
                    control,
                })
            }
            IsolationStrategy::Unmount => {
                for target in self.host.mount_points(&identity.node)? {
                    self.host.unmount(&target)?;
                    info!(device = %identity.node.display(), target = %target.display(), "forced unmount");
                }
                Ok(IsolationHandle::Unmounted {
                    node: identity.node.clone(),
                    partition: device::first_partition(identity, &self.sysfs_root),
                })
            }
        }
    }

    /// Restore access with the requested mode
    pub fn authorize(&self, handle: &IsolationHandle, mode: AccessMode) -> Result<(), IsolationError> {
        match handle {
            IsolationHandle::Deauthorized { node, control } => {
                self.host.set_authorized(control, true)?;
                if !wait_for_node(node, self.node_wait) {
                    return Err(IsolationError::CommandFailed {
                        command: "authorize".to_string(),
                        detail: format!("{} did not reappear after authorization", node.display()),
                    });
                }
                if mode == AccessMode::ReadOnly {
                    self.host.set_read_only(node)?;
                }
                info!(device = %node.display(), ?mode, "device authorized");
                Ok(())
            }
            IsolationHandle::Unmounted { node, partition } => {
                let partition = partition.as_ref().ok_or_else(|| IsolationError::CommandFailed {
                    command: "mount".to_string(),
                    detail: format!("no mountable partition on {}", node.display()),
                })?;
                let name = partition.file_name().unwrap_or(partition.as_os_str());
                let target = self.access_dir.join(name);
                std::fs::create_dir_all(&target).map_err(|source| IsolationError::ControlFile {
                    path: target.clone(),
                    source,
                })?;
                self.host.mount(partition, &target, mode)?;
                info!(device = %node.display(), target = %target.display(), ?mode, "device mounted for access");
                Ok(())
            }
        }
    }

    /// Bring a bus-isolated device back just long enough to scan it: re-authorize,
    /// wait for its node and mark it read-only. Dropping or concealing the returned
    /// exposure deauthorizes it again. Under the unmount strategy this does nothing.
    pub fn expose_for_scan(&self, handle: &IsolationHandle) -> Result<ScanExposure, IsolationError> {
        let IsolationHandle::Deauthorized { node, control } = handle else {
            return Ok(ScanExposure {
                host: self.host.clone(),
                control: None,
            });
        };
        self.host.set_authorized(control, true)?;
        // From here on every exit path deauthorizes again
        let exposure = ScanExposure {
            host: self.host.clone(),
            control: Some(control.clone()),
        };
        if !wait_for_node(node, self.node_wait) {
            return Err(IsolationError::CommandFailed {
                command: "authorize".to_string(),
                detail: format!("{} did not reappear for scanning", node.display()),
            });
        }
        self.host.set_read_only(node)?;
        info!(device = %node.display(), "device exposed read-only for scanning");
        Ok(exposure)
    }

    /// `DEVPATH` of the USB device behind a bus handle (`/devices/.../usb2/2-1`).
    /// Every block event for that device, before or after re-enumeration, lives under it.
    pub fn usb_devpath(&self, handle: &IsolationHandle) -> Option<String> {
        let IsolationHandle::Deauthorized { control, .. } = handle else {
            return None;
        };
        let root = self.sysfs_root.canonicalize().ok()?;
        let dir = control.parent()?.strip_prefix(&root).ok()?;
        Some(format!("/{}", dir.to_string_lossy()))
    }

    /// Leave the device isolated indefinitely
    pub fn quarantine(&self, handle: &IsolationHandle) {
        info!(device = %handle.node().display(), "device quarantined; remains isolated");
    }

    /// Power the device off; no later authorization is valid for the session
    pub fn eject(&self, identity: &DeviceIdentity) -> Result<(), IsolationError> {
        self.host.power_off(&identity.node)?;
        info!(device = %identity.node.display(), "device ejected");
        Ok(())
    }

    pub fn apply(
        &self,
        identity: &DeviceIdentity,
        handle: &IsolationHandle,
        action: IsolationAction,
    ) -> Result<(), IsolationError> {
        match action {
            IsolationAction::Authorize(mode) => self.authorize(handle, mode),
            IsolationAction::Quarantine => {
                self.quarantine(handle);
                Ok(())
            }
            IsolationAction::Eject => self.eject(identity),
            IsolationAction::KeepIsolated => {
                debug!(device = %identity.node.display(), "device left isolated");
                Ok(())
            }
        }
    }
}

/// A bus-isolated device temporarily authorized for scanning
#[must_use = "dropping the exposure deauthorizes the device"]
pub struct ScanExposure {
    host: Arc<dyn HostCommands>,
    control: Option<PathBuf>,
}

impl ScanExposure {
    /// True when the device was re-authorized and will be deauthorized again
    pub fn is_active(&self) -> bool {
        self.control.is_some()
    }

    /// Deauthorize now, reporting failure instead of only logging it
    pub fn conceal(mut self) -> Result<(), IsolationError> {
        match self.control.take() {
            Some(control) => {
                self.host.set_authorized(&control, false)?;
                info!(control = %control.display(), "device deauthorized after scan");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScanExposure {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            if let Err(e) = self.host.set_authorized(&control, false) {
                warn!(control = %control.display(), error = %e, "could not deauthorize device after scan");
            }
        }
    }
}

fn control_error(path: &Path, source: std::io::Error) -> IsolationError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        IsolationError::PrivilegeDenied {
            operation: format!("write {}", path.display()),
        }
    } else {
        IsolationError::ControlFile {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn read_control(path: &Path) -> Result<String, IsolationError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| control_error(path, e))
}

fn write_control(path: &Path, value: &str) -> Result<(), IsolationError> {
    std::fs::write(path, value).map_err(|e| control_error(path, e))
}

fn wait_for_node(node: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if node.exists() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(NODE_POLL);
    }
}
