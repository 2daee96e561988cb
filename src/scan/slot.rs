//! The single read-only scan mount point.
//!
//! `MountSlot` hands out one `SlotPermit` at a time (FIFO). A `MountLease` owns the
//! permit while the partition is mounted; dropping the lease unmounts (only when
//! the lease performed the mount) and then releases the permit, on every exit path.

use super::ScanError;
use crate::isolation::{AccessMode, HostCommands};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MountSlot {
    inner: Arc<Mutex<PathBuf>>,
}

impl MountSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(path.into())),
        }
    }

    /// Wait for exclusive use of the slot
    pub async fn acquire(&self) -> SlotPermit {
        SlotPermit {
            guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn try_acquire(&self) -> Option<SlotPermit> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| SlotPermit { guard })
    }
}

/// Exclusive right to the scan mount point
pub struct SlotPermit {
    guard: OwnedMutexGuard<PathBuf>,
}

impl SlotPermit {
    pub fn path(&self) -> &Path {
        &self.guard
    }
}

pub struct MountLease {
    root: PathBuf,
    /// True when this lease mounted the partition and must unmount it
    owned: bool,
    host: Arc<dyn HostCommands>,
    // Dropped after `Drop::drop` has unmounted
    _permit: SlotPermit,
}

impl MountLease {
    /// Mount `partition` read-only at the slot, or reuse an existing external mount
    pub fn establish(
        permit: SlotPermit,
        host: Arc<dyn HostCommands>,
        partition: &Path,
    ) -> Result<Self, ScanError> {
        let mount_failed = |reason: String| ScanError::MountFailed {
            partition: partition.to_path_buf(),
            reason,
        };

        let existing = host
            .mount_points(partition)
            .map_err(|e| mount_failed(e.to_string()))?;
        if let Some(root) = existing.into_iter().next() {
            info!(partition = %partition.display(), root = %root.display(), "reusing existing mount");
            return Ok(Self {
                root,
                owned: false,
                host,
                _permit: permit,
            });
        }

        let target = permit.path().to_path_buf();
        std::fs::create_dir_all(&target).map_err(|e| mount_failed(e.to_string()))?;
        host.mount(partition, &target, AccessMode::ReadOnly)
            .map_err(|e| mount_failed(e.to_string()))?;
        info!(partition = %partition.display(), root = %target.display(), "mounted read-only for scan");
        Ok(Self {
            root: target,
            owned: true,
            host,
            _permit: permit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owned(&self) -> bool {
        self.owned
    }

    /// Unmount (if owned) and free the slot
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        if !self.owned {
            debug!(root = %self.root.display(), "leaving external mount in place");
            return;
        }
        match self.host.unmount(&self.root) {
            Ok(()) => info!(root = %self.root.display(), "scan mount released"),
            Err(e) => warn!(root = %self.root.display(), error = %e, "unmount failed"),
        }
    }
}
