//! Scan orchestrator: slot -> partition -> read-only mount -> signature scan + heuristics -> report.
//!
//! Scanning never fails outward. Every internal failure degrades the report and is
//! recorded in `ScanReport::issues`.

pub mod report;
pub mod signature;
pub mod slot;

use crate::config::ScanConfig;
use crate::device::{self, DeviceIdentity};
use crate::heuristics::{self, HeuristicClassifier};
use crate::isolation::HostCommands;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use report::{Finding, ScanDraft, ScanIssue, ScanReport, Severity};
pub use signature::{ClamScanner, SignatureOutcome, SignatureScanner};
pub use slot::{MountLease, MountSlot, SlotPermit};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("no storage partition found on {device}")]
    PartitionNotFound { device: PathBuf },
    #[error("failed to mount {partition}: {reason}")]
    MountFailed { partition: PathBuf, reason: String },
    #[error("scanner `{scanner}` unavailable: {reason}")]
    ScannerUnavailable { scanner: String, reason: String },
    #[error("scanner `{scanner}` timed out after {after:?}")]
    ScannerTimedOut { scanner: String, after: Duration },
    #[error("{stage} task failed: {reason}")]
    TaskFailed { stage: &'static str, reason: String },
    #[error("{device} could not be exposed for scanning: {reason}")]
    DeviceUnavailable { device: PathBuf, reason: String },
}

impl ScanError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PartitionNotFound { .. } => "partition_not_found",
            Self::MountFailed { .. } => "mount_failed",
            Self::ScannerUnavailable { .. } => "scanner_unavailable",
            Self::ScannerTimedOut { .. } => "scanner_timed_out",
            Self::TaskFailed { .. } => "task_failed",
            Self::DeviceUnavailable { .. } => "device_unavailable",
        }
    }
}

pub struct ScanOrchestrator {
    slot: MountSlot,
    host: Arc<dyn HostCommands>,
    scanner: Arc<dyn SignatureScanner>,
    classifier: Arc<HeuristicClassifier>,
    sysfs_root: PathBuf,
    scanner_timeout: Option<Duration>,
    fingerprint: bool,
}

impl ScanOrchestrator {
    pub fn new(
        config: &ScanConfig,
        sysfs_root: impl Into<PathBuf>,
        host: Arc<dyn HostCommands>,
        scanner: Arc<dyn SignatureScanner>,
    ) -> Self {
        Self {
            slot: MountSlot::new(config.mount_dir.clone()),
            host,
            scanner,
            classifier: Arc::new(HeuristicClassifier::from_config(config)),
            sysfs_root: sysfs_root.into(),
            scanner_timeout: config.scanner_timeout(),
            fingerprint: config.fingerprint_findings,
        }
    }

    /// Wait for the mount slot. Callers that need to observe queueing acquire first,
    /// then hand the permit to [`scan_with`](Self::scan_with).
    pub async fn acquire(&self) -> SlotPermit {
        self.slot.acquire().await
    }

    /// Incomplete report for a device that never reached the mount step
    pub fn unscanned(&self, permit: SlotPermit, identity: &DeviceIdentity, error: &ScanError) -> ScanReport {
        drop(permit);
        warn!(device = %identity.node.display(), error = %error, "scan skipped");
        let mut draft = ScanDraft::new(identity.clone());
        draft.issue(error);
        draft.finish()
    }

    pub async fn scan(&self, identity: &DeviceIdentity) -> ScanReport {
        let permit = self.acquire().await;
        self.scan_with(permit, identity).await
    }

    /// Scan while holding `permit`; the permit is released before this returns
    pub async fn scan_with(&self, permit: SlotPermit, identity: &DeviceIdentity) -> ScanReport {
        let mut draft = ScanDraft::new(identity.clone());

        let Some(partition) = device::first_partition(identity, &self.sysfs_root) else {
            let err = ScanError::PartitionNotFound {
                device: identity.node.clone(),
            };
            warn!(device = %identity.node.display(), error = %err, "scan skipped");
            draft.issue(&err);
            drop(permit);
            return draft.finish();
        };
        draft.partition = Some(partition.clone());

        let host = self.host.clone();
        let mounted = tokio::task::spawn_blocking(move || MountLease::establish(permit, host, &partition)).await;
        let lease = match mounted {
            Ok(Ok(lease)) => lease,
            Ok(Err(err)) => {
                warn!(device = %identity.node.display(), error = %err, "scan mount failed");
                draft.issue(&err);
                return draft.finish();
            }
            Err(join) => {
                draft.issue(&ScanError::TaskFailed {
                    stage: "mount",
                    reason: join.to_string(),
                });
                return draft.finish();
            }
        };
        let root = lease.root().to_path_buf();
        draft.mount_point = Some(root.clone());

        let outcome = self.run_signature_scan(&root).await;
        draft.malicious = outcome.findings;
        if let Some(err) = outcome.error {
            warn!(device = %identity.node.display(), error = %err, "signature scan degraded");
            draft.issue(&err);
        }

        let classifier = self.classifier.clone();
        let walk_root = root.clone();
        match tokio::task::spawn_blocking(move || classifier.classify(&walk_root)).await {
            Ok(c) => {
                draft.suspicious = c.findings;
                draft.total_files = c.total_files;
                draft.unreadable_files = c.unreadable_files;
            }
            Err(join) => draft.issue(&ScanError::TaskFailed {
                stage: "heuristics",
                reason: join.to_string(),
            }),
        }

        draft.dedup();
        if self.fingerprint {
            draft = fingerprint_findings(draft).await;
        }

        // Unmount off the async workers; the lease also unmounts if this task is torn down
        if let Err(join) = tokio::task::spawn_blocking(move || lease.release()).await {
            warn!(error = %join, "scan mount release task failed");
        }

        let report = draft.finish();
        info!(
            device = %identity.node.display(),
            total = report.total_files(),
            malicious = report.malicious().len(),
            suspicious = report.suspicious().len(),
            complete = report.is_complete(),
            "scan finished"
        );
        report
    }

    async fn run_signature_scan(&self, root: &std::path::Path) -> SignatureOutcome {
        let scan = self.scanner.scan_tree(root);
        match self.scanner_timeout {
            Some(after) => match tokio::time::timeout(after, scan).await {
                Ok(outcome) => outcome,
                Err(_) => SignatureOutcome::failed(ScanError::ScannerTimedOut {
                    scanner: self.scanner.name().to_string(),
                    after,
                }),
            },
            None => scan.await,
        }
    }
}

async fn fingerprint_findings(mut draft: ScanDraft) -> ScanDraft {
    let mut findings = std::mem::take(&mut draft.malicious);
    let split = findings.len();
    findings.append(&mut draft.suspicious);
    let hashed = tokio::task::spawn_blocking(move || {
        for f in findings.iter_mut() {
            f.sha256 = heuristics::fingerprint(&f.path);
        }
        findings
    })
    .await;
    match hashed {
        Ok(mut all) => {
            draft.suspicious = all.split_off(split);
            draft.malicious = all;
        }
        Err(join) => draft.issue(&ScanError::TaskFailed {
            stage: "fingerprint",
            reason: join.to_string(),
        }),
    }
    draft
}
