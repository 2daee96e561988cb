//! Findings and the immutable scan report.

use super::ScanError;
use crate::device::DeviceIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Reported by the signature scanner
    Malicious,
    /// Raised by the heuristic classifier
    Suspicious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Absolute, rooted at the scan mount point
    pub path: PathBuf,
    pub label: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Finding {
    pub fn malicious(path: impl AsRef<Path>, label: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            label: label.into(),
            severity: Severity::Malicious,
            sha256: None,
        }
    }

    pub fn suspicious(path: impl AsRef<Path>, label: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            label: label.into(),
            severity: Severity::Suspicious,
            sha256: None,
        }
    }
}

/// A degraded stage of the scan, surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub code: String,
    pub message: String,
}

impl From<&ScanError> for ScanIssue {
    fn from(e: &ScanError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Mutable accumulator used while a scan is running
#[derive(Debug, Clone)]
pub struct ScanDraft {
    pub device: DeviceIdentity,
    pub partition: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub malicious: Vec<Finding>,
    pub suspicious: Vec<Finding>,
    pub total_files: usize,
    pub unreadable_files: usize,
    pub issues: Vec<ScanIssue>,
    pub started_at: DateTime<Utc>,
}

impl ScanDraft {
    pub fn new(device: DeviceIdentity) -> Self {
        Self {
            device,
            partition: None,
            mount_point: None,
            malicious: Vec::new(),
            suspicious: Vec::new(),
            total_files: 0,
            unreadable_files: 0,
            issues: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn issue(&mut self, error: &ScanError) {
        self.issues.push(error.into());
    }

    /// One entry per path: malicious first, a path already malicious is dropped from suspicious
    pub fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.malicious.retain(|f| seen.insert(f.path.clone()));
        self.suspicious.retain(|f| seen.insert(f.path.clone()));
    }

    pub fn finish(mut self) -> ScanReport {
        self.dedup();
        let flagged = self.malicious.len() + self.suspicious.len();
        // Scanner hits outside the walked tree still count as files
        let total_files = self.total_files.max(flagged);
        ScanReport {
            device: self.device,
            partition: self.partition,
            mount_point: self.mount_point,
            clean_count: total_files - flagged,
            malicious: self.malicious,
            suspicious: self.suspicious,
            total_files,
            unreadable_files: self.unreadable_files,
            issues: self.issues,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Outcome of one device scan; immutable once produced.
///
/// `clean_count == total_files - malicious.len() - suspicious.len()` and no path
/// appears in both lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    device: DeviceIdentity,
    partition: Option<PathBuf>,
    mount_point: Option<PathBuf>,
    malicious: Vec<Finding>,
    suspicious: Vec<Finding>,
    clean_count: usize,
    total_files: usize,
    unreadable_files: usize,
    issues: Vec<ScanIssue>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl ScanReport {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn partition(&self) -> Option<&Path> {
        self.partition.as_deref()
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn malicious(&self) -> &[Finding] {
        &self.malicious
    }

    pub fn suspicious(&self) -> &[Finding] {
        &self.suspicious
    }

    pub fn clean_count(&self) -> usize {
        self.clean_count
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    pub fn unreadable_files(&self) -> usize {
        self.unreadable_files
    }

    pub fn issues(&self) -> &[ScanIssue] {
        &self.issues
    }

    /// False when any stage degraded; the operator must be told
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}
