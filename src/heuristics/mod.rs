//! Heuristic file classifier: one walk of a mounted tree, at most one suspicion per file.
//!
//! Rules in priority order (first match wins):
//! 1. `autorun.inf` (case-insensitive) -> "Autorun Script"
//! 2. extension in the suspicious set -> "Suspicious Extension"
//! 3. leading `.` -> "Hidden File"
//! 4. entropy >= threshold -> "High Entropy (x.xx)"

pub mod entropy;

use crate::config::ScanConfig;
use crate::scan::Finding;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const AUTORUN_FILE: &str = "autorun.inf";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("cannot read {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuspicionReason {
    AutorunScript,
    SuspiciousExtension,
    HiddenFile,
    HighEntropy(f64),
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutorunScript => write!(f, "Autorun Script"),
            Self::SuspiciousExtension => write!(f, "Suspicious Extension"),
            Self::HiddenFile => write!(f, "Hidden File"),
            Self::HighEntropy(e) => write!(f, "High Entropy ({e:.2})"),
        }
    }
}

/// Result of one classifier walk
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub findings: Vec<Finding>,
    /// Regular files seen, readable or not
    pub total_files: usize,
    /// Files whose content could not be read (counted, never flagged by content)
    pub unreadable_files: usize,
}

pub struct HeuristicClassifier {
    /// Lowercased, without the leading dot
    extensions: HashSet<String>,
    entropy_threshold: f64,
}

impl HeuristicClassifier {
    pub fn new<S: AsRef<str>>(extensions: &[S], entropy_threshold: f64) -> Self {
        let extensions = extensions
            .iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        Self {
            extensions,
            entropy_threshold,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(&config.suspicious_extensions, config.entropy_threshold)
    }

    pub fn classify(&self, root: &Path) -> Classification {
        let mut out = Classification::default();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    debug!(error = %err, "skipping unwalkable entry");
                    None
                }
            })
        {
            if !entry.file_type().is_file() {
                continue;
            }
            out.total_files += 1;
            match self.inspect(entry.path()) {
                Ok(Some(reason)) => out
                    .findings
                    .push(Finding::suspicious(entry.path(), reason.to_string())),
                Ok(None) => {}
                Err(err) => {
                    debug!(error = %err, "file skipped");
                    out.unreadable_files += 1;
                }
            }
        }
        out
    }

    /// First matching rule for one file; only the entropy rule touches file content
    pub fn inspect(&self, path: &Path) -> Result<Option<SuspicionReason>, ClassifierError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name.eq_ignore_ascii_case(AUTORUN_FILE) {
            return Ok(Some(SuspicionReason::AutorunScript));
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        if ext.is_some_and(|e| self.extensions.contains(&e)) {
            return Ok(Some(SuspicionReason::SuspiciousExtension));
        }
        if name.starts_with('.') {
            return Ok(Some(SuspicionReason::HiddenFile));
        }

        let histogram = entropy::file_histogram(path).map_err(|source| ClassifierError::FileUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let e = histogram.entropy();
        if !histogram.is_empty() && e >= self.entropy_threshold {
            return Ok(Some(SuspicionReason::HighEntropy(e)));
        }
        Ok(None)
    }
}

/// Hex SHA-256 of a file, streamed
pub fn fingerprint(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut h = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Some(format!("{:x}", h.finalize()))
}
