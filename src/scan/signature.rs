//! External signature scanner. The engine is opaque: it walks a tree and reports
//! `<path>: <label> FOUND` lines, which become malicious findings.

use super::{Finding, ScanError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// What the scanner reported; `error` is set when the run did not complete cleanly
#[derive(Debug, Default)]
pub struct SignatureOutcome {
    pub findings: Vec<Finding>,
    pub error: Option<ScanError>,
}

impl SignatureOutcome {
    pub fn found(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            error: None,
        }
    }

    pub fn failed(error: ScanError) -> Self {
        Self {
            findings: Vec::new(),
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait SignatureScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Scan a directory tree. Must be cancel-safe: dropping the future stops the scan.
    async fn scan_tree(&self, root: &Path) -> SignatureOutcome;
}

/// Parse scanner output; only lines ending in `FOUND` are kept
pub fn parse_found_lines(output: &str) -> Vec<Finding> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let head = line.strip_suffix("FOUND")?.trim_end();
            match head.rsplit_once(": ") {
                Some((path, label)) if !path.is_empty() => {
                    Some(Finding::malicious(path.trim(), label.trim()))
                }
                _ => {
                    debug!(line, "unparseable FOUND line");
                    None
                }
            }
        })
        .collect()
}

/// `clamscan` as a subprocess. Exit 0 = clean, 1 = infections found, anything else = error.
pub struct ClamScanner {
    program: String,
    args: Vec<String>,
}

impl ClamScanner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SignatureScanner for ClamScanner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn scan_tree(&self, root: &Path) -> SignatureOutcome {
        debug!(scanner = %self.program, root = %root.display(), "starting signature scan");
        let output = match Command::new(&self.program)
            .args(&self.args)
            .arg(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                return SignatureOutcome::failed(ScanError::ScannerUnavailable {
                    scanner: self.program.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let findings = parse_found_lines(&stdout);
        match output.status.code() {
            Some(0) | Some(1) => SignatureOutcome::found(findings),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(scanner = %self.program, status = %output.status, "signature scan did not complete");
                SignatureOutcome {
                    findings,
                    error: Some(ScanError::ScannerUnavailable {
                        scanner: self.program.clone(),
                        reason: format!("{}: {}", output.status, stderr.trim()),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_found_lines_only() {
        let out = "\
/mnt/usb_guardian/bad.exe: Win.Trojan.Agent-1 FOUND
/mnt/usb_guardian/readme.txt: OK
/mnt/usb_guardian/dir: with colon/evil.vbs: VBS.Dropper FOUND
LibClamAV Warning: something FOUNDational
";
        let f = parse_found_lines(out);
        assert_eq!(f.len(), 2);
        assert_eq!(f[0].path, PathBuf::from("/mnt/usb_guardian/bad.exe"));
        assert_eq!(f[0].label, "Win.Trojan.Agent-1");
        assert_eq!(f[1].path, PathBuf::from("/mnt/usb_guardian/dir: with colon/evil.vbs"));
        assert_eq!(f[1].label, "VBS.Dropper");
    }

    #[test]
    fn found_without_separator_is_skipped() {
        assert!(parse_found_lines("nothing FOUND").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let s = ClamScanner::new("/nonexistent/clamscan", vec![]);
        let out = s.scan_tree(Path::new("/tmp")).await;
        assert!(out.findings.is_empty());
        assert!(matches!(out.error, Some(ScanError::ScannerUnavailable { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_one_with_found_lines_is_complete() {
        let s = ClamScanner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo \"$0/x.exe: Eicar-Signature FOUND\"; exit 1".to_string(),
            ],
        );
        let out = s.scan_tree(Path::new("/mnt/slot")).await;
        assert!(out.error.is_none());
        assert_eq!(out.findings[0].path, PathBuf::from("/mnt/slot/x.exe"));
    }
}
