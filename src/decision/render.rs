//! Plain-text threat report shown before the operator chooses.

use super::Decision;
use crate::scan::{Finding, ScanReport};
use chrono::{DateTime, TimeZone};
use std::fmt::{Display, Write};

const RULE_WIDTH: usize = 50;

fn rule(out: &mut String) {
    let _ = writeln!(out, "{}", "─".repeat(RULE_WIDTH));
}

/// Overall verdict line for the header
pub fn classify_device(report: &ScanReport) -> &'static str {
    if !report.malicious().is_empty() {
        "Malicious Storage Device"
    } else if !report.suspicious().is_empty() {
        "Suspicious Storage Device"
    } else if !report.is_complete() {
        "Unverified Storage Device"
    } else {
        "No Threats Detected"
    }
}

fn list(out: &mut String, findings: &[Finding]) {
    if findings.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (i, f) in findings.iter().enumerate() {
        let path = f.path.display().to_string();
        let _ = writeln!(out, "  [{}] {:<50} ({})", i + 1, path, f.label);
    }
    let _ = writeln!(out);
}

pub fn render_report<Tz>(report: &ScanReport, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::new();
    let device = report.device();

    rule(&mut out);
    let _ = writeln!(out, "      Guard Mount - Threat Report");
    rule(&mut out);
    let _ = writeln!(out, "Date: {}", now.format("%a, %d %b %Y %H:%M:%S"));
    let _ = writeln!(out, "Device: {} ({})", device.node.display(), device.describe());
    let _ = writeln!(out, "Serial: {}", device.serial);
    if let Some(partition) = report.partition() {
        let _ = writeln!(out, "Partition: {}", partition.display());
    }
    let status = if report.is_complete() { "COMPLETED" } else { "INCOMPLETE" };
    let _ = writeln!(out, "Scan Status: {status}");
    let _ = writeln!(out, "Device Classification: {}", classify_device(report));
    let _ = writeln!(out);

    if !report.is_complete() {
        rule(&mut out);
        let _ = writeln!(out, "WARNING: the scan did not finish. Results below are partial.");
        for issue in report.issues() {
            let _ = writeln!(out, "  - {}", issue.message);
        }
        let _ = writeln!(out);
    }

    rule(&mut out);
    let _ = writeln!(out, "SCAN RESULTS:");
    let _ = writeln!(out);
    let _ = writeln!(out, "Clean Files: {}", report.clean_count());
    let _ = writeln!(out, "Suspicious Files: {}", report.suspicious().len());
    let _ = writeln!(out, "Malicious Files: {}", report.malicious().len());
    if report.unreadable_files() > 0 {
        let _ = writeln!(out, "Unreadable Files: {}", report.unreadable_files());
    }
    let _ = writeln!(out);

    rule(&mut out);
    let _ = writeln!(out, "MALICIOUS FILES DETECTED:");
    let _ = writeln!(out);
    list(&mut out, report.malicious());

    let _ = writeln!(out, "SUSPICIOUS FILES:");
    let _ = writeln!(out);
    list(&mut out, report.suspicious());

    rule(&mut out);
    let _ = writeln!(out, "Auto-Mount Blocked.");
    let _ = writeln!(out);
    let _ = writeln!(out, "Choose an action:");
    for d in Decision::ALL {
        let _ = writeln!(out, "  [{}] {}", d.key(), d.menu_label());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::scan::{ScanDraft, ScanError};
    use chrono::Utc;
    use std::path::PathBuf;

    fn draft() -> ScanDraft {
        let ev = crate::device::tests::usb_disk_event("/dev/sdb");
        let mut d = ScanDraft::new(DeviceIdentity::from_event(&ev).unwrap());
        d.partition = Some(PathBuf::from("/dev/sdb1"));
        d
    }

    #[test]
    fn report_lists_findings_and_menu() {
        let mut d = draft();
        d.total_files = 10;
        d.malicious.push(Finding::malicious("/mnt/usb_guardian/bad.exe", "Win.Trojan.Agent"));
        d.suspicious.push(Finding::suspicious("/mnt/usb_guardian/autorun.inf", "Autorun Script"));
        let text = render_report(&d.finish(), Utc::now());

        assert!(text.contains("Device: /dev/sdb (Kingston DataTraveler)"));
        assert!(text.contains("Scan Status: COMPLETED"));
        assert!(text.contains("Device Classification: Malicious Storage Device"));
        assert!(text.contains("Clean Files: 8"));
        assert!(text.contains("[1] /mnt/usb_guardian/bad.exe"));
        assert!(text.contains("(Autorun Script)"));
        for d in Decision::ALL {
            assert!(text.contains(&format!("[{}] {}", d.key(), d.menu_label())));
        }
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn incomplete_scan_is_called_out() {
        let mut d = draft();
        d.issue(&ScanError::MountFailed {
            partition: PathBuf::from("/dev/sdb1"),
            reason: "wrong fs type".into(),
        });
        let text = render_report(&d.finish(), Utc::now());
        assert!(text.contains("Scan Status: INCOMPLETE"));
        assert!(text.contains("WARNING: the scan did not finish"));
        assert!(text.contains("wrong fs type"));
        assert!(text.contains("Unverified Storage Device"));
    }
}
