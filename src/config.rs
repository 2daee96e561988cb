//! Gatekeeper configuration. Loaded once at startup from JSON; every section falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "GUARD_MOUNT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Append-only audit log (newline-delimited JSON)
    pub audit_log: PathBuf,
    /// Event filtering and session policy
    pub monitor: MonitorConfig,
    /// Scan mount slot, external scanner and heuristics
    pub scan: ScanConfig,
    /// Bus authorization / unmount primitives
    pub isolation: IsolationConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// udev `DEVTYPE` values that open a session ("disk", "partition")
    pub trigger_device_types: Vec<String>,
    /// Only USB-attached block devices open a session
    pub require_usb: bool,
    /// Seconds to wait for a decision before rejecting; `None` waits forever
    pub decision_timeout_secs: Option<u64>,
    /// Seconds during which udev events caused by our own `authorized` writes are
    /// recognized and suppressed instead of opening a session
    pub reenumeration_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// The single read-only scan mount point
    pub mount_dir: PathBuf,
    pub scanner_program: String,
    pub scanner_args: Vec<String>,
    /// Seconds before the external scanner is killed; `None` disables the limit
    pub scanner_timeout_secs: Option<u64>,
    /// Bits per byte at or above which a file is flagged
    pub entropy_threshold: f64,
    /// Extensions (with leading dot) flagged as suspicious
    pub suspicious_extensions: Vec<String>,
    /// Attach a SHA-256 to every reported finding
    pub fingerprint_findings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Toggle the USB device's `authorized` control file
    Bus,
    /// Force-unmount any existing mounts and keep the device unmounted
    Unmount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub strategy: IsolationStrategy,
    /// Root of the sysfs tree (overridable for tests)
    pub sysfs_root: PathBuf,
    /// Where authorized devices are mounted under the unmount strategy
    pub access_dir: PathBuf,
    /// Parent levels walked from the block device looking for the USB device
    pub max_topology_depth: usize,
    /// Seconds to wait for the device node after re-authorization
    pub node_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            audit_log: PathBuf::from("/var/log/guard-mount/audit.ndjson"),
            monitor: MonitorConfig::default(),
            scan: ScanConfig::default(),
            isolation: IsolationConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            trigger_device_types: vec!["disk".to_string()],
            require_usb: true,
            decision_timeout_secs: Some(300),
            reenumeration_window_secs: 10,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mount_dir: PathBuf::from("/mnt/usb_guardian"),
            scanner_program: "clamscan".to_string(),
            scanner_args: vec![
                "-r".to_string(),
                "--no-summary".to_string(),
                "--infected".to_string(),
            ],
            scanner_timeout_secs: Some(900),
            entropy_threshold: 7.5,
            suspicious_extensions: [
                ".exe", ".bat", ".cmd", ".vbs", ".sh", ".ps1", ".scr", ".jar", ".docm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            fingerprint_findings: true,
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            strategy: IsolationStrategy::Bus,
            sysfs_root: PathBuf::from("/sys"),
            access_dir: PathBuf::from("/media/guard-mount"),
            max_topology_depth: 5,
            node_wait_secs: 5,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl MonitorConfig {
    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_secs.map(Duration::from_secs)
    }

    pub fn reenumeration_window(&self) -> Duration {
        Duration::from_secs(self.reenumeration_window_secs)
    }
}

impl ScanConfig {
    pub fn scanner_timeout(&self) -> Option<Duration> {
        self.scanner_timeout_secs.map(Duration::from_secs)
    }
}

impl GuardConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                if let Ok(c) = serde_json::from_str::<GuardConfig>(&data) {
                    return c;
                }
            }
        }
        Self::default()
    }

    /// Path named by `GUARD_MOUNT_CONFIG`, or `guard-mount.json` in the working directory
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("guard-mount.json"))
    }
}
