//! Append-only audit trail: one JSON object per lifecycle record, never rewritten.

use super::format::StructuredLogger;
use crate::device::DeviceIdentity;
use crate::monitor::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Entered,
    Failed,
    Abandoned,
    Removed,
    /// A udev event caused by our own authorization write; no session was opened
    Suppressed,
}

/// Lifecycle stage a record refers to. Mirrors the session states plus `scanned`,
/// written once the scan report exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detected,
    Isolated,
    Scanning,
    Scanned,
    AwaitingDecision,
    Authorized,
    CleanedAndAuthorized,
    Quarantined,
    Ejected,
    Rejected,
    Failed,
    Abandoned,
    Closed,
}

impl From<SessionState> for Stage {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Detected => Stage::Detected,
            SessionState::Isolated => Stage::Isolated,
            SessionState::Scanning => Stage::Scanning,
            SessionState::AwaitingDecision => Stage::AwaitingDecision,
            SessionState::Authorized => Stage::Authorized,
            SessionState::CleanedAndAuthorized => Stage::CleanedAndAuthorized,
            SessionState::Quarantined => Stage::Quarantined,
            SessionState::Ejected => Stage::Ejected,
            SessionState::Rejected => Stage::Rejected,
            SessionState::Failed => Stage::Failed,
            SessionState::Abandoned => Stage::Abandoned,
            SessionState::Closed => Stage::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    /// Absent for records not tied to a session (device removal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub device: DeviceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(event: AuditEvent, stage: Stage, device: &DeviceIdentity) -> Self {
        Self {
            event,
            stage,
            timestamp: Utc::now(),
            session_id: None,
            device: device.clone(),
            detail: None,
        }
    }

    pub fn session(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct AuditLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AuditLog {
    /// Open `path` for appending, creating it and its parent directory if needed
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(writer)),
        }
    }

    pub fn record(&self, record: &AuditRecord) -> io::Result<()> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit sink poisoned"))?;
        StructuredLogger::emit_json(record, &mut *sink)?;
        sink.flush()
    }
}

/// Parse an audit file back into records; malformed lines are skipped
pub fn read_records(path: &Path) -> io::Result<Vec<AuditRecord>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_event(&crate::device::tests::usb_disk_event("/dev/sdb")).unwrap()
    }

    #[test]
    fn records_append_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.ndjson");
        let id = Uuid::new_v4();

        let log = AuditLog::open(&path).unwrap();
        log.record(&AuditRecord::new(AuditEvent::Entered, Stage::Detected, &identity()).session(id))
            .unwrap();
        drop(log);
        let log = AuditLog::open(&path).unwrap();
        log.record(
            &AuditRecord::new(AuditEvent::Failed, Stage::Isolated, &identity())
                .session(id)
                .detail("no USB authorization control file found for /dev/sdb"),
        )
        .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, Stage::Detected);
        assert_eq!(records[1].event, AuditEvent::Failed);
        assert_eq!(records[1].session_id, Some(id));
        assert_eq!(records[1].device.vendor, "Kingston");
    }

    #[test]
    fn wire_names_are_snake_case() {
        let rec = AuditRecord::new(AuditEvent::Entered, Stage::AwaitingDecision, &identity());
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains(r#""event":"entered""#));
        assert!(line.contains(r#""stage":"awaiting_decision""#));
        assert!(!line.contains("session_id"));
    }
}
