//! Decision gateway: show the report, read one bounded choice, map it to an isolation action.
//!
//! Anything outside the five recognized choices is a `Reject`. Access is never granted
//! by default, on timeout, or when input is closed.

pub mod render;

use crate::isolation::{AccessMode, IsolationAction};
use crate::monitor::session::SessionState;
use crate::scan::ScanReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ReadOnlyAccess,
    CleanAndMount,
    Quarantine,
    Eject,
    Reject,
}

/// Where a decision leads: the session's terminal state and the isolation action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    pub state: SessionState,
    pub action: IsolationAction,
}

impl Decision {
    /// Menu order
    pub const ALL: [Decision; 5] = [
        Decision::ReadOnlyAccess,
        Decision::CleanAndMount,
        Decision::Quarantine,
        Decision::Eject,
        Decision::Reject,
    ];

    /// The single decision -> (state, action) table.
    ///
    /// `CleanAndMount` authorizes read-only like `ReadOnlyAccess`: files are not removed.
    pub fn disposition(self) -> Disposition {
        let (state, action) = match self {
            Decision::ReadOnlyAccess => (
                SessionState::Authorized,
                IsolationAction::Authorize(AccessMode::ReadOnly),
            ),
            Decision::CleanAndMount => (
                SessionState::CleanedAndAuthorized,
                IsolationAction::Authorize(AccessMode::ReadOnly),
            ),
            Decision::Quarantine => (SessionState::Quarantined, IsolationAction::Quarantine),
            Decision::Eject => (SessionState::Ejected, IsolationAction::Eject),
            Decision::Reject => (SessionState::Rejected, IsolationAction::KeepIsolated),
        };
        Disposition { state, action }
    }

    pub fn key(self) -> &'static str {
        match self {
            Decision::ReadOnlyAccess => "1",
            Decision::CleanAndMount => "2",
            Decision::Quarantine => "3",
            Decision::Eject => "4",
            Decision::Reject => "5",
        }
    }

    pub fn menu_label(self) -> &'static str {
        match self {
            Decision::ReadOnlyAccess => "Allow Access (mount as read-only)",
            Decision::CleanAndMount => "Clean and Mount (read-only; files are not removed)",
            Decision::Quarantine => "Quarantine Entire Drive",
            Decision::Eject => "Eject Device",
            Decision::Reject => "Reject (keep blocked)",
        }
    }

    /// Recognized input: the menu key or the decision's name
    pub fn parse(input: &str) -> Option<Decision> {
        let normalized = input.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        let decision = match normalized.as_str() {
            "1" | "readonly" | "readonlyaccess" | "allow" => Decision::ReadOnlyAccess,
            "2" | "clean" | "cleanandmount" => Decision::CleanAndMount,
            "3" | "quarantine" => Decision::Quarantine,
            "4" | "eject" => Decision::Eject,
            "5" | "reject" => Decision::Reject,
            _ => return None,
        };
        Some(decision)
    }

    /// Fail-closed: unrecognized or empty input is a rejection
    pub fn from_input(input: &str) -> Decision {
        Self::parse(input).unwrap_or(Decision::Reject)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::ReadOnlyAccess => "read_only_access",
            Decision::CleanAndMount => "clean_and_mount",
            Decision::Quarantine => "quarantine",
            Decision::Eject => "eject",
            Decision::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// Renders reports to `output` and waits on `input` lines for a choice
pub struct DecisionGateway {
    input: mpsc::UnboundedReceiver<String>,
    output: Box<dyn Write + Send>,
    timeout: Option<Duration>,
}

impl DecisionGateway {
    pub fn new(
        input: mpsc::UnboundedReceiver<String>,
        output: Box<dyn Write + Send>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            input,
            output,
            timeout,
        }
    }

    /// Terminal gateway: stdout for the report, a reader thread feeding stdin lines
    pub fn terminal(timeout: Option<Duration>) -> Self {
        Self::new(stdin_lines(), Box::new(std::io::stdout()), timeout)
    }

    pub async fn present(&mut self, report: &ScanReport) -> Decision {
        // Only a line typed after this report is shown may decide for it
        let mut stale = 0usize;
        while self.input.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            warn!(device = %report.device().node.display(), lines = stale, "discarding input typed before the report was shown");
        }

        let text = render::render_report(report, chrono::Local::now());
        self.write(&text);
        self.write("\nYour choice: ");

        let line = match self.timeout {
            Some(after) => match tokio::time::timeout(after, self.input.recv()).await {
                Ok(line) => line,
                Err(_) => {
                    warn!(device = %report.device().node.display(), ?after, "decision timed out; rejecting");
                    self.write("\nNo decision received in time. Device stays blocked.\n");
                    return Decision::Reject;
                }
            },
            None => self.input.recv().await,
        };

        let decision = match line {
            Some(line) => Decision::parse(&line).unwrap_or_else(|| {
                warn!(input = %line.trim(), "unrecognized decision; rejecting");
                Decision::Reject
            }),
            None => {
                warn!("decision input closed; rejecting");
                Decision::Reject
            }
        };
        info!(device = %report.device().node.display(), %decision, "decision recorded");
        self.write(&format!("\nYou selected: {}\n", decision.menu_label()));
        decision
    }

    fn write(&mut self, text: &str) {
        let result = self
            .output
            .write_all(text.as_bytes())
            .and_then(|_| self.output.flush());
        if let Err(e) = result {
            warn!(error = %e, "cannot write decision prompt");
        }
    }
}

/// Forward stdin lines into a channel from a dedicated thread
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
