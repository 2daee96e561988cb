//! Device session: one pass of one device through the lifecycle.

use crate::decision::Decision;
use crate::device::DeviceIdentity;
use crate::isolation::IsolationHandle;
use crate::scan::ScanReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Detected,
    Isolated,
    Scanning,
    AwaitingDecision,
    Authorized,
    CleanedAndAuthorized,
    Quarantined,
    Ejected,
    Rejected,
    /// Isolation, scan, or the terminal action failed; device left isolated
    Failed,
    /// Interrupted by shutdown; device left isolated
    Abandoned,
    Closed,
}

impl SessionState {
    /// Outcome states; each leads only to `Closed`
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Authorized
                | Self::CleanedAndAuthorized
                | Self::Quarantined
                | Self::Ejected
                | Self::Rejected
                | Self::Failed
                | Self::Abandoned
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Detected, Isolated) => true,
            (Isolated, Scanning) => true,
            (Scanning, AwaitingDecision) => true,
            (
                AwaitingDecision,
                Authorized | CleanedAndAuthorized | Quarantined | Ejected | Rejected,
            ) => true,
            (Detected | Isolated | Scanning | AwaitingDecision, Failed | Abandoned) => true,
            (from, Closed) => from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageStamp {
    pub state: SessionState,
    pub at: DateTime<Utc>,
}

/// Owned exclusively by the coordinator; other components only borrow pieces of it
#[derive(Debug)]
pub struct DeviceSession {
    id: Uuid,
    identity: DeviceIdentity,
    state: SessionState,
    handle: Option<IsolationHandle>,
    report: Option<ScanReport>,
    decision: Option<Decision>,
    history: Vec<StageStamp>,
    failure: Option<String>,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            state: SessionState::Detected,
            handle: None,
            report: None,
            decision: None,
            history: vec![StageStamp {
                state: SessionState::Detected,
                at: Utc::now(),
            }],
            failure: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> Option<&IsolationHandle> {
        self.handle.as_ref()
    }

    pub fn report(&self) -> Option<&ScanReport> {
        self.report.as_ref()
    }

    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    pub fn history(&self) -> &[StageStamp] {
        &self.history
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Last non-closed state, i.e. how the session ended
    pub fn outcome(&self) -> SessionState {
        self.history
            .iter()
            .rev()
            .map(|s| s.state)
            .find(|s| *s != SessionState::Closed)
            .unwrap_or(self.state)
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(StageStamp {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn attach_handle(&mut self, handle: IsolationHandle) {
        self.handle = Some(handle);
    }

    pub fn attach_report(&mut self, report: ScanReport) {
        self.report = Some(report);
    }

    pub fn record_decision(&mut self, decision: Decision) {
        self.decision = Some(decision);
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
    }
}
