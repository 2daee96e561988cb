//! Lifecycle coordinator: consumes device events and drives each device through
//! detect -> isolate -> scan -> decide -> authorize/quarantine.
//!
//! Isolation runs in the event loop, so devices are isolated in arrival order. Everything
//! after isolation runs in one task per session. The scan mount slot admits one session
//! at a time; queued sessions stay `Isolated`. The decision prompt is entered only after
//! the slot is released.
//!
//! Under bus isolation the device is re-authorized read-only for the scan while the
//! slot is held, and deauthorized again before the prompt. The udev events those
//! writes cause are recognized by [`reenumeration::ExpectedEvents`].

pub mod reenumeration;
pub mod session;

use crate::decision::{Decision, DecisionGateway, Disposition};
use crate::device::{DeviceAction, DeviceEvent, DeviceIdentity, TriggerPolicy};
use crate::isolation::{IsolationAction, IsolationController, IsolationHandle, ScanExposure};
use crate::logging::{AuditEvent, AuditLog, AuditRecord, Stage};
use crate::scan::{ScanError, ScanOrchestrator};
use reenumeration::ExpectedEvents;
use session::{DeviceSession, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use session::{StageStamp, TransitionError};

pub struct Coordinator {
    policy: TriggerPolicy,
    isolation: Arc<IsolationController>,
    orchestrator: Arc<ScanOrchestrator>,
    gateway: Mutex<DecisionGateway>,
    audit: AuditLog,
    expected: ExpectedEvents,
}

/// Resolves once shutdown is requested; never resolves if the sender is gone without requesting it
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Coordinator {
    pub fn new(
        policy: TriggerPolicy,
        isolation: Arc<IsolationController>,
        orchestrator: Arc<ScanOrchestrator>,
        gateway: DecisionGateway,
        audit: AuditLog,
    ) -> Self {
        Self {
            policy,
            isolation,
            orchestrator,
            gateway: Mutex::new(gateway),
            audit,
            expected: ExpectedEvents::default(),
        }
    }

    /// How long an event caused by our own `authorized` write is recognized
    pub fn with_reenumeration_window(mut self, window: Duration) -> Self {
        self.expected = ExpectedEvents::new(window);
        self
    }

    /// Consume events until the channel closes or shutdown is requested, then wait for
    /// every session to close. Returns the closed sessions for audit history.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<DeviceSession> {
        let mut tasks: JoinSet<DeviceSession> = JoinSet::new();
        let mut closed = Vec::new();
        info!("monitoring block device events");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("shutdown requested; no new devices accepted");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    collect(joined, &mut closed);
                    continue;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Some(session) = self.admit(event).await {
                if session.state() == SessionState::Isolated {
                    tasks.spawn(self.clone().drive(session, shutdown.clone()));
                } else {
                    closed.push(session);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut closed);
        }
        info!(sessions = closed.len(), "monitoring stopped");
        closed
    }

    /// Filter an event, open a session and isolate the device.
    /// Returns `None` for events that do not open a session.
    pub async fn admit(&self, event: DeviceEvent) -> Option<DeviceSession> {
        if event.action == DeviceAction::Remove {
            self.observe_removal(&event);
            return None;
        }
        if !self.policy.matches(&event) {
            debug!(action = event.action.as_str(), node = ?event.device_node, "event ignored");
            return None;
        }
        if self.expected.take(&event) {
            self.suppress(&event, "re-enumerated after authorization");
            return None;
        }
        let identity = DeviceIdentity::from_event(&event)?;

        let mut session = DeviceSession::new(identity);
        info!(
            session = %session.id(),
            device = %session.identity().node.display(),
            vendor = %session.identity().vendor,
            model = %session.identity().model,
            serial = %session.identity().serial,
            "new USB storage device detected"
        );
        self.audit(&session, AuditEvent::Entered, Stage::Detected, None);

        let isolation = self.isolation.clone();
        let identity = session.identity().clone();
        let isolated = tokio::task::spawn_blocking(move || isolation.isolate(&identity))
            .await
            .map_err(|join| join.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match isolated {
            Ok(handle) => {
                self.expect(DeviceAction::Remove, &handle);
                session.attach_handle(handle);
                self.enter(&mut session, SessionState::Isolated, None);
            }
            Err(reason) => {
                // Never scanned, never authorized
                self.fail(&mut session, Stage::Isolated, reason);
            }
        }
        Some(session)
    }

    /// Drive an isolated session to `Closed`
    pub async fn drive(
        self: Arc<Self>,
        mut session: DeviceSession,
        mut shutdown: watch::Receiver<bool>,
    ) -> DeviceSession {
        let permit = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => None,
            permit = self.orchestrator.acquire() => Some(permit),
        };
        let Some(permit) = permit else {
            self.abandon(&mut session, "shutdown while queued for scan");
            return session;
        };

        self.enter(&mut session, SessionState::Scanning, None);
        // Not cancelled on shutdown: the scan always unmounts and re-isolates before returning
        let report = match self.expose(&session).await {
            Ok(exposure) => {
                let report = self.orchestrator.scan_with(permit, session.identity()).await;
                if let Err(reason) = self.conceal(&session, exposure).await {
                    session.attach_report(report);
                    self.fail(&mut session, Stage::Scanned, reason);
                    return session;
                }
                report
            }
            Err(reason) => {
                let err = ScanError::DeviceUnavailable {
                    device: session.identity().node.clone(),
                    reason,
                };
                self.orchestrator.unscanned(permit, session.identity(), &err)
            }
        };
        let summary = format!(
            "malicious={} suspicious={} clean={} complete={}",
            report.malicious().len(),
            report.suspicious().len(),
            report.clean_count(),
            report.is_complete()
        );
        self.audit(&session, AuditEvent::Entered, Stage::Scanned, Some(summary));
        session.attach_report(report);

        if *shutdown.borrow() {
            self.abandon(&mut session, "shutdown after scan");
            return session;
        }
        self.enter(&mut session, SessionState::AwaitingDecision, None);

        let chosen = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => None,
            decision = self.decide(&session) => Some(decision),
        };
        let Some(decision) = chosen else {
            self.abandon(&mut session, "shutdown while awaiting decision");
            return session;
        };
        session.record_decision(decision);
        self.conclude(&mut session, decision).await;
        session
    }

    /// Re-authorize a bus-isolated device for the scan. The slot is already held.
    async fn expose(&self, session: &DeviceSession) -> Result<ScanExposure, String> {
        let Some(handle) = session.handle().cloned() else {
            return Err("session has no isolation handle".to_string());
        };
        self.expect(DeviceAction::Add, &handle);
        let isolation = self.isolation.clone();
        tokio::task::spawn_blocking(move || isolation.expose_for_scan(&handle))
            .await
            .map_err(|join| join.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()))
    }

    async fn conceal(&self, session: &DeviceSession, exposure: ScanExposure) -> Result<(), String> {
        if !exposure.is_active() {
            return Ok(());
        }
        if let Some(handle) = session.handle() {
            self.expect(DeviceAction::Remove, handle);
        }
        tokio::task::spawn_blocking(move || exposure.conceal())
            .await
            .map_err(|join| join.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()))
    }

    /// Holds the gateway for one prompt at a time; a session without a report is rejected
    async fn decide(&self, session: &DeviceSession) -> Decision {
        let Some(report) = session.report() else {
            return Decision::Reject;
        };
        let mut gateway = self.gateway.lock().await;
        gateway.present(report).await
    }

    async fn conclude(&self, session: &mut DeviceSession, decision: Decision) {
        let Disposition { state, action } = decision.disposition();
        let Some(handle) = session.handle().cloned() else {
            self.fail(session, state.into(), "session has no isolation handle".to_string());
            return;
        };

        if matches!(action, IsolationAction::Authorize(_)) {
            self.expect(DeviceAction::Add, &handle);
        }
        let isolation = self.isolation.clone();
        let identity = session.identity().clone();
        let applied = tokio::task::spawn_blocking(move || isolation.apply(&identity, &handle, action))
            .await
            .map_err(|join| join.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match applied {
            Ok(()) => {
                self.enter(session, state, Some(decision.to_string()));
                self.close(session);
            }
            Err(reason) => self.fail(session, state.into(), reason),
        }
    }

    fn observe_removal(&self, event: &DeviceEvent) {
        let relevant = event.is_usb() && self.policy.device_types.iter().any(|t| *t == event.device_type);
        if !relevant {
            return;
        }
        if self.expected.take(event) {
            self.suppress(event, "unbound by deauthorization");
            return;
        }
        let Some(identity) = DeviceIdentity::from_event(event) else {
            return;
        };
        info!(device = %identity.node.display(), "device removed");
        self.write(AuditRecord::new(AuditEvent::Removed, Stage::Detected, &identity));
    }

    fn suppress(&self, event: &DeviceEvent, detail: &str) {
        let Some(identity) = DeviceIdentity::from_event(event) else {
            return;
        };
        debug!(action = event.action.as_str(), device = %identity.node.display(), detail, "own re-enumeration event");
        self.write(AuditRecord::new(AuditEvent::Suppressed, Stage::Detected, &identity).detail(detail));
    }

    fn expect(&self, action: DeviceAction, handle: &IsolationHandle) {
        if let Some(devpath) = self.isolation.usb_devpath(handle) {
            self.expected.expect(action, devpath);
        }
    }

    fn enter(&self, session: &mut DeviceSession, next: SessionState, detail: Option<String>) {
        match session.advance(next) {
            Ok(()) => {
                info!(session = %session.id(), device = %session.identity().node.display(), stage = ?next, "stage entered");
                self.audit(session, AuditEvent::Entered, next.into(), detail);
            }
            Err(e) => error!(session = %session.id(), error = %e, "lifecycle violation"),
        }
    }

    /// Record a failure at `stage`, leave the device isolated and close the session
    fn fail(&self, session: &mut DeviceSession, stage: Stage, reason: String) {
        warn!(
            session = %session.id(),
            device = %session.identity().node.display(),
            ?stage,
            error = %reason,
            "device left isolated after failure"
        );
        self.audit(session, AuditEvent::Failed, stage, Some(reason.clone()));
        session.record_failure(reason);
        if let Err(e) = session.advance(SessionState::Failed) {
            error!(session = %session.id(), error = %e, "lifecycle violation");
        }
        self.close(session);
    }

    fn abandon(&self, session: &mut DeviceSession, reason: &str) {
        info!(session = %session.id(), device = %session.identity().node.display(), reason, "session abandoned; device left isolated");
        self.audit(session, AuditEvent::Abandoned, session.state().into(), Some(reason.to_string()));
        if let Err(e) = session.advance(SessionState::Abandoned) {
            error!(session = %session.id(), error = %e, "lifecycle violation");
        }
        self.close(session);
    }

    fn close(&self, session: &mut DeviceSession) {
        self.enter(session, SessionState::Closed, None);
    }

    fn audit(&self, session: &DeviceSession, event: AuditEvent, stage: Stage, detail: Option<String>) {
        let mut record = AuditRecord::new(event, stage, session.identity()).session(session.id());
        record.detail = detail;
        self.write(record);
    }

    fn write(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record) {
            warn!(error = %e, stage = ?record.stage, "audit write failed");
        }
    }
}

fn collect(joined: Result<DeviceSession, tokio::task::JoinError>, closed: &mut Vec<DeviceSession>) {
    match joined {
        Ok(session) => closed.push(session),
        Err(e) => error!(error = %e, "session task failed"),
    }
}
