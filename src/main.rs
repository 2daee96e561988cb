//! Guard Mount entrypoint: watch udev for USB storage, isolate, scan, and ask before mounting.

use guard_mount::{
    config::GuardConfig,
    decision::DecisionGateway,
    device::{udev::UdevMonitor, TriggerPolicy},
    isolation::{IsolationController, SystemCommands},
    logging::{AuditLog, StructuredLogger},
    monitor::Coordinator,
    scan::{ClamScanner, ScanOrchestrator},
    SessionState,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const EVENT_QUEUE: usize = 64;

fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = GuardConfig::load(&GuardConfig::default_path());

    StructuredLogger::init(config.log.json, &config.log.level);

    info!(
        mount_dir = ?config.scan.mount_dir,
        strategy = ?config.isolation.strategy,
        audit_log = ?config.audit_log,
        "guard-mount starting"
    );
    if !running_as_root() {
        warn!("not running as root; isolation and mounting will likely fail and devices stay blocked");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: GuardConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let host = Arc::new(SystemCommands);
    let isolation = Arc::new(IsolationController::new(&config.isolation, host.clone()));
    let scanner = Arc::new(ClamScanner::new(
        config.scan.scanner_program.clone(),
        config.scan.scanner_args.clone(),
    ));
    let orchestrator = Arc::new(ScanOrchestrator::new(
        &config.scan,
        config.isolation.sysfs_root.clone(),
        host,
        scanner,
    ));
    let audit = AuditLog::open(&config.audit_log)?;
    let gateway = DecisionGateway::terminal(config.monitor.decision_timeout());
    let coordinator = Arc::new(Coordinator::new(
        TriggerPolicy::new(&config.monitor),
        isolation,
        orchestrator,
        gateway,
        audit,
    )
    .with_reenumeration_window(config.monitor.reenumeration_window()));

    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let source_stop = stop_rx.clone();
    let source = tokio::spawn(async move { UdevMonitor::default().run(event_tx, source_stop).await });

    let sessions = coordinator.run(event_rx, stop_rx).await;
    let failed = sessions
        .iter()
        .filter(|s| s.outcome() == SessionState::Failed)
        .count();
    info!(sessions = sessions.len(), failed, "guard-mount stopping");

    match source.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
