//! Integration test: full device lifecycle against fake host commands and a fake scanner.

use async_trait::async_trait;
use guard_mount::{
    config::{GuardConfig, IsolationStrategy},
    decision::{Decision, DecisionGateway},
    device::{DeviceAction, DeviceEvent, TriggerPolicy},
    isolation::{AccessMode, HostCommands, IsolationController, IsolationError},
    logging::{audit::read_records, AuditEvent, AuditLog, Stage},
    monitor::Coordinator,
    scan::{Finding, ScanOrchestrator, SignatureOutcome, SignatureScanner},
    DeviceSession, SessionState,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

/// What the kernel does when a USB device's `authorized` file is written: the block
/// node disappears or comes back, and udev reports a remove or an add
struct Kernel {
    device: DeviceEvent,
    udev: Option<mpsc::Sender<DeviceEvent>>,
}

/// Mounting the slot copies the device's fixture tree in; unmounting empties it
#[derive(Default)]
struct FakeHost {
    slot: PathBuf,
    fixtures: HashMap<PathBuf, PathBuf>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    kernel: Mutex<Option<Kernel>>,
    fail_access_mount: AtomicBool,
    fail_power_off: AtomicBool,
    access_mounts: AtomicUsize,
}

impl FakeHost {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn attach_kernel(&self, device: DeviceEvent, udev: Option<mpsc::Sender<DeviceEvent>>) {
        *self.kernel.lock().unwrap() = Some(Kernel { device, udev });
    }

    fn detach_kernel(&self) {
        self.kernel.lock().unwrap().take();
    }
}

fn refused(command: &str) -> IsolationError {
    IsolationError::CommandFailed {
        command: command.to_string(),
        detail: "refused by test host".to_string(),
    }
}

impl HostCommands for FakeHost {
    fn mount_points(&self, _node: &Path) -> Result<Vec<PathBuf>, IsolationError> {
        Ok(Vec::new())
    }

    fn mount(&self, node: &Path, target: &Path, mode: AccessMode) -> Result<(), IsolationError> {
        self.record(format!("mount {} {} {:?}", node.display(), target.display(), mode));
        if !node.exists() {
            return Err(IsolationError::CommandFailed {
                command: "mount".to_string(),
                detail: format!("special device {} does not exist", node.display()),
            });
        }
        if target != self.slot {
            if self.fail_access_mount.load(Ordering::SeqCst) {
                return Err(refused("mount"));
            }
            self.access_mounts.fetch_add(1, Ordering::SeqCst);
        }
        if target == self.slot {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(src) = self.fixtures.get(node) {
                for entry in std::fs::read_dir(src).unwrap() {
                    let entry = entry.unwrap();
                    std::fs::copy(entry.path(), target.join(entry.file_name())).unwrap();
                }
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), IsolationError> {
        self.record(format!("umount {}", target.display()));
        if target == self.slot {
            for entry in std::fs::read_dir(target).unwrap() {
                std::fs::remove_file(entry.unwrap().path()).unwrap();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_read_only(&self, node: &Path) -> Result<(), IsolationError> {
        self.record(format!("setro {}", node.display()));
        Ok(())
    }

    fn power_off(&self, node: &Path) -> Result<(), IsolationError> {
        self.record(format!("power-off {}", node.display()));
        if self.fail_power_off.load(Ordering::SeqCst) {
            return Err(refused("udisksctl"));
        }
        Ok(())
    }

    fn set_authorized(&self, control: &Path, authorized: bool) -> Result<(), IsolationError> {
        std::fs::write(control, if authorized { "1\n" } else { "0\n" }).map_err(|source| {
            IsolationError::ControlFile {
                path: control.to_path_buf(),
                source,
            }
        })?;
        self.record(format!("authorized {}", u8::from(authorized)));
        if let Some(kernel) = self.kernel.lock().unwrap().as_ref() {
            let node = kernel.device.device_node.clone().unwrap();
            let mut event = kernel.device.clone();
            if authorized {
                std::fs::write(&node, b"").unwrap();
                event.action = DeviceAction::Add;
            } else {
                let _ = std::fs::remove_file(&node);
                event.action = DeviceAction::Remove;
            }
            if let Some(udev) = &kernel.udev {
                udev.try_send(event).unwrap();
            }
        }
        Ok(())
    }
}

/// Flags files by name after an optional delay
#[derive(Default)]
struct FakeScanner {
    verdicts: HashMap<String, String>,
    delay: Duration,
    started: Arc<Notify>,
}

#[async_trait]
impl SignatureScanner for FakeScanner {
    fn name(&self) -> &str {
        "fake-av"
    }

    async fn scan_tree(&self, root: &Path) -> SignatureOutcome {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        let mut findings = Vec::new();
        for entry in std::fs::read_dir(root).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(label) = self.verdicts.get(&name) {
                findings.push(Finding::malicious(entry.path(), label.clone()));
            }
        }
        SignatureOutcome::found(findings)
    }
}

/// Terminal stand-in: types the next scripted answer only once a prompt is shown
struct Operator {
    answers: Arc<Mutex<VecDeque<String>>>,
    keyboard: mpsc::UnboundedSender<String>,
}

impl Write for Operator {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.ends_with(b"Your choice: ") {
            if let Some(answer) = self.answers.lock().unwrap().pop_front() {
                let _ = self.keyboard.send(answer);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    host: Arc<FakeHost>,
    audit_path: PathBuf,
    /// Raw keyboard: lines sent here are typed whether or not a prompt is showing
    input: mpsc::UnboundedSender<String>,
    answers: Arc<Mutex<VecDeque<String>>>,
    coordinator: Arc<Coordinator>,
}

impl Harness {
    fn records(&self) -> Vec<guard_mount::logging::AuditRecord> {
        read_records(&self.audit_path).unwrap()
    }

    fn node(&self, name: &str) -> PathBuf {
        self.dir.path().join("dev").join(name)
    }

    fn answer(&self, decisions: &[&str]) {
        self.answers
            .lock()
            .unwrap()
            .extend(decisions.iter().map(|d| d.to_string()));
    }

    /// Sysfs tree for one USB stick on port 1-1 holding `disk`/`part`.
    /// Returns the `authorized` file and the partition's `DEVPATH`.
    #[cfg(unix)]
    fn usb_topology(&self, disk: &str, part: &str) -> (PathBuf, String) {
        const SCSI: &str = "devices/pci0000:00/usb1/1-1/1-1:1.0/host0/target0:0:0/0:0:0:0";
        let sys = self.dir.path().join("sys");
        let block = sys.join(SCSI).join("block").join(disk);
        std::fs::create_dir_all(block.join(part)).unwrap();
        std::fs::write(block.join(part).join("partition"), "1\n").unwrap();
        std::os::unix::fs::symlink(sys.join(SCSI), block.join("device")).unwrap();
        let authorized = sys.join("devices/pci0000:00/usb1/1-1/authorized");
        std::fs::write(&authorized, "1\n").unwrap();
        (authorized, format!("/{SCSI}/block/{disk}/{part}"))
    }

    async fn run(&self, events: Vec<DeviceEvent>, decisions: &[&str]) -> Vec<DeviceSession> {
        self.answer(decisions);
        let (tx, rx) = mpsc::channel(16);
        for ev in events {
            tx.send(ev).await.unwrap();
        }
        drop(tx);
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.coordinator.clone().run(rx, stop_rx).await
    }
}

fn usb_partition(node: &Path, devpath: Option<&str>) -> DeviceEvent {
    let mut properties = BTreeMap::new();
    properties.insert("ID_BUS".to_string(), "usb".to_string());
    properties.insert("ID_VENDOR".to_string(), "SanDisk".to_string());
    properties.insert("ID_MODEL".to_string(), "Cruzer".to_string());
    properties.insert("ID_SERIAL_SHORT".to_string(), "4C530001".to_string());
    properties.insert("ID_FS_TYPE".to_string(), "vfat".to_string());
    if let Some(devpath) = devpath {
        properties.insert("DEVPATH".to_string(), devpath.to_string());
    }
    DeviceEvent {
        action: DeviceAction::Add,
        device_node: Some(node.to_path_buf()),
        subsystem: "block".to_string(),
        device_type: "partition".to_string(),
        properties,
    }
}

/// `fixtures` maps a node name (`sdb1`) to the files on that device
fn harness(
    strategy: IsolationStrategy,
    fixtures: &[(&str, Vec<(&str, &[u8])>)],
    scanner: FakeScanner,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("dev")).unwrap();
    std::fs::create_dir_all(root.join("sys")).unwrap();

    let mut config = GuardConfig::default();
    config.audit_log = root.join("log").join("audit.ndjson");
    config.monitor.trigger_device_types = vec!["partition".to_string()];
    config.monitor.decision_timeout_secs = Some(5);
    config.scan.mount_dir = root.join("slot");
    config.scan.scanner_timeout_secs = Some(30);
    config.isolation.strategy = strategy;
    config.isolation.sysfs_root = root.join("sys");
    config.isolation.access_dir = root.join("access");
    config.isolation.node_wait_secs = 0;

    let mut host = FakeHost {
        slot: config.scan.mount_dir.clone(),
        ..FakeHost::default()
    };
    for (name, files) in fixtures {
        let node = root.join("dev").join(name);
        std::fs::write(&node, b"").unwrap();
        let src = root.join("fixtures").join(name);
        std::fs::create_dir_all(&src).unwrap();
        for (file, content) in files {
            std::fs::write(src.join(file), content).unwrap();
        }
        host.fixtures.insert(node, src);
    }
    let host = Arc::new(host);

    let isolation = Arc::new(IsolationController::new(&config.isolation, host.clone()));
    let orchestrator = Arc::new(ScanOrchestrator::new(
        &config.scan,
        config.isolation.sysfs_root.clone(),
        host.clone(),
        Arc::new(scanner),
    ));
    let (input, rx) = mpsc::unbounded_channel();
    let answers = Arc::new(Mutex::new(VecDeque::new()));
    let operator = Operator {
        answers: answers.clone(),
        keyboard: input.clone(),
    };
    let gateway = DecisionGateway::new(rx, Box::new(operator), config.monitor.decision_timeout());
    let coordinator = Arc::new(Coordinator::new(
        TriggerPolicy::new(&config.monitor),
        isolation,
        orchestrator,
        gateway,
        AuditLog::open(&config.audit_log).unwrap(),
    ));
    Harness {
        audit_path: config.audit_log.clone(),
        dir,
        host,
        input,
        answers,
        coordinator,
    }
}

/// Poll the audit log until `done` holds for the records written so far
async fn eventually(audit: &Path, done: impl Fn(&[guard_mount::logging::AuditRecord]) -> bool) {
    for _ in 0..500 {
        if read_records(audit).is_ok_and(|records| done(&records)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("audit log never reached the expected state");
}

fn clean_files(n: usize) -> Vec<(&'static str, &'static [u8])> {
    const NAMES: [&str; 9] = [
        "a.txt", "b.txt", "c.txt", "d.txt", "e.txt", "f.txt", "g.txt", "h.txt", "i.txt",
    ];
    NAMES[..n]
        .iter()
        .map(|n| (*n, b"meeting notes, nothing to see here".as_slice()))
        .collect()
}

#[tokio::test]
async fn autorun_only_device_is_suspicious_and_rejected_stays_isolated() {
    let mut files = clean_files(9);
    files.push(("autorun.inf", b"[autorun]\nopen=setup.exe\n".as_slice()));
    let h = harness(IsolationStrategy::Unmount, &[("sdb1", files)], FakeScanner::default());

    let sessions = h.run(vec![usb_partition(&h.node("sdb1"), None)], &["5"]).await;
    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.state(), SessionState::Closed);
    assert_eq!(s.outcome(), SessionState::Rejected);

    let report = s.report().unwrap();
    assert!(report.is_complete());
    assert!(report.malicious().is_empty());
    assert_eq!(report.suspicious().len(), 1);
    assert_eq!(report.suspicious()[0].label, "Autorun Script");
    assert_eq!(report.clean_count(), 9);

    // Scan mount only; never mounted for access
    let calls = h.host.calls();
    assert!(calls.iter().all(|c| !c.contains("access")));
    assert_eq!(h.host.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scanner_hit_is_malicious_only_and_allow_mounts_read_only() {
    let mut verdicts = HashMap::new();
    verdicts.insert("bad.exe".to_string(), "Win.Trojan.Agent-6".to_string());
    let h = harness(
        IsolationStrategy::Unmount,
        &[("sdc1", vec![("bad.exe", b"MZ\x90\x00".as_slice()), ("readme.txt", b"hello".as_slice())])],
        FakeScanner {
            verdicts,
            ..FakeScanner::default()
        },
    );

    let sessions = h.run(vec![usb_partition(&h.node("sdc1"), None)], &["1"]).await;
    let s = &sessions[0];
    assert_eq!(s.outcome(), SessionState::Authorized);
    assert_eq!(s.decision(), Some(Decision::ReadOnlyAccess));

    let report = s.report().unwrap();
    assert_eq!(report.malicious().len(), 1);
    assert_eq!(report.malicious()[0].label, "Win.Trojan.Agent-6");
    assert!(report.malicious()[0].sha256.is_some());
    assert!(report.suspicious().is_empty());
    assert_eq!(report.clean_count(), 1);

    let access = h.dir.path().join("access").join("sdc1");
    let expected = format!("mount {} {} ReadOnly", h.node("sdc1").display(), access.display());
    assert!(h.host.calls().contains(&expected));
}

#[tokio::test]
async fn unresolved_sysfs_fails_without_scanning() {
    let h = harness(IsolationStrategy::Bus, &[("sdd1", clean_files(2))], FakeScanner::default());

    let sessions = h.run(vec![usb_partition(&h.node("sdd1"), None)], &[]).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].outcome(), SessionState::Failed);
    assert!(sessions[0].report().is_none());
    assert!(sessions[0].failure().unwrap().contains("no USB authorization control file"));
    assert!(h.host.calls().is_empty());

    let records = h.records();
    let failures: Vec<_> = records
        .iter()
        .filter(|r| r.event == AuditEvent::Failed)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, Stage::Isolated);
    assert!(records.iter().all(|r| r.stage != Stage::Scanned));
    assert_eq!(records.last().unwrap().stage, Stage::Closed);
}

#[cfg(unix)]
#[tokio::test]
async fn bus_strategy_scans_while_reauthorized_and_restores_read_only() {
    let h = harness(IsolationStrategy::Bus, &[("sde1", clean_files(3))], FakeScanner::default());
    let (authorized, devpath) = h.usb_topology("sde", "sde1");
    let plug = usb_partition(&h.node("sde1"), Some(&devpath));
    // Deauthorizing removes the node, as the kernel does
    h.host.attach_kernel(plug.clone(), None);

    let sessions = h.run(vec![plug], &["2"]).await;
    let s = &sessions[0];
    assert_eq!(s.outcome(), SessionState::CleanedAndAuthorized);
    let report = s.report().unwrap();
    assert!(report.is_complete(), "issues: {:?}", report.issues());
    assert_eq!(report.total_files(), 3);
    assert_eq!(report.clean_count(), 3);
    assert_eq!(std::fs::read_to_string(&authorized).unwrap().trim(), "1");

    let node = h.node("sde1").display().to_string();
    let slot = h.dir.path().join("slot").display().to_string();
    assert_eq!(
        h.host.calls(),
        vec![
            "authorized 0".to_string(),
            "authorized 1".to_string(),
            format!("setro {node}"),
            format!("mount {node} {slot} ReadOnly"),
            format!("umount {slot}"),
            "authorized 0".to_string(),
            "authorized 1".to_string(),
            format!("setro {node}"),
        ]
    );

    let stages: Vec<Stage> = h
        .records()
        .iter()
        .filter(|r| r.session_id.is_some())
        .map(|r| r.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            Stage::Detected,
            Stage::Isolated,
            Stage::Scanning,
            Stage::Scanned,
            Stage::AwaitingDecision,
            Stage::CleanedAndAuthorized,
            Stage::Closed,
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn bus_device_that_never_reappears_gets_an_incomplete_report() {
    let h = harness(IsolationStrategy::Bus, &[("sdr1", clean_files(2))], FakeScanner::default());
    let (authorized, devpath) = h.usb_topology("sdr", "sdr1");
    let plug = usb_partition(&h.node("sdr1"), Some(&devpath));
    // No node at all, and re-authorizing brings none back
    std::fs::remove_file(h.node("sdr1")).unwrap();

    let sessions = h.run(vec![plug], &["5"]).await;
    let report = sessions[0].report().unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.issues()[0].code, "device_unavailable");
    assert_eq!(sessions[0].outcome(), SessionState::Rejected);
    // Deauthorized again after the failed exposure
    assert_eq!(std::fs::read_to_string(&authorized).unwrap().trim(), "0");
    assert!(h.host.calls().iter().all(|c| !c.starts_with("mount")));
}

#[cfg(unix)]
#[tokio::test]
async fn own_reauthorization_events_open_no_session() {
    let h = harness(IsolationStrategy::Bus, &[("sdm1", clean_files(2))], FakeScanner::default());
    let (_, devpath) = h.usb_topology("sdm", "sdm1");
    let plug = usb_partition(&h.node("sdm1"), Some(&devpath));
    let (tx, rx) = mpsc::channel(16);
    h.host.attach_kernel(plug.clone(), Some(tx.clone()));
    h.answer(&["1"]);

    tx.send(plug).await.unwrap();
    drop(tx);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(h.coordinator.clone().run(rx, stop_rx));

    eventually(&h.audit_path, |records| records.iter().any(|r| r.stage == Stage::Closed)).await;
    // The kernel holds the last event sender
    h.host.detach_kernel();
    let sessions = run.await.unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].outcome(), SessionState::Authorized);
    let records = h.records();
    let suppressed: Vec<_> = records
        .iter()
        .filter(|r| r.event == AuditEvent::Suppressed)
        .collect();
    // Isolation and post-scan unbind, scan and final re-enumeration
    assert_eq!(suppressed.len(), 4);
    assert!(suppressed.iter().all(|r| r.session_id.is_none() && r.stage == Stage::Detected));
    assert!(records.iter().all(|r| r.event != AuditEvent::Removed));
    let detected = records
        .iter()
        .filter(|r| r.event == AuditEvent::Entered && r.stage == Stage::Detected)
        .count();
    assert_eq!(detected, 1);
}

#[tokio::test]
async fn concurrent_devices_never_share_the_scan_mount() {
    let h = harness(
        IsolationStrategy::Unmount,
        &[
            ("sdf1", clean_files(2)),
            ("sdg1", clean_files(3)),
            ("sdh1", clean_files(4)),
        ],
        FakeScanner {
            delay: Duration::from_millis(50),
            ..FakeScanner::default()
        },
    );

    let events = ["sdf1", "sdg1", "sdh1"]
        .iter()
        .map(|n| usb_partition(&h.node(n), None))
        .collect();
    let sessions = h.run(events, &["5", "5", "5"]).await;

    assert_eq!(sessions.len(), 3);
    assert_eq!(h.host.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.host.active.load(Ordering::SeqCst), 0);
    let mut totals: Vec<usize> = sessions
        .iter()
        .map(|s| s.report().unwrap().total_files())
        .collect();
    totals.sort();
    // Each report saw only its own device's files
    assert_eq!(totals, vec![2, 3, 4]);
    assert!(sessions.iter().all(|s| s.outcome() == SessionState::Rejected));
}

#[tokio::test]
async fn unrecognized_input_rejects() {
    let h = harness(IsolationStrategy::Unmount, &[("sdi1", clean_files(1))], FakeScanner::default());
    let sessions = h.run(vec![usb_partition(&h.node("sdi1"), None)], &["sure, why not"]).await;
    assert_eq!(sessions[0].outcome(), SessionState::Rejected);
    assert_eq!(sessions[0].decision(), Some(Decision::Reject));
    assert!(h.host.calls().iter().all(|c| !c.contains("access")));
}

#[tokio::test]
async fn lines_typed_ahead_never_decide_a_later_report() {
    let mut verdicts = HashMap::new();
    verdicts.insert("bad.exe".to_string(), "Win.Trojan.Agent-6".to_string());
    let h = harness(
        IsolationStrategy::Unmount,
        &[("sdn1", clean_files(2)), ("sdo1", vec![("bad.exe", b"MZ\x90\x00".as_slice())])],
        FakeScanner {
            verdicts,
            ..FakeScanner::default()
        },
    );
    // Typed before any report exists
    h.input.send("1".to_string()).unwrap();
    h.input.send("1".to_string()).unwrap();

    let events = vec![usb_partition(&h.node("sdn1"), None), usb_partition(&h.node("sdo1"), None)];
    let sessions = h.run(events, &["5", "5"]).await;
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.outcome() == SessionState::Rejected));
    assert_eq!(h.host.access_mounts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_terminal_action_leaves_device_isolated() {
    let h = harness(
        IsolationStrategy::Unmount,
        &[("sdp1", clean_files(1)), ("sdq1", clean_files(1))],
        FakeScanner::default(),
    );
    h.host.fail_access_mount.store(true, Ordering::SeqCst);
    h.host.fail_power_off.store(true, Ordering::SeqCst);

    let allowed = h.run(vec![usb_partition(&h.node("sdp1"), None)], &["1"]).await;
    let ejected = h.run(vec![usb_partition(&h.node("sdq1"), None)], &["4"]).await;

    for (sessions, stage) in [(&allowed, Stage::Authorized), (&ejected, Stage::Ejected)] {
        let s = &sessions[0];
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.outcome(), SessionState::Failed);
        assert!(s.failure().unwrap().contains("refused by test host"));

        let records: Vec<_> = h
            .records()
            .into_iter()
            .filter(|r| r.session_id == Some(s.id()))
            .collect();
        let failures: Vec<Stage> = records
            .iter()
            .filter(|r| r.event == AuditEvent::Failed)
            .map(|r| r.stage)
            .collect();
        assert_eq!(failures, vec![stage]);
        assert!(records.iter().all(|r| r.event != AuditEvent::Entered || r.stage != stage));
        assert_eq!(records.last().unwrap().stage, Stage::Closed);
    }
    assert_eq!(h.host.access_mounts.load(Ordering::SeqCst), 0);
    assert_eq!(h.host.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn removal_and_foreign_events_open_no_session() {
    let h = harness(IsolationStrategy::Unmount, &[("sdj1", clean_files(1))], FakeScanner::default());
    let mut removed = usb_partition(&h.node("sdj1"), None);
    removed.action = DeviceAction::Remove;
    let mut sata = usb_partition(&h.node("sdj1"), None);
    sata.properties.insert("ID_BUS".to_string(), "ata".to_string());

    let sessions = h.run(vec![removed, sata], &[]).await;
    assert!(sessions.is_empty());
    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event, AuditEvent::Removed);
    assert!(records[0].session_id.is_none());
}

#[tokio::test]
async fn shutdown_abandons_queued_session_and_releases_mount() {
    let scanner = FakeScanner {
        delay: Duration::from_millis(200),
        ..FakeScanner::default()
    };
    let started = scanner.started.clone();
    let h = harness(
        IsolationStrategy::Unmount,
        &[("sdk1", clean_files(1)), ("sdl1", clean_files(1))],
        scanner,
    );

    let (tx, rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = watch::channel(false);
    tx.send(usb_partition(&h.node("sdk1"), None)).await.unwrap();
    tx.send(usb_partition(&h.node("sdl1"), None)).await.unwrap();
    let run = tokio::spawn(h.coordinator.clone().run(rx, stop_rx));

    started.notified().await;
    // Wait until both devices are isolated
    for _ in 0..200 {
        let isolated = h
            .records()
            .iter()
            .filter(|r| r.event == AuditEvent::Entered && r.stage == Stage::Isolated)
            .count();
        if isolated == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop_tx.send(true).unwrap();
    let sessions = run.await.unwrap();
    drop(tx);

    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.outcome() == SessionState::Abandoned));
    let scanned = sessions.iter().filter(|s| s.report().is_some()).count();
    assert_eq!(scanned, 1);
    assert_eq!(h.host.active.load(Ordering::SeqCst), 0);

    let abandoned: Vec<Stage> = h
        .records()
        .iter()
        .filter(|r| r.event == AuditEvent::Abandoned)
        .map(|r| r.stage)
        .collect();
    assert_eq!(abandoned.len(), 2);
    assert!(abandoned.contains(&Stage::Isolated));
    assert!(abandoned.contains(&Stage::Scanning));
}
