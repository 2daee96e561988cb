//! Device-arrival source backed by `udevadm monitor --udev --property`.
//! Each event is a block of `KEY=VALUE` lines terminated by a blank line.

use super::DeviceEvent;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Incremental parser for `udevadm monitor --property` output
#[derive(Debug, Default)]
pub struct PropertyBlockParser {
    current: BTreeMap<String, String>,
}

impl PropertyBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns an event when a block is completed
    pub fn push_line(&mut self, line: &str) -> Option<DeviceEvent> {
        let line = line.trim_end();
        if line.is_empty() {
            let props = std::mem::take(&mut self.current);
            return event_from_properties(props);
        }
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() && key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
                self.current.insert(key.to_string(), value.to_string());
            }
        }
        None
    }

    /// Flush a trailing block not followed by a blank line
    pub fn finish(&mut self) -> Option<DeviceEvent> {
        event_from_properties(std::mem::take(&mut self.current))
    }
}

fn event_from_properties(properties: BTreeMap<String, String>) -> Option<DeviceEvent> {
    let action = properties.get("ACTION")?.as_str().into();
    let subsystem = properties.get("SUBSYSTEM")?.clone();
    Some(DeviceEvent {
        action,
        device_node: properties.get("DEVNAME").map(PathBuf::from),
        subsystem,
        device_type: properties.get("DEVTYPE").cloned().unwrap_or_default(),
        properties,
    })
}

/// Spawns `udevadm monitor` and forwards parsed block events
pub struct UdevMonitor {
    program: String,
}

impl Default for UdevMonitor {
    fn default() -> Self {
        Self {
            program: "udevadm".to_string(),
        }
    }
}

impl UdevMonitor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Forward events until the monitor exits, the receiver is dropped, or shutdown is signalled
    pub async fn run(
        &self,
        tx: mpsc::Sender<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let mut child = Command::new(&self.program)
            .args(["monitor", "--udev", "--property", "--subsystem-match=block"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "udevadm stdout unavailable"))?;
        info!(program = %self.program, "listening for block device events");

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = PropertyBlockParser::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("event source stopping");
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        warn!("udevadm monitor exited");
                        if let Some(ev) = parser.finish() {
                            let _ = tx.send(ev).await;
                        }
                        break;
                    };
                    if let Some(ev) = parser.push_line(&line) {
                        debug!(action = ?ev.action, node = ?ev.device_node, "udev event");
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        let _ = child.start_kill();
        Ok(())
    }
}
