//! Device-arrival events and the immutable identity captured from them.
//! The raw event source lives in [`udev`]; everything here is plain data.

pub mod udev;

use crate::config::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Add,
    Remove,
    Change,
    Other(String),
}

impl From<&str> for DeviceAction {
    fn from(s: &str) -> Self {
        match s {
            "add" => DeviceAction::Add,
            "remove" => DeviceAction::Remove,
            "change" => DeviceAction::Change,
            other => DeviceAction::Other(other.to_string()),
        }
    }
}

impl DeviceAction {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceAction::Add => "add",
            DeviceAction::Remove => "remove",
            DeviceAction::Change => "change",
            DeviceAction::Other(s) => s.as_str(),
        }
    }
}

/// One kernel/udev event for a block device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub device_node: Option<PathBuf>,
    pub subsystem: String,
    pub device_type: String,
    /// Raw udev properties (`ID_BUS`, `ID_VENDOR`, `DEVPATH`, ...)
    pub properties: BTreeMap<String, String>,
}

impl DeviceEvent {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// USB-attached: `ID_BUS=usb`, or a USB segment in the topology path
    pub fn is_usb(&self) -> bool {
        self.property("ID_BUS") == Some("usb")
            || self.property("DEVPATH").is_some_and(|p| p.contains("/usb"))
    }
}

/// Identity of a physical device, captured once at detection and never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub node: PathBuf,
    /// Kernel topology path relative to the sysfs root (`DEVPATH`)
    pub devpath: Option<String>,
    pub device_type: String,
    pub bus: String,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub vendor_id: String,
    pub product_id: String,
    pub fs_type: Option<String>,
    pub fs_label: Option<String>,
    pub fs_uuid: Option<String>,
}

impl DeviceIdentity {
    /// Capture identity from an event; `None` when the event carries no device node
    pub fn from_event(event: &DeviceEvent) -> Option<Self> {
        let node = event.device_node.clone()?;
        let text = |key: &str| event.property(key).unwrap_or(UNKNOWN).to_string();
        let opt = |key: &str| {
            event
                .property(key)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Some(Self {
            node,
            devpath: opt("DEVPATH"),
            device_type: event.device_type.clone(),
            bus: text("ID_BUS"),
            vendor: text("ID_VENDOR"),
            model: text("ID_MODEL"),
            serial: text("ID_SERIAL_SHORT"),
            vendor_id: text("ID_VENDOR_ID"),
            product_id: text("ID_MODEL_ID"),
            fs_type: opt("ID_FS_TYPE"),
            fs_label: opt("ID_FS_LABEL"),
            fs_uuid: opt("ID_FS_UUID"),
        })
    }

    /// Kernel name of the node (`sdb`, `sdb1`)
    pub fn kernel_name(&self) -> String {
        self.node
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_partition(&self) -> bool {
        self.device_type == "partition"
    }

    /// Short human label: "Vendor Model (label)"
    pub fn describe(&self) -> String {
        match &self.fs_label {
            Some(label) => format!("{} {} ({})", self.vendor, self.model, label),
            None => format!("{} {}", self.vendor, self.model),
        }
    }
}

/// Which events open a device session
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    pub device_types: Vec<String>,
    pub require_usb: bool,
}

impl TriggerPolicy {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            device_types: config.trigger_device_types.clone(),
            require_usb: config.require_usb,
        }
    }

    pub fn matches(&self, event: &DeviceEvent) -> bool {
        event.action == DeviceAction::Add
            && event.subsystem == "block"
            && event.device_node.is_some()
            && self.device_types.iter().any(|t| t == &event.device_type)
            && (!self.require_usb || event.is_usb())
    }
}

/// First storage partition of a device, as a device node.
///
/// A partition identity resolves to itself. A disk resolves to its lowest-numbered
/// partition found under `<sysfs>/class/block/<disk>/`; a disk with no partition
/// table but a filesystem signature (superfloppy) resolves to the disk itself.
pub fn first_partition(identity: &DeviceIdentity, sysfs_root: &Path) -> Option<PathBuf> {
    if identity.is_partition() {
        return Some(identity.node.clone());
    }
    let name = identity.kernel_name();
    let disk_dir = sysfs_root.join("class").join("block").join(&name);
    let mut best: Option<(u32, String)> = None;
    if let Ok(entries) = std::fs::read_dir(&disk_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let child = entry.file_name().to_string_lossy().into_owned();
            if !child.starts_with(&name) {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path().join("partition")) else {
                continue;
            };
            let Ok(number) = raw.trim().parse::<u32>() else {
                continue;
            };
            if best.as_ref().map_or(true, |(n, _)| number < *n) {
                best = Some((number, child));
            }
        }
    }
    match best {
        Some((_, child)) => Some(identity.node.with_file_name(child)),
        None if identity.fs_type.is_some() => Some(identity.node.clone()),
        None => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn usb_disk_event(node: &str) -> DeviceEvent {
        let mut properties = BTreeMap::new();
        properties.insert("ID_BUS".to_string(), "usb".to_string());
        properties.insert("ID_VENDOR".to_string(), "Kingston".to_string());
        properties.insert("ID_MODEL".to_string(), "DataTraveler".to_string());
        properties.insert("ID_SERIAL_SHORT".to_string(), "0011".to_string());
        DeviceEvent {
            action: DeviceAction::Add,
            device_node: Some(PathBuf::from(node)),
            subsystem: "block".to_string(),
            device_type: "disk".to_string(),
            properties,
        }
    }

    #[test]
    fn policy_accepts_usb_disk_add() {
        let policy = TriggerPolicy::new(&MonitorConfig::default());
        assert!(policy.matches(&usb_disk_event("/dev/sdb")));
    }

    #[test]
    fn policy_rejects_remove_non_usb_and_wrong_type() {
        let policy = TriggerPolicy::new(&MonitorConfig::default());

        let mut removed = usb_disk_event("/dev/sdb");
        removed.action = DeviceAction::Remove;
        assert!(!policy.matches(&removed));

        let mut sata = usb_disk_event("/dev/sda");
        sata.properties.insert("ID_BUS".to_string(), "ata".to_string());
        assert!(!policy.matches(&sata));

        let mut part = usb_disk_event("/dev/sdb1");
        part.device_type = "partition".to_string();
        assert!(!policy.matches(&part));
    }

    #[test]
    fn usb_detected_from_devpath() {
        let mut ev = usb_disk_event("/dev/sdc");
        ev.properties.remove("ID_BUS");
        ev.properties.insert(
            "DEVPATH".to_string(),
            "/devices/pci0000:00/0000:00:14.0/usb2/2-1/2-1:1.0/host6/target6:0:0/6:0:0:0/block/sdc".to_string(),
        );
        assert!(ev.is_usb());
    }

    #[test]
    fn identity_fills_unknowns() {
        let mut ev = usb_disk_event("/dev/sdb");
        ev.properties.clear();
        let id = DeviceIdentity::from_event(&ev).unwrap();
        assert_eq!(id.vendor, "Unknown");
        assert_eq!(id.fs_label, None);
        assert_eq!(id.kernel_name(), "sdb");
    }

    #[test]
    fn first_partition_picks_lowest_number() {
        let sys = tempfile::tempdir().unwrap();
        let disk = sys.path().join("class/block/sdb");
        for (name, num) in [("sdb2", "2"), ("sdb1", "1")] {
            std::fs::create_dir_all(disk.join(name)).unwrap();
            std::fs::write(disk.join(name).join("partition"), format!("{num}\n")).unwrap();
        }
        std::fs::create_dir_all(disk.join("queue")).unwrap();
        let id = DeviceIdentity::from_event(&usb_disk_event("/dev/sdb")).unwrap();
        assert_eq!(first_partition(&id, sys.path()), Some(PathBuf::from("/dev/sdb1")));
    }

    #[test]
    fn first_partition_superfloppy_and_missing() {
        let sys = tempfile::tempdir().unwrap();
        let mut id = DeviceIdentity::from_event(&usb_disk_event("/dev/sdd")).unwrap();
        assert_eq!(first_partition(&id, sys.path()), None);
        id.fs_type = Some("vfat".to_string());
        assert_eq!(first_partition(&id, sys.path()), Some(PathBuf::from("/dev/sdd")));
    }
}
