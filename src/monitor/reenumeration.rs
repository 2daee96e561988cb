//! udev events we cause ourselves. Writing a USB `authorized` file unbinds or
//! re-enumerates the device, and udev reports that exactly like an unplug or a plug.
//! Each write registers the event it will cause; the first matching event within the
//! window consumes the registration and opens no session.

use crate::device::{DeviceAction, DeviceEvent};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Expected {
    action: DeviceAction,
    /// USB device directory; block events for the device carry a `DEVPATH` beneath it
    devpath: String,
    until: Instant,
}

#[derive(Debug)]
pub struct ExpectedEvents {
    window: Duration,
    pending: Mutex<Vec<Expected>>,
}

impl Default for ExpectedEvents {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ExpectedEvents {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Register one `action` event expected for the USB device at `devpath`
    pub fn expect(&self, action: DeviceAction, devpath: String) {
        let until = Instant::now() + self.window;
        self.lock().push(Expected { action, devpath, until });
    }

    /// Consume the registration covering `event`. Expired registrations are dropped first.
    pub fn take(&self, event: &DeviceEvent) -> bool {
        let Some(path) = event.property("DEVPATH") else {
            return false;
        };
        let now = Instant::now();
        let mut pending = self.lock();
        pending.retain(|e| e.until > now);
        match pending
            .iter()
            .position(|e| e.action == event.action && beneath(path, &e.devpath))
        {
            Some(i) => {
                pending.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Expected>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn beneath(path: &str, dir: &str) -> bool {
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}
