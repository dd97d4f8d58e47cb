// Device Tracker - real-time device set derived from adb track-devices.
// Keeps the Device records, enriches them with getprop properties on
// first sight, and fans change events out to SSE subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::adb::bridge::{BridgeDriver, DeviceSetSnapshot, DeviceState};

/// Per-subscriber event queue depth. New events are dropped (not the
/// queued ones) when a consumer falls this far behind; the payload is
/// always the full set, so the next delivered event catches it up.
const EVENT_QUEUE_DEPTH: usize = 8;

/// A tracked Android device.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub is_emulator: bool,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_seen_mono: Instant,
}

impl Device {
    fn new(serial: String, state: DeviceState) -> Self {
        let is_emulator = serial.starts_with("emulator-");
        Self {
            serial,
            state,
            model: None,
            manufacturer: None,
            is_emulator,
            last_seen_at: Utc::now(),
            last_seen_mono: Instant::now(),
        }
    }
}

#[derive(Default)]
struct TrackerInner {
    devices: HashMap<String, Device>,
    subscribers: Vec<mpsc::Sender<Vec<Device>>>,
}

impl TrackerInner {
    /// Merge one full `(serial, state)` snapshot into the device map.
    /// Devices absent from the snapshot go offline but are kept.
    /// Returns the serials seen for the first time.
    fn apply_snapshot(&mut self, snapshot: DeviceSetSnapshot) -> Vec<String> {
        let mut first_seen = Vec::new();
        let now_mono = Instant::now();
        let now = Utc::now();

        for (serial, state) in &snapshot {
            match self.devices.get_mut(serial) {
                Some(device) => {
                    device.state = *state;
                    device.last_seen_at = now;
                    device.last_seen_mono = now_mono;
                }
                None => {
                    self.devices
                        .insert(serial.clone(), Device::new(serial.clone(), *state));
                    first_seen.push(serial.clone());
                }
            }
        }

        let present: std::collections::HashSet<&str> =
            snapshot.iter().map(|(s, _)| s.as_str()).collect();
        for device in self.devices.values_mut() {
            if !present.contains(device.serial.as_str()) {
                device.state = DeviceState::Offline;
            }
        }

        first_seen
    }

    fn device_list(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| a.serial.cmp(&b.serial));
        list
    }

    /// Fan the current set out to every subscriber. Full-set payloads
    /// with drop-newest on a full queue; closed receivers are reaped.
    fn emit(&mut self) {
        let list = self.device_list();
        self.subscribers.retain(|tx| match tx.try_send(list.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Tracks the connected-device set for the whole process.
pub struct DeviceTracker {
    bridge: BridgeDriver,
    inner: Arc<Mutex<TrackerInner>>,
}

impl DeviceTracker {
    pub fn new(bridge: BridgeDriver) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            inner: Arc::new(Mutex::new(TrackerInner::default())),
        })
    }

    /// Start consuming the bridge's device-change stream. Runs until the
    /// process exits.
    pub fn start(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = tracker.bridge.track_devices();
            while let Some(snapshot) = rx.recv().await {
                tracker.on_snapshot(snapshot);
            }
            info!("device tracking stream closed");
        });
    }

    fn on_snapshot(self: &Arc<Self>, snapshot: DeviceSetSnapshot) {
        let first_seen = {
            let mut inner = self.inner.lock().unwrap();
            let first_seen = inner.apply_snapshot(snapshot);
            // The event may precede property enrichment; a second event
            // follows once getprop completes.
            inner.emit();
            first_seen
        };

        for serial in first_seen {
            debug!(serial = %serial, "device first seen, fetching properties");
            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                tracker.enrich(&serial).await;
            });
        }
    }

    /// Fetch descriptive properties for a device and emit a follow-up
    /// event. Never blocks snapshot processing.
    async fn enrich(&self, serial: &str) {
        let model = match self.bridge.get_prop(serial, "ro.product.marketname").await {
            Some(m) => Some(m),
            None => self.bridge.get_prop(serial, "ro.product.model").await,
        };
        let manufacturer = self.bridge.get_prop(serial, "ro.product.manufacturer").await;
        let qemu = self.bridge.get_prop(serial, "ro.kernel.qemu").await;

        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.devices.get_mut(serial) {
            device.model = model;
            device.manufacturer = manufacturer;
            if qemu.as_deref() == Some("1") {
                device.is_emulator = true;
            }
        }
        inner.emit();
    }

    /// Current device set, sorted by serial.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.lock().unwrap().device_list()
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.inner.lock().unwrap().devices.get(serial).cloned()
    }

    pub fn is_online(&self, serial: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .devices
            .get(serial)
            .map(|d| d.state == DeviceState::Online)
            .unwrap_or(false)
    }

    /// Subscribe to change events. Each event carries the full current
    /// set, so late joiners are trivially correct.
    pub fn subscribe(&self) -> mpsc::Receiver<Vec<Device>> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut inner = self.inner.lock().unwrap();
        // Seed the new subscriber with the current set.
        let _ = tx.try_send(inner.device_list());
        inner.subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, DeviceState)]) -> DeviceSetSnapshot {
        entries
            .iter()
            .map(|(s, st)| (s.to_string(), *st))
            .collect()
    }

    #[test]
    fn first_snapshot_creates_devices() {
        let mut inner = TrackerInner::default();
        let new = inner.apply_snapshot(snapshot(&[
            ("a", DeviceState::Online),
            ("b", DeviceState::Unauthorized),
        ]));
        assert_eq!(new.len(), 2);
        assert_eq!(inner.devices["a"].state, DeviceState::Online);
        assert_eq!(inner.devices["b"].state, DeviceState::Unauthorized);
    }

    #[test]
    fn missing_devices_go_offline_but_are_kept() {
        let mut inner = TrackerInner::default();
        inner.apply_snapshot(snapshot(&[("a", DeviceState::Online)]));
        let new = inner.apply_snapshot(snapshot(&[]));
        assert!(new.is_empty());
        assert_eq!(inner.devices["a"].state, DeviceState::Offline);
    }

    #[test]
    fn state_transitions_update_in_place() {
        let mut inner = TrackerInner::default();
        inner.apply_snapshot(snapshot(&[("a", DeviceState::Unauthorized)]));
        let new = inner.apply_snapshot(snapshot(&[("a", DeviceState::Online)]));
        assert!(new.is_empty());
        assert_eq!(inner.devices["a"].state, DeviceState::Online);
    }

    #[test]
    fn emulator_serial_is_flagged() {
        let mut inner = TrackerInner::default();
        inner.apply_snapshot(snapshot(&[("emulator-5554", DeviceState::Online)]));
        assert!(inner.devices["emulator-5554"].is_emulator);
    }

    #[test]
    fn device_list_is_sorted() {
        let mut inner = TrackerInner::default();
        inner.apply_snapshot(snapshot(&[
            ("zzz", DeviceState::Online),
            ("aaa", DeviceState::Online),
        ]));
        let list = inner.device_list();
        assert_eq!(list[0].serial, "aaa");
        assert_eq!(list[1].serial, "zzz");
    }
}
