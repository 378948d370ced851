//! Per-device state for every sensor heard since startup.
//!
//! The registry is the only place that tracks which sensors exist; entries are
//! created on first sighting and live until the process exits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::time::{Duration, Instant};

use crate::models::{Reading, SharedReading};

/// How many recent measurement sequence numbers are remembered per device
const SEQUENCE_WINDOW: usize = 32;

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device_id: String,
    pub last_reading: SharedReading,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub readings_seen: u64,
    /// Sequence numbers of the most recent accepted readings, oldest first
    pub recent_sequences: VecDeque<u16>,
}

impl DeviceState {
    fn already_seen(&self, reading: &Reading) -> bool {
        reading
            .signal
            .measurement_sequence
            .map_or(false, |seq| self.recent_sequences.contains(&seq))
    }

    fn remember(&mut self, reading: &Reading) {
        if let Some(seq) = reading.signal.measurement_sequence {
            if self.recent_sequences.len() == SEQUENCE_WINDOW {
                self.recent_sequences.pop_front();
            }
            self.recent_sequences.push_back(seq);
        }
    }
}

/// Result of recording a reading
#[derive(Debug, Clone)]
pub enum Observation {
    /// New reading, state updated
    Recorded(DeviceState),
    /// Measurement already accepted recently, state untouched
    Duplicate(DeviceState),
}

impl Observation {
    pub fn state(&self) -> &DeviceState {
        match self {
            Observation::Recorded(state) | Observation::Duplicate(state) => state,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Observation::Duplicate(_))
    }
}

/// Point-in-time copy of the registry; iterate it as many times as needed
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    devices: Arc<[DeviceState]>,
}

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, DeviceState> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a DeviceState;
    type IntoIter = std::slice::Iter<'a, DeviceState>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: RwLock<HashMap<String, DeviceState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock can't leave a half-written entry, so
    // poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceState>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceState>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a reading for its device.
    ///
    /// A reading whose measurement sequence number is among the last
    /// accepted ones from the same device is a retransmission and leaves the
    /// state as it was.
    pub fn observe(&self, reading: SharedReading) -> Observation {
        let seen_at = reading.captured.at;
        let mut devices = self.write();

        match devices.get_mut(&reading.device_id) {
            Some(state) => {
                if state.already_seen(&reading) {
                    return Observation::Duplicate(state.clone());
                }
                state.remember(&reading);
                state.last_reading = reading;
                state.last_seen = state.last_seen.max(seen_at);
                state.readings_seen += 1;
                Observation::Recorded(state.clone())
            }
            None => {
                let mut state = DeviceState {
                    device_id: reading.device_id.clone(),
                    last_reading: Arc::clone(&reading),
                    first_seen: seen_at,
                    last_seen: seen_at,
                    readings_seen: 1,
                    recent_sequences: VecDeque::with_capacity(SEQUENCE_WINDOW),
                };
                state.remember(&reading);
                devices.insert(state.device_id.clone(), state.clone());
                Observation::Recorded(state)
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.read().get(device_id).cloned()
    }

    /// True when the device hasn't been heard for longer than `threshold`.
    /// Devices never seen are stale.
    pub fn is_stale(&self, device_id: &str, now: Instant, threshold: Duration) -> bool {
        match self.read().get(device_id) {
            Some(state) => now.saturating_duration_since(state.last_seen) > threshold,
            None => true,
        }
    }

    pub fn stale_devices(&self, now: Instant, threshold: Duration) -> Vec<String> {
        let mut stale: Vec<String> = self
            .read()
            .values()
            .filter(|state| now.saturating_duration_since(state.last_seen) > threshold)
            .map(|state| state.device_id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Snapshot of all device states, sorted by device id
    pub fn list(&self) -> Snapshot {
        let mut devices: Vec<DeviceState> = self.read().values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Snapshot {
            devices: devices.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Captured, Signal};
    use time::OffsetDateTime;

    fn reading(device: &str, seq: Option<u16>, at: Instant) -> SharedReading {
        Arc::new(Reading {
            device_id: device.to_string(),
            format: 5,
            captured: Captured {
                at,
                wall: OffsetDateTime::now_utc(),
            },
            environmental: None,
            motion: None,
            power: None,
            signal: Signal {
                rssi: Some(-70),
                measurement_sequence: seq,
            },
        })
    }

    #[test]
    fn first_sighting_creates_state() {
        let registry = Registry::new();
        let now = Instant::now();
        let obs = registry.observe(reading("AA:BB", Some(1), now));

        assert!(!obs.is_duplicate());
        assert_eq!(obs.state().readings_seen, 1);
        assert_eq!(obs.state().first_seen, now);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_sequence_leaves_state_unchanged() {
        let registry = Registry::new();
        let t0 = Instant::now();
        registry.observe(reading("AA:BB", Some(7), t0));
        let before = registry.get("AA:BB").unwrap();

        let obs = registry.observe(reading("AA:BB", Some(7), t0 + Duration::from_secs(1)));
        let after = registry.get("AA:BB").unwrap();

        assert!(obs.is_duplicate());
        assert_eq!(after.readings_seen, before.readings_seen);
        assert_eq!(after.last_seen, before.last_seen);
        assert!(Arc::ptr_eq(&after.last_reading, &before.last_reading));
    }

    #[test]
    fn earlier_sequence_seen_again_is_a_duplicate() {
        let registry = Registry::new();
        let t0 = Instant::now();
        registry.observe(reading("AA:BB", Some(10), t0));
        registry.observe(reading("AA:BB", Some(11), t0 + Duration::from_secs(1)));

        let obs = registry.observe(reading("AA:BB", Some(10), t0 + Duration::from_secs(2)));

        assert!(obs.is_duplicate());
        assert_eq!(obs.state().readings_seen, 2);
        assert_eq!(obs.state().last_seen, t0 + Duration::from_secs(1));
    }

    #[test]
    fn sequence_window_forgets_old_numbers() {
        let registry = Registry::new();
        let t0 = Instant::now();
        for seq in 0..=SEQUENCE_WINDOW as u16 {
            registry.observe(reading("AA:BB", Some(seq), t0));
        }

        let obs = registry.observe(reading("AA:BB", Some(0), t0));

        assert!(!obs.is_duplicate());
        assert_eq!(obs.state().recent_sequences.len(), SEQUENCE_WINDOW);
    }

    #[test]
    fn same_sequence_on_another_device_is_not_a_duplicate() {
        let registry = Registry::new();
        let now = Instant::now();
        registry.observe(reading("AA:BB", Some(7), now));
        let obs = registry.observe(reading("CC:DD", Some(7), now));

        assert!(!obs.is_duplicate());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn readings_without_sequence_are_never_duplicates() {
        let registry = Registry::new();
        let now = Instant::now();
        registry.observe(reading("AA:BB", None, now));
        let obs = registry.observe(reading("AA:BB", None, now));

        assert!(!obs.is_duplicate());
        assert_eq!(obs.state().readings_seen, 2);
    }

    #[test]
    fn staleness_follows_last_seen() {
        let registry = Registry::new();
        let t0 = Instant::now();
        let threshold = Duration::from_secs(60);
        registry.observe(reading("AA:BB", Some(1), t0));

        assert!(!registry.is_stale("AA:BB", t0 + Duration::from_secs(30), threshold));
        assert!(registry.is_stale("AA:BB", t0 + Duration::from_secs(61), threshold));
        assert!(registry.is_stale("unknown", t0, threshold));
        assert_eq!(
            registry.stale_devices(t0 + Duration::from_secs(61), threshold),
            vec!["AA:BB".to_string()]
        );
    }

    #[test]
    fn snapshot_is_restartable_and_detached() {
        let registry = Registry::new();
        let now = Instant::now();
        registry.observe(reading("AA:BB", Some(1), now));
        registry.observe(reading("CC:DD", Some(1), now));

        let snapshot = registry.list();
        registry.observe(reading("EE:FF", Some(1), now));

        let first: Vec<_> = snapshot.iter().map(|s| s.device_id.clone()).collect();
        let second: Vec<_> = (&snapshot).into_iter().map(|s| s.device_id.clone()).collect();
        assert_eq!(first, vec!["AA:BB", "CC:DD"]);
        assert_eq!(first, second);
        assert_eq!(registry.list().len(), 3);
    }
}
