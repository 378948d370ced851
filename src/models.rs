use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::time::Instant;

/// Capture time of a broadcast: monotonic for ordering, wall clock for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Captured {
    pub at: Instant,
    pub wall: OffsetDateTime,
}

impl Captured {
    pub fn now() -> Self {
        Captured {
            at: Instant::now(),
            wall: OffsetDateTime::now_utc(),
        }
    }
}

/// Temperature (°C), relative humidity (%RH) and pressure (hPa)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environmental {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
}

/// Acceleration in g and the wrapping movement counter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    pub acceleration_x: Option<f64>,
    pub acceleration_y: Option<f64>,
    pub acceleration_z: Option<f64>,
    pub movement_counter: Option<u8>,
}

/// Battery voltage (V) and transmit power (dBm)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Power {
    pub battery_voltage: Option<f64>,
    pub tx_power: Option<i8>,
}

/// Received signal strength and the sensor's measurement sequence number
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Signal {
    pub rssi: Option<i16>,
    pub measurement_sequence: Option<u16>,
}

/// One decoded observation from one sensor.
///
/// Readings are shared behind `Arc` once decoded and never mutated. A group
/// is `None` when the payload marked every field of it as not available.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub format: u8,
    pub captured: Captured,
    pub environmental: Option<Environmental>,
    pub motion: Option<Motion>,
    pub power: Option<Power>,
    pub signal: Signal,
}

pub type SharedReading = Arc<Reading>;

impl Reading {
    /// Measurement groups this reading carries data for
    pub fn groups(&self) -> impl Iterator<Item = MeasurementGroup> + '_ {
        MeasurementGroup::ALL
            .into_iter()
            .filter(move |group| self.has_group(*group))
    }

    pub fn has_group(&self, group: MeasurementGroup) -> bool {
        match group {
            MeasurementGroup::Environmental => self.environmental.is_some(),
            MeasurementGroup::Motion => self.motion.is_some(),
            MeasurementGroup::Power => self.power.is_some(),
            MeasurementGroup::Signal => {
                self.signal.rssi.is_some() || self.signal.measurement_sequence.is_some()
            }
        }
    }
}

/// Independent write streams sharing a device tag and timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementGroup {
    Environmental,
    Motion,
    Power,
    Signal,
}

impl MeasurementGroup {
    pub const ALL: [MeasurementGroup; 4] = [
        MeasurementGroup::Environmental,
        MeasurementGroup::Motion,
        MeasurementGroup::Power,
        MeasurementGroup::Signal,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementGroup::Environmental => "environmental",
            MeasurementGroup::Motion => "motion",
            MeasurementGroup::Power => "power",
            MeasurementGroup::Signal => "signal",
        }
    }
}

impl fmt::Display for MeasurementGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reading waiting in the buffer, tagged with the id the buffer assigned it
#[derive(Debug, Clone)]
pub struct Queued {
    pub id: u64,
    pub reading: SharedReading,
}

impl Queued {
    /// Ordering key used for eviction: capture instant, then insertion order
    pub fn key(&self) -> (Instant, u64) {
        (self.reading.captured.at, self.id)
    }
}

/// Write-ready readings for one measurement group.
///
/// Once drained from the buffer the batch belongs to the writer; the buffer
/// only sees it again if delivery fails and it is requeued.
#[derive(Debug, Clone)]
pub struct Batch {
    pub group: MeasurementGroup,
    pub entries: Vec<Queued>,
}

impl Batch {
    pub fn new(group: MeasurementGroup) -> Self {
        Batch {
            group,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().map(|entry| entry.reading.as_ref())
    }
}
