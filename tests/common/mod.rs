//! Fakes shared by the integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration, Instant};

use ruuvi_ingest::bluetooth::{Advertisement, Radio, ScanStartError};
use ruuvi_ingest::config::SensorConfig;
use ruuvi_ingest::database::{Sink, WriteError};
use ruuvi_ingest::models::{Batch, Captured, Environmental, MeasurementGroup, Reading, Signal};

pub const DEVICE: &str = "CB:B8:33:4C:88:4F";

/// Official format 5 test vector
const VALID_RAWV2: [u8; 24] = [
    0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC, 0x36,
    0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
];

pub fn config(overrides: &[(&str, &str)]) -> SensorConfig {
    let mut vars = vec![(
        "DATABASE_URL".to_string(),
        "postgres://ruuvi@localhost/ruuvi".to_string(),
    )];
    vars.extend(
        overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    SensorConfig::from_vars(vars).unwrap()
}

/// Format 5 payload with the given measurement sequence number
pub fn rawv2_payload(sequence: u16) -> Vec<u8> {
    let mut payload = VALID_RAWV2.to_vec();
    payload[16..18].copy_from_slice(&sequence.to_be_bytes());
    payload
}

pub fn advertisement(device_id: &str, sequence: u16) -> Advertisement {
    Advertisement {
        device_id: device_id.to_string(),
        payload: rawv2_payload(sequence),
        rssi: Some(-70),
        received: Captured::now(),
    }
}

/// Reading carrying only the environmental group, captured `offset` after `base`
pub fn environmental_reading(base: Instant, offset: Duration, temperature: f64) -> Arc<Reading> {
    Arc::new(Reading {
        device_id: DEVICE.to_string(),
        format: 5,
        captured: Captured {
            at: base + offset,
            wall: time::OffsetDateTime::now_utc(),
        },
        environmental: Some(Environmental {
            temperature: Some(temperature),
            humidity: Some(50.0),
            pressure: Some(1013.25),
        }),
        motion: None,
        power: None,
        signal: Signal::default(),
    })
}

/// Radio that replays one scripted result per scan, then hears nothing
pub struct ScriptedRadio {
    script: Mutex<Vec<Result<Vec<Advertisement>, ScanStartError>>>,
    repeat_failure: bool,
}

impl ScriptedRadio {
    pub fn new(mut script: Vec<Result<Vec<Advertisement>, ScanStartError>>) -> Self {
        script.reverse();
        ScriptedRadio {
            script: Mutex::new(script),
            repeat_failure: false,
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    /// Radio whose every scan fails to start
    pub fn broken() -> Self {
        ScriptedRadio {
            script: Mutex::new(Vec::new()),
            repeat_failure: true,
        }
    }
}

#[async_trait]
impl Radio for ScriptedRadio {
    async fn scan(&self, _window: Duration) -> Result<Vec<Advertisement>, ScanStartError> {
        if self.repeat_failure {
            return Err(ScanStartError::Unavailable("adapter missing".into()));
        }
        self.script.lock().unwrap().pop().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Radio that listens for a while before reporting what it heard
pub struct SlowRadio {
    listen: Option<Duration>,
    heard: Mutex<Option<Vec<Advertisement>>>,
}

impl SlowRadio {
    /// Listens for the full scan window, then returns `heard` once
    pub fn listening(heard: Vec<Advertisement>) -> Self {
        SlowRadio {
            listen: None,
            heard: Mutex::new(Some(heard)),
        }
    }

    /// Never finishes a scan in any reasonable time
    pub fn stuck() -> Self {
        SlowRadio {
            listen: Some(Duration::from_secs(3600)),
            heard: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Radio for SlowRadio {
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, ScanStartError> {
        sleep(self.listen.unwrap_or(window)).await;
        Ok(self.heard.lock().unwrap().take().unwrap_or_default())
    }
}

/// Sink that stores every batch it receives
#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<(MeasurementGroup, usize)>>,
}

impl MemorySink {
    pub fn points(&self) -> usize {
        self.stored.lock().unwrap().iter().map(|(_, n)| n).sum()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&self, batch: &Batch) -> Result<usize, WriteError> {
        self.stored.lock().unwrap().push((batch.group, batch.len()));
        Ok(batch.len())
    }
}

/// Sink that can never be reached
pub struct UnreachableSink;

#[async_trait]
impl Sink for UnreachableSink {
    async fn write(&self, _batch: &Batch) -> Result<usize, WriteError> {
        Err(WriteError::Unreachable("connection refused".into()))
    }
}
