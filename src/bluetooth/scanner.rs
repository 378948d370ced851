/// Periodic RuuviTag scanning: radio -> decoder -> registry -> buffer
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::bluetooth::decoder::decode;
use crate::bluetooth::radio::{Radio, ScanStartError};
use crate::buffer::Buffer;
use crate::config::{sensor_name, SensorConfig};
use crate::metrics::Metrics;
use crate::registry::{Observation, Registry};
use crate::utils::stop_requested;

#[derive(Debug, Error)]
pub enum ScanLoopError {
    #[error("{failures} consecutive scans failed to start, last error: {last}")]
    TooManyScanFailures {
        failures: u32,
        #[source]
        last: ScanStartError,
    },
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub interval: Duration,
    pub window: Duration,
    pub max_consecutive_failures: u32,
    pub staleness_threshold: Duration,
    /// Allowlist with display names; empty accepts every sensor
    pub tags: HashMap<String, String>,
}

impl ScanSettings {
    pub fn from_config(config: &SensorConfig) -> Self {
        ScanSettings {
            interval: config.scan_interval,
            window: config.scan_window,
            max_consecutive_failures: config.max_consecutive_scan_failures,
            staleness_threshold: config.staleness_threshold,
            tags: config.tags.clone(),
        }
    }
}

/// What one scan cycle saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub duration: Duration,
    pub broadcasts: usize,
    pub devices: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub decode_failures: usize,
    pub ignored: usize,
}

pub struct ScanLoop<R: Radio> {
    radio: Arc<R>,
    registry: Arc<Registry>,
    buffer: Arc<Buffer>,
    metrics: Arc<Metrics>,
    settings: ScanSettings,
    started: Instant,
    reported_stale: HashSet<String>,
}

impl<R: Radio> ScanLoop<R> {
    pub fn new(
        radio: Arc<R>,
        registry: Arc<Registry>,
        buffer: Arc<Buffer>,
        metrics: Arc<Metrics>,
        settings: ScanSettings,
    ) -> Self {
        ScanLoop {
            radio,
            registry,
            buffer,
            metrics,
            settings,
            started: Instant::now(),
            reported_stale: HashSet::new(),
        }
    }

    /// Scan on every interval tick until a stop is requested.
    ///
    /// A cycle that has started always runs to the end of its scan window;
    /// the stop request is only checked between cycles. Returns an error once
    /// more than `max_consecutive_failures` scans in a row fail to start.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), ScanLoopError> {
        info!(
            "Scan loop started: every {:?}, listening {:?} per cycle",
            self.settings.interval, self.settings.window
        );
        self.started = Instant::now();

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    info!("Scan loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.scan_cycle().await {
                Ok(summary) => {
                    if failures > 0 {
                        info!("Scanning recovered after {} failed attempts", failures);
                    }
                    failures = 0;
                    info!(
                        "Scan finished in {:.1}s: {} broadcasts from {} devices, {} new readings, {} duplicates, {} undecodable",
                        summary.duration.as_secs_f64(),
                        summary.broadcasts,
                        summary.devices,
                        summary.accepted,
                        summary.duplicates,
                        summary.decode_failures
                    );
                    self.report_staleness();
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.record_scan_failure();
                    if failures > self.settings.max_consecutive_failures {
                        error!("Giving up after {} consecutive scan failures: {}", failures, e);
                        return Err(ScanLoopError::TooManyScanFailures { failures, last: e });
                    }
                    warn!(
                        "Scan failed ({}/{}): {}",
                        failures, self.settings.max_consecutive_failures, e
                    );
                }
            }
        }
    }

    /// Run one Scanning phase and feed everything it heard downstream
    pub async fn scan_cycle(&self) -> Result<CycleSummary, ScanStartError> {
        let started = Instant::now();
        let advertisements = self.radio.scan(self.settings.window).await?;

        let mut summary = CycleSummary {
            broadcasts: advertisements.len(),
            ..Default::default()
        };
        let mut devices = HashSet::new();

        for adv in advertisements {
            if !self.settings.tags.is_empty() && !self.settings.tags.contains_key(&adv.device_id) {
                summary.ignored += 1;
                continue;
            }
            devices.insert(adv.device_id.clone());

            let reading = match decode(&adv.device_id, &adv.payload, adv.rssi, adv.received) {
                Ok(reading) => Arc::new(reading),
                Err(e) => {
                    debug!("Dropping payload from {}: {}", adv.device_id, e);
                    self.metrics.record_decode_error();
                    summary.decode_failures += 1;
                    continue;
                }
            };

            match self.registry.observe(Arc::clone(&reading)) {
                Observation::Recorded(state) => {
                    if let Some(env) = reading.environmental {
                        debug!(
                            "Received data from {}: temp={:?}°C, humidity={:?}%, pressure={:?} hPa (#{})",
                            adv.device_id,
                            env.temperature,
                            env.humidity,
                            env.pressure,
                            state.readings_seen
                        );
                    }
                    self.buffer.add(reading);
                    self.metrics.record_accepted();
                    summary.accepted += 1;
                }
                Observation::Duplicate(_) => {
                    self.metrics.record_duplicate();
                    summary.duplicates += 1;
                }
            }
        }

        summary.devices = devices.len();
        summary.duration = started.elapsed();
        self.metrics.record_broadcasts(summary.broadcasts);
        self.metrics.record_scan(summary.duration, summary.devices);
        Ok(summary)
    }

    /// Warn once when a sensor goes quiet, and again when it returns.
    ///
    /// With an allowlist every configured sensor is watched; otherwise only
    /// sensors heard since startup are.
    fn report_staleness(&mut self) -> StalenessChanges {
        let now = Instant::now();
        let threshold = self.settings.staleness_threshold;

        let stale: HashSet<String> = if self.settings.tags.is_empty() {
            self.registry
                .stale_devices(now, threshold)
                .into_iter()
                .collect()
        } else {
            // Sensors never heard from get the same grace period after startup
            let warming_up = now.saturating_duration_since(self.started) <= threshold;
            self.settings
                .tags
                .keys()
                .filter(|mac| {
                    let never_seen = self.registry.get(mac).is_none();
                    self.registry.is_stale(mac, now, threshold) && !(never_seen && warming_up)
                })
                .cloned()
                .collect()
        };

        let mut changes = StalenessChanges::default();
        for mac in &stale {
            if self.reported_stale.insert(mac.clone()) {
                let name = sensor_name(&self.settings.tags, mac);
                warn!("Sensor {} ({}) not seen for over {:?}", name, mac, threshold);
                changes.newly_stale.push(mac.clone());
            }
        }
        self.reported_stale.retain(|mac| {
            if stale.contains(mac) {
                return true;
            }
            info!(
                "Sensor {} ({}) is reachable again",
                sensor_name(&self.settings.tags, mac),
                mac
            );
            changes.recovered.push(mac.clone());
            false
        });
        changes.newly_stale.sort();
        changes.recovered.sort();
        changes
    }
}

/// Staleness transitions seen by one check
#[derive(Debug, Default, PartialEq, Eq)]
struct StalenessChanges {
    newly_stale: Vec<String>,
    recovered: Vec<String>,
}
