//! Process-wide counters for the ingestion pipeline.
//!
//! Failures that are absorbed locally (bad payloads, failed writes, evictions)
//! only become visible through these counters and the log lines that report
//! them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    scan_cycles: AtomicU64,
    scan_failures: AtomicU64,
    last_scan_millis: AtomicU64,
    last_scan_devices: AtomicU64,
    broadcasts: AtomicU64,
    decode_errors: AtomicU64,
    duplicates: AtomicU64,
    accepted: AtomicU64,
    evicted: AtomicU64,
    points_written: AtomicU64,
    write_failures: AtomicU64,
    requeued_points: AtomicU64,
}

/// Copy of all counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub scan_cycles: u64,
    pub scan_failures: u64,
    pub last_scan_millis: u64,
    pub last_scan_devices: u64,
    pub broadcasts: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    pub accepted: u64,
    pub evicted: u64,
    pub points_written: u64,
    pub write_failures: u64,
    pub requeued_points: u64,
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scan(&self, duration: Duration, devices: usize) {
        add(&self.scan_cycles, 1);
        self.last_scan_millis
            .store(duration.as_millis() as u64, Ordering::Relaxed);
        self.last_scan_devices
            .store(devices as u64, Ordering::Relaxed);
    }

    pub fn record_scan_failure(&self) {
        add(&self.scan_failures, 1);
    }

    pub fn record_broadcasts(&self, n: usize) {
        add(&self.broadcasts, n as u64);
    }

    pub fn record_decode_error(&self) {
        add(&self.decode_errors, 1);
    }

    pub fn record_duplicate(&self) {
        add(&self.duplicates, 1);
    }

    pub fn record_accepted(&self) {
        add(&self.accepted, 1);
    }

    pub fn record_evicted(&self, n: u64) {
        add(&self.evicted, n);
    }

    pub fn record_written(&self, points: usize) {
        add(&self.points_written, points as u64);
    }

    pub fn record_write_failure(&self) {
        add(&self.write_failures, 1);
    }

    pub fn record_requeued(&self, points: usize) {
        add(&self.requeued_points, points as u64);
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            scan_cycles: load(&self.scan_cycles),
            scan_failures: load(&self.scan_failures),
            last_scan_millis: load(&self.last_scan_millis),
            last_scan_devices: load(&self.last_scan_devices),
            broadcasts: load(&self.broadcasts),
            decode_errors: load(&self.decode_errors),
            duplicates: load(&self.duplicates),
            accepted: load(&self.accepted),
            evicted: load(&self.evicted),
            points_written: load(&self.points_written),
            write_failures: load(&self.write_failures),
            requeued_points: load(&self.requeued_points),
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scans={} scan_failures={} last_scan={}ms/{} devices broadcasts={} accepted={} \
             duplicates={} decode_errors={} evicted={} written={} write_failures={} requeued={}",
            self.scan_cycles,
            self.scan_failures,
            self.last_scan_millis,
            self.last_scan_devices,
            self.broadcasts,
            self.accepted,
            self.duplicates,
            self.decode_errors,
            self.evicted,
            self.points_written,
            self.write_failures,
            self.requeued_points,
        )
    }
}
