//! Delivery of drained batches to the upstream store.
//!
//! A batch is either delivered or handed back to the buffer; it is never
//! dropped on the floor. That holds even when the write future is cancelled
//! mid-flight, because the batch sits in a guard that requeues it on drop.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::time::{sleep, Duration};

use crate::buffer::Buffer;
use crate::config::SensorConfig;
use crate::database::sink::{Sink, WriteError};
use crate::metrics::Metrics;
use crate::models::{Batch, MeasurementGroup};
use crate::utils::backoff_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SensorConfig) -> Self {
        RetryPolicy {
            max_attempts: config.write_max_attempts.max(1),
            backoff_base: config.write_backoff_base,
            backoff_max: config.write_backoff_max,
        }
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// Stored; never sent again
    Delivered { points: usize },
    /// Retries exhausted, batch is back in the buffer
    Requeued { points: usize, error: WriteError },
}

/// Running totals for one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    pub points: usize,
    pub written: usize,
    pub requeued: usize,
}

/// Holds a batch while it is being written and returns it to the buffer
/// unless delivery is confirmed.
struct RequeueGuard<'a> {
    buffer: &'a Buffer,
    metrics: &'a Metrics,
    batch: Batch,
    armed: bool,
}

impl<'a> RequeueGuard<'a> {
    fn new(buffer: &'a Buffer, metrics: &'a Metrics, batch: Batch) -> Self {
        RequeueGuard {
            buffer,
            metrics,
            batch,
            armed: true,
        }
    }

    fn delivered(mut self) {
        self.armed = false;
    }
}

impl Drop for RequeueGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let group = self.batch.group;
            let batch = std::mem::replace(&mut self.batch, Batch::new(group));
            debug!("Returning {} {} points to the buffer", batch.len(), batch.group);
            self.metrics.record_requeued(batch.len());
            self.buffer.requeue(batch);
        }
    }
}

pub struct UpstreamWriter<S: Sink> {
    sink: Arc<S>,
    buffer: Arc<Buffer>,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
}

impl<S: Sink> UpstreamWriter<S> {
    pub fn new(sink: Arc<S>, buffer: Arc<Buffer>, metrics: Arc<Metrics>, policy: RetryPolicy) -> Self {
        UpstreamWriter {
            sink,
            buffer,
            metrics,
            policy,
        }
    }

    /// Write one batch, retrying transient failures with exponential backoff.
    ///
    /// No buffer lock is held while the sink is being called.
    pub async fn write(&self, batch: Batch) -> WriteOutcome {
        let group = batch.group;
        let points = batch.len();
        let guard = RequeueGuard::new(&self.buffer, &self.metrics, batch);

        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            let result = self.sink.write(&guard.batch).await;
            match result {
                Ok(written) => {
                    guard.delivered();
                    self.metrics.record_written(written);
                    debug!("Wrote {} {} points (attempt {})", written, group, attempt);
                    return WriteOutcome::Delivered { points: written };
                }
                Err(e) => {
                    self.metrics.record_write_failure();
                    if !e.is_transient() || attempt >= self.policy.max_attempts {
                        break e;
                    }
                    let delay = backoff_delay(self.policy.backoff_base, self.policy.backoff_max, attempt);
                    warn!(
                        "Writing {} {} points failed (attempt {}/{}): {}, retrying in {:?}",
                        points, group, attempt, self.policy.max_attempts, e, delay
                    );
                    sleep(delay).await;
                }
            }
        };

        error!(
            "Giving up on {} {} points after {} attempts: {}; kept in buffer for the next flush",
            points, group, attempt, error
        );
        drop(guard);
        WriteOutcome::Requeued { points, error }
    }

    /// Drain and write every measurement group, one group at a time.
    ///
    /// Groups are detached only right before they are written, so a flush
    /// that is cancelled part-way leaves the remaining groups in the buffer.
    /// Totals are accumulated into `report` as batches complete.
    pub async fn flush(&self, report: &mut FlushReport) {
        for group in MeasurementGroup::ALL {
            for batch in self.buffer.drain(Some(group)) {
                report.batches += 1;
                report.points += batch.len();
                match self.write(batch).await {
                    WriteOutcome::Delivered { points } => report.written += points,
                    WriteOutcome::Requeued { points, .. } => report.requeued += points,
                }
            }
        }
        if report.batches > 0 {
            info!(
                "Flushed {}/{} points in {} batches ({} requeued)",
                report.written, report.points, report.batches, report.requeued
            );
        }
    }
}
