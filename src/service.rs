//! Service lifecycle: Starting -> Running -> Draining -> Stopped.
//!
//! While running, the scan loop and the flush loop are two independent tasks
//! that only meet in the buffer. A termination request stops new scan cycles,
//! lets an in-flight cycle finish, then drains and writes everything that is
//! buffered within the shutdown timeout.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use crate::bluetooth::radio::Radio;
use crate::bluetooth::scanner::{ScanLoop, ScanLoopError, ScanSettings};
use crate::buffer::Buffer;
use crate::config::SensorConfig;
use crate::database::sink::{Sink, SinkConnectError};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::utils::{format_datetime, stop_requested};
use crate::writer::{FlushReport, RetryPolicy, UpstreamWriter};

/// Extra time an in-flight scan gets beyond its window before it is abandoned
const SCAN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("could not connect to the database: {0}")]
    SinkConnect(#[from] SinkConnectError),

    #[error(transparent)]
    Scan(#[from] ScanLoopError),

    #[error("{0} task failed: {1}")]
    TaskFailed(&'static str, String),
}

/// Outcome of the final drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Points buffered when draining began
    pub pending: usize,
    pub flushed: usize,
    pub lost: usize,
    pub timed_out: bool,
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flushed {}/{}", self.flushed, self.pending)?;
        if self.lost > 0 {
            write!(f, ", lost {}", self.lost)?;
        }
        if self.timed_out {
            write!(f, " (shutdown timeout reached)")?;
        }
        Ok(())
    }
}

pub struct Service<R: Radio + 'static, S: Sink + 'static> {
    radio: Arc<R>,
    registry: Arc<Registry>,
    buffer: Arc<Buffer>,
    metrics: Arc<Metrics>,
    writer: Arc<UpstreamWriter<S>>,
    scan_settings: ScanSettings,
    flush_interval: Duration,
    shutdown_timeout: Duration,
    state: watch::Sender<LifecycleState>,
}

impl<R: Radio + 'static, S: Sink + 'static> Service<R, S> {
    /// Starting phase: wait for the sink connection, then build the service.
    ///
    /// `state` is published as `Starting` before connecting, so observers
    /// subscribed to it see every phase. There is no point running without a
    /// sink, so a failed connection is returned as a fatal error.
    pub async fn start<F>(
        config: &SensorConfig,
        radio: Arc<R>,
        connect: F,
        state: watch::Sender<LifecycleState>,
    ) -> Result<Self, ServiceError>
    where
        F: Future<Output = Result<S, SinkConnectError>>,
    {
        state.send_replace(LifecycleState::Starting);
        info!("Starting RuuviTag ingestion service");
        let sink = match connect.await {
            Ok(sink) => sink,
            Err(e) => {
                error!("Failed to connect to the database: {}", e);
                state.send_replace(LifecycleState::Stopped);
                return Err(ServiceError::SinkConnect(e));
            }
        };
        Ok(Self::build(config, radio, Arc::new(sink), state))
    }

    /// Build a service around an already connected sink
    pub fn new(config: &SensorConfig, radio: Arc<R>, sink: Arc<S>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self::build(config, radio, sink, state)
    }

    fn build(
        config: &SensorConfig,
        radio: Arc<R>,
        sink: Arc<S>,
        state: watch::Sender<LifecycleState>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let buffer = Arc::new(Buffer::with_metrics(
            config.buffer_capacity,
            Arc::clone(&metrics),
        ));
        let writer = Arc::new(UpstreamWriter::new(
            sink,
            Arc::clone(&buffer),
            Arc::clone(&metrics),
            RetryPolicy::from_config(config),
        ));

        Service {
            radio,
            registry: Arc::new(Registry::new()),
            buffer,
            metrics,
            writer,
            scan_settings: ScanSettings::from_config(config),
            flush_interval: config.flush_interval,
            shutdown_timeout: config.shutdown_timeout,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn buffer(&self) -> Arc<Buffer> {
        Arc::clone(&self.buffer)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn enter(&self, state: LifecycleState) {
        info!("Service state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Run until `termination` resolves or scanning fails for good, then drain.
    ///
    /// The final drain happens in both cases. Only a fatal scan failure (or a
    /// crashed task) is returned as an error; undelivered points are reported
    /// in the `ShutdownReport`.
    pub async fn run<F>(self, termination: F) -> Result<ShutdownReport, ServiceError>
    where
        F: Future<Output = ()>,
    {
        self.enter(LifecycleState::Running);
        info!(
            "Running since {}",
            format_datetime(&time::OffsetDateTime::now_utc())
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let scan_loop = ScanLoop::new(
            Arc::clone(&self.radio),
            Arc::clone(&self.registry),
            Arc::clone(&self.buffer),
            Arc::clone(&self.metrics),
            self.scan_settings.clone(),
        );
        let mut scan_task = tokio::spawn(scan_loop.run(stop_rx.clone()));
        let flush_task = tokio::spawn(flush_loop(
            Arc::clone(&self.writer),
            Arc::clone(&self.metrics),
            self.flush_interval,
            stop_rx,
        ));

        tokio::pin!(termination);
        let finished_early = tokio::select! {
            _ = &mut termination => {
                info!("Termination requested");
                None
            }
            result = &mut scan_task => Some(result),
        };

        self.enter(LifecycleState::Draining);
        let _ = stop_tx.send(true);

        let scan_result = match finished_early {
            Some(result) => result,
            None => {
                let bound = self.scan_settings.window + SCAN_GRACE;
                match timeout(bound, &mut scan_task).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Scan did not finish within {:?}, abandoning it", bound);
                        scan_task.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        if let Err(e) = flush_task.await {
            error!("Flush task failed: {}", e);
        }

        let report = self.final_flush().await;
        self.enter(LifecycleState::Stopped);
        info!("Final metrics: {}", self.metrics.snapshot());

        match scan_result {
            Ok(Ok(())) => Ok(report),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ServiceError::TaskFailed("scan", e.to_string())),
        }
    }

    /// Drain every group and write it, bounded by the shutdown timeout
    async fn final_flush(&self) -> ShutdownReport {
        let pending = self.buffer.len();
        info!("Draining {} buffered points", pending);

        let mut flush = FlushReport::default();
        let timed_out = timeout(self.shutdown_timeout, self.writer.flush(&mut flush))
            .await
            .is_err();

        let report = ShutdownReport {
            pending,
            flushed: flush.written,
            lost: pending.saturating_sub(flush.written),
            timed_out,
        };
        if report.lost > 0 {
            error!("Shutdown {}: {} points were not delivered", report, report.lost);
        } else {
            info!("Shutdown {}", report);
        }
        report
    }
}

/// Periodically drain the buffer into the sink, independent of scanning
async fn flush_loop<S: Sink>(
    writer: Arc<UpstreamWriter<S>>,
    metrics: Arc<Metrics>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and there is nothing to flush yet
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        let mut report = FlushReport::default();
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => {
                warn!("Flush interrupted by shutdown, unfinished batches stay buffered");
                break;
            }
            _ = writer.flush(&mut report) => {}
        }
        info!("Metrics: {}", metrics.snapshot());
    }
}
