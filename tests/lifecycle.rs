mod common;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use common::{
    advertisement, config, environmental_reading, MemorySink, ScriptedRadio, SlowRadio,
    UnreachableSink, DEVICE,
};
use ruuvi_ingest::database::SinkConnectError;
use ruuvi_ingest::{Buffer, LifecycleState, Service, ServiceError};

fn seed(buffer: &Buffer, n: u64) {
    let base = Instant::now();
    for i in 0..n {
        buffer.add(environmental_reading(base, Duration::from_millis(i), 20.0));
    }
}

#[tokio::test(start_paused = true)]
async fn termination_flushes_everything_buffered() {
    let config = config(&[]);
    let sink = Arc::new(MemorySink::default());
    let service = Service::new(&config, Arc::new(ScriptedRadio::silent()), Arc::clone(&sink));
    seed(&service.buffer(), 52);
    let state = service.state();
    let buffer = service.buffer();

    let report = service.run(sleep(Duration::from_secs(5))).await.unwrap();

    assert_eq!(report.to_string(), "flushed 52/52");
    assert_eq!(report.lost, 0);
    assert!(!report.timed_out);
    assert_eq!(sink.points(), 52);
    assert!(buffer.is_empty());
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn unreachable_sink_reports_every_point_lost() {
    let config = config(&[("SHUTDOWN_TIMEOUT_SECS", "20")]);
    let service = Service::new(
        &config,
        Arc::new(ScriptedRadio::silent()),
        Arc::new(UnreachableSink),
    );
    seed(&service.buffer(), 52);

    let report = service.run(sleep(Duration::from_secs(5))).await.unwrap();

    assert_eq!(report.pending, 52);
    assert_eq!(report.flushed, 0);
    assert_eq!(report.lost, 52);
    assert!(report.to_string().starts_with("flushed 0/52"));
}

#[tokio::test(start_paused = true)]
async fn periodic_flush_runs_while_scanning() {
    let config = config(&[("FLUSH_INTERVAL_SECS", "60")]);
    let sink = Arc::new(MemorySink::default());
    let service = Service::new(&config, Arc::new(ScriptedRadio::silent()), Arc::clone(&sink));
    seed(&service.buffer(), 10);
    let metrics = service.metrics();

    let report = service.run(sleep(Duration::from_secs(90))).await.unwrap();

    assert_eq!(sink.points(), 10);
    assert_eq!(report.pending, 0);
    assert_eq!(report.to_string(), "flushed 0/0");
    assert_eq!(metrics.snapshot().points_written, 10);
}

#[tokio::test(start_paused = true)]
async fn fatal_scan_failure_still_drains() {
    let config = config(&[("MAX_CONSECUTIVE_SCAN_FAILURES", "2")]);
    let sink = Arc::new(MemorySink::default());
    let service = Service::new(&config, Arc::new(ScriptedRadio::broken()), Arc::clone(&sink));
    seed(&service.buffer(), 5);
    let state = service.state();

    let result = service.run(std::future::pending()).await;

    assert!(matches!(result, Err(ServiceError::Scan(_))));
    assert_eq!(sink.points(), 5);
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn termination_mid_scan_keeps_that_cycle() {
    let config = config(&[("SCAN_WINDOW_SECS", "10"), ("SCAN_INTERVAL_SECS", "30")]);
    let radio = SlowRadio::listening(vec![
        advertisement(DEVICE, 1),
        advertisement(DEVICE, 2),
        advertisement(DEVICE, 3),
    ]);
    let sink = Arc::new(MemorySink::default());
    let service = Service::new(&config, Arc::new(radio), Arc::clone(&sink));
    let registry = service.registry();

    // the first cycle listens from 0s to 10s
    let report = service.run(sleep(Duration::from_secs(4))).await.unwrap();

    // three readings with all four groups each
    assert_eq!(report.to_string(), "flushed 12/12");
    assert_eq!(sink.points(), 12);
    assert_eq!(registry.get(DEVICE).unwrap().readings_seen, 3);
}

#[tokio::test(start_paused = true)]
async fn stuck_scan_is_abandoned_and_buffer_still_drains() {
    let config = config(&[("SCAN_WINDOW_SECS", "10")]);
    let sink = Arc::new(MemorySink::default());
    let service = Service::new(&config, Arc::new(SlowRadio::stuck()), Arc::clone(&sink));
    seed(&service.buffer(), 5);
    let started = Instant::now();

    let report = service.run(sleep(Duration::from_secs(4))).await.unwrap();

    assert_eq!(report.to_string(), "flushed 5/5");
    // window plus grace after termination, far short of the stuck scan
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(sink.points(), 5);
}

#[tokio::test]
async fn starting_is_published_before_connecting() {
    let config = config(&[]);
    let (state, observer) = watch::channel(LifecycleState::Stopped);
    let seen = observer.clone();
    let connect = async move {
        assert_eq!(*seen.borrow(), LifecycleState::Starting);
        Ok::<_, SinkConnectError>(MemorySink::default())
    };

    let service = Service::start(&config, Arc::new(ScriptedRadio::silent()), connect, state)
        .await
        .unwrap();

    assert_eq!(*observer.borrow(), LifecycleState::Starting);
    assert_eq!(*service.state().borrow(), LifecycleState::Starting);
}

#[tokio::test]
async fn failed_sink_connection_is_fatal() {
    let config = config(&[]);
    let (state, observer) = watch::channel(LifecycleState::Starting);
    let connect = async { Err::<MemorySink, _>(SinkConnectError::InvalidUrl(url::ParseError::EmptyHost)) };

    let result = Service::start(&config, Arc::new(ScriptedRadio::silent()), connect, state).await;

    assert!(matches!(result, Err(ServiceError::SinkConnect(_))));
    assert_eq!(*observer.borrow(), LifecycleState::Stopped);
}
