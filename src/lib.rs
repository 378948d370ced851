//! RuuviTag ingestion service.
//!
//! Scans for RuuviTag Bluetooth LE broadcasts, decodes them, buffers the
//! readings in memory and writes them in batches to PostgreSQL. The binary in
//! `main.rs` only wires configuration, logging and signals around
//! [`service::Service`].

pub mod bluetooth;
pub mod buffer;
pub mod config;
pub mod database;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod service;
pub mod utils;
pub mod writer;

pub use buffer::Buffer;
pub use config::{ConfigError, SensorConfig};
pub use models::{Batch, MeasurementGroup, Reading};
pub use registry::{DeviceState, Observation, Registry};
pub use service::{LifecycleState, Service, ServiceError, ShutdownReport};
pub use writer::{UpstreamWriter, WriteOutcome};
