/// Database operations for storing measurement batches
use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::config::{sensor_name, SensorConfig};
use crate::database::connection::ConnectionSettings;
use crate::database::sink::{Sink, SinkConnectError, WriteError};
use crate::models::{Batch, MeasurementGroup};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS environmental_data (
    sensor_mac TEXT NOT NULL,
    name TEXT NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    format SMALLINT NOT NULL,
    temperature DOUBLE PRECISION,
    humidity DOUBLE PRECISION,
    pressure DOUBLE PRECISION
);
CREATE TABLE IF NOT EXISTS motion_data (
    sensor_mac TEXT NOT NULL,
    name TEXT NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    format SMALLINT NOT NULL,
    acceleration_x DOUBLE PRECISION,
    acceleration_y DOUBLE PRECISION,
    acceleration_z DOUBLE PRECISION,
    movement_counter SMALLINT
);
CREATE TABLE IF NOT EXISTS power_data (
    sensor_mac TEXT NOT NULL,
    name TEXT NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    format SMALLINT NOT NULL,
    battery_voltage DOUBLE PRECISION,
    tx_power SMALLINT
);
CREATE TABLE IF NOT EXISTS signal_data (
    sensor_mac TEXT NOT NULL,
    name TEXT NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    format SMALLINT NOT NULL,
    rssi SMALLINT,
    measurement_sequence INTEGER
);
";

fn insert_statement(group: MeasurementGroup) -> &'static str {
    match group {
        MeasurementGroup::Environmental => {
            "INSERT INTO environmental_data(sensor_mac, name, time, format, temperature, humidity, pressure)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        }
        MeasurementGroup::Motion => {
            "INSERT INTO motion_data(sensor_mac, name, time, format, acceleration_x, acceleration_y, acceleration_z, movement_counter)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        }
        MeasurementGroup::Power => {
            "INSERT INTO power_data(sensor_mac, name, time, format, battery_voltage, tx_power)
             VALUES ($1, $2, $3, $4, $5, $6)"
        }
        MeasurementGroup::Signal => {
            "INSERT INTO signal_data(sensor_mac, name, time, format, rssi, measurement_sequence)
             VALUES ($1, $2, $3, $4, $5, $6)"
        }
    }
}

/// Create the measurement tables if they don't exist yet
pub async fn ensure_schema(client: &Client) -> Result<(), tokio_postgres::Error> {
    client.batch_execute(SCHEMA).await
}

/// Insert every reading of a batch in one transaction
///
/// Either the whole batch is committed or none of it is; a failing row
/// fails the batch.
///
/// # Returns
/// Number of rows inserted
pub async fn insert_batch(
    client: &mut Client,
    batch: &Batch,
    names: &HashMap<String, String>,
) -> Result<usize, tokio_postgres::Error> {
    let transaction = client.transaction().await?;
    let statement = transaction.prepare(insert_statement(batch.group)).await?;

    let mut inserted = 0;
    for reading in batch.readings() {
        let name = sensor_name(names, &reading.device_id);
        let format = i16::from(reading.format);
        let common: [&(dyn ToSql + Sync); 4] =
            [&reading.device_id, &name, &reading.captured.wall, &format];

        let rows = match batch.group {
            MeasurementGroup::Environmental => {
                let Some(env) = reading.environmental else {
                    continue;
                };
                let params: Vec<&(dyn ToSql + Sync)> = common
                    .iter()
                    .copied()
                    .chain([
                        &env.temperature as &(dyn ToSql + Sync),
                        &env.humidity,
                        &env.pressure,
                    ])
                    .collect();
                transaction.execute(&statement, &params).await?
            }
            MeasurementGroup::Motion => {
                let Some(motion) = reading.motion else {
                    continue;
                };
                let movement_counter = motion.movement_counter.map(i16::from);
                let params: Vec<&(dyn ToSql + Sync)> = common
                    .iter()
                    .copied()
                    .chain([
                        &motion.acceleration_x as &(dyn ToSql + Sync),
                        &motion.acceleration_y,
                        &motion.acceleration_z,
                        &movement_counter,
                    ])
                    .collect();
                transaction.execute(&statement, &params).await?
            }
            MeasurementGroup::Power => {
                let Some(power) = reading.power else {
                    continue;
                };
                let tx_power = power.tx_power.map(i16::from);
                let params: Vec<&(dyn ToSql + Sync)> = common
                    .iter()
                    .copied()
                    .chain([&power.battery_voltage as &(dyn ToSql + Sync), &tx_power])
                    .collect();
                transaction.execute(&statement, &params).await?
            }
            MeasurementGroup::Signal => {
                let sequence = reading.signal.measurement_sequence.map(i32::from);
                let params: Vec<&(dyn ToSql + Sync)> = common
                    .iter()
                    .copied()
                    .chain([&reading.signal.rssi as &(dyn ToSql + Sync), &sequence])
                    .collect();
                transaction.execute(&statement, &params).await?
            }
        };
        inserted += rows as usize;
    }

    transaction.commit().await?;
    Ok(inserted)
}

/// PostgreSQL (or TimescaleDB) sink holding one reusable connection.
///
/// A connection that breaks is dropped and re-established on the next write.
pub struct PostgresSink {
    settings: ConnectionSettings,
    names: HashMap<String, String>,
    write_timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl PostgresSink {
    /// Connect and prepare the schema. Failure here is fatal for the service.
    pub async fn connect(config: &SensorConfig) -> Result<Self, SinkConnectError> {
        let settings = ConnectionSettings::parse(&config.database_url)?;
        let client = settings.connect().await?;
        ensure_schema(&client)
            .await
            .map_err(SinkConnectError::Schema)?;
        info!("Database schema ready");

        Ok(PostgresSink {
            settings,
            names: config.tags.clone(),
            write_timeout: config.write_timeout,
            client: Mutex::new(Some(client)),
        })
    }

    async fn write_with(
        &self,
        slot: &mut Option<Client>,
        batch: &Batch,
    ) -> Result<usize, WriteError> {
        if slot.as_ref().map_or(true, Client::is_closed) {
            debug!("Reconnecting to database");
            let client = self
                .settings
                .connect()
                .await
                .map_err(|e| WriteError::Unreachable(e.to_string()))?;
            *slot = Some(client);
        }
        let client = slot
            .as_mut()
            .ok_or_else(|| WriteError::Unreachable("no connection".into()))?;

        Ok(insert_batch(client, batch, &self.names).await?)
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn write(&self, batch: &Batch) -> Result<usize, WriteError> {
        let mut slot = self.client.lock().await;

        let result = match timeout(self.write_timeout, self.write_with(&mut slot, batch)).await {
            Ok(result) => result,
            Err(_) => Err(WriteError::Timeout(self.write_timeout)),
        };

        if let Err(e) = &result {
            if e.is_transient() {
                warn!("Dropping database connection after failed write: {}", e);
                *slot = None;
            }
        }
        result
    }
}
