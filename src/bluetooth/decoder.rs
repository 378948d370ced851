/// RuuviTag manufacturer data decoding
///
/// Decoding is a pure mapping from payload bytes to a `Reading`: fixed byte
/// offsets and scale factors per data format, no state and no I/O.
use thiserror::Error;

use crate::models::{Captured, Environmental, Motion, Power, Reading, Signal};

/// Physically plausible temperature band for a RuuviTag, in °C
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -60.0..=100.0;
/// Relative humidity can't exceed 100 %RH
const HUMIDITY_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unsupported data format {0}")]
    UnsupportedFormat(u8),

    #[error("truncated format {format} payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        format: u8,
        expected: usize,
        actual: usize,
    },

    #[error("{field} out of range: {value}")]
    ChecksumOrRangeViolation { field: &'static str, value: f64 },
}

/// Data formats this decoder understands, keyed by the payload's first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// RAWv1, 14 bytes
    Rawv1,
    /// RAWv2, 24 bytes
    Rawv2,
}

impl TryFrom<u8> for DataFormat {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(DataFormat::Rawv1),
            5 => Ok(DataFormat::Rawv2),
            other => Err(DecodeError::UnsupportedFormat(other)),
        }
    }
}

impl DataFormat {
    pub fn version(self) -> u8 {
        match self {
            DataFormat::Rawv1 => 3,
            DataFormat::Rawv2 => 5,
        }
    }

    /// Payload length including the format byte
    pub fn payload_len(self) -> usize {
        match self {
            DataFormat::Rawv1 => 14,
            DataFormat::Rawv2 => 24,
        }
    }
}

/// Decode a RuuviTag manufacturer data payload into a `Reading`
///
/// The first byte selects the data format. Values the sensor marks as "not
/// available" decode to `None`; values outside a physically plausible range
/// reject the whole payload.
///
/// # Arguments
/// * `device_id` - Hardware address the broadcast came from
/// * `payload` - Raw manufacturer data bytes (company id already stripped)
/// * `rssi` - Received signal strength reported by the radio
/// * `captured` - When the broadcast was received
pub fn decode(
    device_id: &str,
    payload: &[u8],
    rssi: Option<i16>,
    captured: Captured,
) -> Result<Reading, DecodeError> {
    let format_byte = *payload.first().ok_or(DecodeError::TruncatedPayload {
        format: 0,
        expected: 1,
        actual: 0,
    })?;
    let format = DataFormat::try_from(format_byte)?;

    if payload.len() < format.payload_len() {
        return Err(DecodeError::TruncatedPayload {
            format: format.version(),
            expected: format.payload_len(),
            actual: payload.len(),
        });
    }

    let fields = match format {
        DataFormat::Rawv1 => decode_rawv1(payload)?,
        DataFormat::Rawv2 => decode_rawv2(payload)?,
    };

    Ok(Reading {
        device_id: device_id.to_uppercase(),
        format: format.version(),
        captured,
        environmental: fields.environmental,
        motion: fields.motion,
        power: fields.power,
        signal: Signal {
            rssi,
            measurement_sequence: fields.measurement_sequence,
        },
    })
}

struct Fields {
    environmental: Option<Environmental>,
    motion: Option<Motion>,
    power: Option<Power>,
    measurement_sequence: Option<u16>,
}

fn be_i16(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn check_range(
    field: &'static str,
    value: Option<f64>,
    range: &std::ops::RangeInclusive<f64>,
) -> Result<Option<f64>, DecodeError> {
    match value {
        Some(v) if !range.contains(&v) => {
            Err(DecodeError::ChecksumOrRangeViolation { field, value: v })
        }
        other => Ok(other),
    }
}

/// Decode data format 5 (RAWv2)
///
/// - Byte 0: Data format (5)
/// - Bytes 1-2: Temperature (signed 16-bit, 0.005°C resolution)
/// - Bytes 3-4: Humidity (unsigned 16-bit, 0.0025% resolution)
/// - Bytes 5-6: Pressure (unsigned 16-bit, +50000 Pa offset, 1 Pa resolution)
/// - Bytes 7-12: Acceleration X/Y/Z (signed 16-bit, 0.001 g resolution)
/// - Bytes 13-14: Battery voltage (11 bits, mV above 1600) + TX power (5 bits, 2 dBm steps above -40)
/// - Byte 15: Movement counter
/// - Bytes 16-17: Measurement sequence number
/// - Bytes 18-23: MAC address (not used here, we get it from BLE)
fn decode_rawv2(data: &[u8]) -> Result<Fields, DecodeError> {
    let temperature = match be_i16(data, 1) {
        i16::MIN => None,
        raw => Some(f64::from(raw) * 0.005),
    };
    let humidity = match be_u16(data, 3) {
        u16::MAX => None,
        raw => Some(f64::from(raw) * 0.0025),
    };
    let pressure = match be_u16(data, 5) {
        u16::MAX => None,
        raw => Some((f64::from(raw) + 50000.0) / 100.0),
    };

    let temperature = check_range("temperature", temperature, &TEMPERATURE_RANGE)?;
    let humidity = check_range("humidity", humidity, &HUMIDITY_RANGE)?;

    let acceleration = |offset| match be_i16(data, offset) {
        i16::MIN => None,
        raw => Some(f64::from(raw) / 1000.0),
    };
    let acceleration_x = acceleration(7);
    let acceleration_y = acceleration(9);
    let acceleration_z = acceleration(11);

    let power_info = be_u16(data, 13);
    let battery_voltage = match power_info >> 5 {
        0x7FF => None,
        mv => Some((f64::from(mv) + 1600.0) / 1000.0),
    };
    let tx_power = match power_info & 0x1F {
        0x1F => None,
        steps => Some(steps as i8 * 2 - 40),
    };

    let movement_counter = match data[15] {
        0xFF => None,
        count => Some(count),
    };
    let measurement_sequence = match be_u16(data, 16) {
        u16::MAX => None,
        seq => Some(seq),
    };

    let environmental = Environmental {
        temperature,
        humidity,
        pressure,
    };
    let motion = Motion {
        acceleration_x,
        acceleration_y,
        acceleration_z,
        movement_counter,
    };
    let power = Power {
        battery_voltage,
        tx_power,
    };

    Ok(Fields {
        environmental: (temperature.is_some() || humidity.is_some() || pressure.is_some())
            .then_some(environmental),
        motion: (acceleration_x.is_some()
            || acceleration_y.is_some()
            || acceleration_z.is_some()
            || movement_counter.is_some())
        .then_some(motion),
        power: (battery_voltage.is_some() || tx_power.is_some()).then_some(power),
        measurement_sequence,
    })
}

/// Decode data format 3 (RAWv1)
///
/// - Byte 1: Humidity (0.5% resolution)
/// - Byte 2: Temperature integer part, MSB is the sign
/// - Byte 3: Temperature hundredths
/// - Bytes 4-5: Pressure (unsigned 16-bit, +50000 Pa offset)
/// - Bytes 6-11: Acceleration X/Y/Z (signed 16-bit, mg)
/// - Bytes 12-13: Battery voltage (mV)
fn decode_rawv1(data: &[u8]) -> Result<Fields, DecodeError> {
    let humidity = f64::from(data[1]) * 0.5;

    let magnitude = f64::from(data[2] & 0x7F) + f64::from(data[3]) / 100.0;
    let temperature = if data[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    let pressure = (f64::from(be_u16(data, 4)) + 50000.0) / 100.0;

    let temperature = check_range("temperature", Some(temperature), &TEMPERATURE_RANGE)?;
    let humidity = check_range("humidity", Some(humidity), &HUMIDITY_RANGE)?;

    Ok(Fields {
        environmental: Some(Environmental {
            temperature,
            humidity,
            pressure: Some(pressure),
        }),
        motion: Some(Motion {
            acceleration_x: Some(f64::from(be_i16(data, 6)) / 1000.0),
            acceleration_y: Some(f64::from(be_i16(data, 8)) / 1000.0),
            acceleration_z: Some(f64::from(be_i16(data, 10)) / 1000.0),
            movement_counter: None,
        }),
        power: Some(Power {
            battery_voltage: Some(f64::from(be_u16(data, 12)) / 1000.0),
            tx_power: None,
        }),
        measurement_sequence: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "cb:b8:33:4c:88:4f";

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn approx(a: Option<f64>, b: f64) {
        let a = a.expect("value should be available");
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    /// Re-encode a format 5 reading back into the raw integer fields
    fn encode_rawv2(reading: &Reading) -> Vec<u8> {
        let env = reading.environmental.unwrap();
        let motion = reading.motion.unwrap();
        let power = reading.power.unwrap();
        let mut out = vec![5u8];
        out.extend(((env.temperature.unwrap() / 0.005).round() as i16).to_be_bytes());
        out.extend(((env.humidity.unwrap() / 0.0025).round() as u16).to_be_bytes());
        out.extend(((env.pressure.unwrap() * 100.0 - 50000.0).round() as u16).to_be_bytes());
        for acc in [
            motion.acceleration_x,
            motion.acceleration_y,
            motion.acceleration_z,
        ] {
            out.extend(((acc.unwrap() * 1000.0).round() as i16).to_be_bytes());
        }
        let mv = (power.battery_voltage.unwrap() * 1000.0 - 1600.0).round() as u16;
        let tx = ((i16::from(power.tx_power.unwrap()) + 40) / 2) as u16;
        out.extend(((mv << 5) | tx).to_be_bytes());
        out.push(motion.movement_counter.unwrap());
        out.extend(reading.signal.measurement_sequence.unwrap().to_be_bytes());
        out
    }

    #[test]
    fn decodes_format_5_valid_payload() {
        let payload = hex("0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F");
        let reading = decode(DEVICE, &payload, Some(-71), Captured::now()).unwrap();

        assert_eq!(reading.device_id, "CB:B8:33:4C:88:4F");
        assert_eq!(reading.format, 5);
        let env = reading.environmental.unwrap();
        approx(env.temperature, 24.3);
        approx(env.humidity, 53.49);
        approx(env.pressure, 1000.44);
        let motion = reading.motion.unwrap();
        approx(motion.acceleration_x, 0.004);
        approx(motion.acceleration_y, -0.004);
        approx(motion.acceleration_z, 1.036);
        assert_eq!(motion.movement_counter, Some(66));
        let power = reading.power.unwrap();
        approx(power.battery_voltage, 2.977);
        assert_eq!(power.tx_power, Some(4));
        assert_eq!(reading.signal.rssi, Some(-71));
        assert_eq!(reading.signal.measurement_sequence, Some(205));
    }

    #[test]
    fn format_5_reencodes_to_the_same_bytes() {
        for payload in [
            "0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F",
            "05F060000000000000000000000000000000000000000000",
            "0500010FA0FFFE03E8FC18000A7FC17FFFFECBB8334C884F",
        ] {
            let bytes = hex(payload);
            let reading = decode(DEVICE, &bytes, None, Captured::now()).unwrap();
            assert_eq!(encode_rawv2(&reading), bytes[..18].to_vec(), "{}", payload);
        }
    }

    #[test]
    fn not_available_values_decode_to_none() {
        let payload = hex("058000FFFFFFFF800080008000FFFFFFFFFFFFFFFFFFFFFF");
        let reading = decode(DEVICE, &payload, None, Captured::now()).unwrap();

        assert!(reading.environmental.is_none());
        assert!(reading.motion.is_none());
        assert!(reading.power.is_none());
        assert_eq!(reading.signal.measurement_sequence, None);
        assert_eq!(reading.groups().count(), 0);
    }

    #[test]
    fn implausible_temperature_is_rejected() {
        let payload = hex("057FFFFFFEFFFE7FFF7FFF7FFFFFDEFEFFFECBB8334C884F");
        let err = decode(DEVICE, &payload, None, Captured::now()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ChecksumOrRangeViolation {
                field: "temperature",
                ..
            }
        ));
    }

    #[test]
    fn humidity_above_100_is_rejected() {
        // temperature 20 °C, humidity 0xFFFE * 0.0025 = 163.835 %
        let payload = hex("050FA0FFFEC37C0004FFFC040CAC364200CDCBB8334C884F");
        let err = decode(DEVICE, &payload, None, Captured::now()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ChecksumOrRangeViolation {
                field: "humidity",
                ..
            }
        ));
    }

    #[test]
    fn short_payload_is_truncated() {
        let payload = hex("0512FC5394C37C");
        assert_eq!(
            decode(DEVICE, &payload, None, Captured::now()).unwrap_err(),
            DecodeError::TruncatedPayload {
                format: 5,
                expected: 24,
                actual: 7
            }
        );
        assert!(matches!(
            decode(DEVICE, &[], None, Captured::now()).unwrap_err(),
            DecodeError::TruncatedPayload { actual: 0, .. }
        ));
    }

    #[test]
    fn unknown_format_is_unsupported() {
        let payload = hex("0812FC5394C37C0004FFFC040CAC364200CDCBB8334C884F");
        assert_eq!(
            decode(DEVICE, &payload, None, Captured::now()).unwrap_err(),
            DecodeError::UnsupportedFormat(8)
        );
    }

    #[test]
    fn decodes_format_3_payload() {
        let payload = hex("03291A1ECE1EFC18F94202CA0B53");
        let reading = decode(DEVICE, &payload, Some(-60), Captured::now()).unwrap();

        assert_eq!(reading.format, 3);
        let env = reading.environmental.unwrap();
        approx(env.humidity, 20.5);
        approx(env.temperature, 26.3);
        approx(env.pressure, 1027.66);
        let motion = reading.motion.unwrap();
        approx(motion.acceleration_x, -1.0);
        approx(motion.acceleration_y, -1.726);
        approx(motion.acceleration_z, 0.714);
        assert_eq!(motion.movement_counter, None);
        approx(reading.power.unwrap().battery_voltage, 2.899);
        assert_eq!(reading.signal.measurement_sequence, None);
    }

    #[test]
    fn format_3_negative_temperature() {
        let payload = hex("03299A1ECE1EFC18F94202CA0B53");
        let reading = decode(DEVICE, &payload, None, Captured::now()).unwrap();
        approx(reading.environmental.unwrap().temperature, -26.3);
    }
}
