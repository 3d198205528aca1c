//! MQTT payload parsing
//!
//! Turns a raw broker payload into a `DeviceReading` according to the
//! device's configured format. A payload that cannot be parsed is dropped
//! and counted, never surfaced as a `Bad` reading: the measurement simply
//! does not exist.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use fl_common::DeviceReading;
use fl_config::{DataType, MqttDeviceConfig, PayloadFormat};

const DEFAULT_CHANNEL_PATH: &str = "$.channel";
const DEFAULT_VALUE_PATH: &str = "$.value";

#[derive(Debug, Default)]
pub struct PayloadProcessor {
    dropped: AtomicU64,
}

impl PayloadProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages that failed to parse since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Parse one message for `device`. Returns None when the payload is
    /// dropped; every produced reading has quality `Good`.
    pub fn process(
        &self,
        device: &MqttDeviceConfig,
        topic: &str,
        payload: &[u8],
    ) -> Option<DeviceReading> {
        let parsed = match device.format {
            PayloadFormat::Json => self.parse_json(device, payload),
            PayloadFormat::Binary => self.parse_binary(device, payload),
            PayloadFormat::Csv => self.parse_csv(device, payload),
        };
        match parsed {
            Some(parsed) => Some(self.build_reading(device, parsed)),
            None => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    device_id = %device.device_id,
                    topic = %topic,
                    total_dropped = total,
                    "Dropped unparseable payload"
                );
                None
            }
        }
    }

    fn build_reading(&self, device: &MqttDeviceConfig, parsed: ParsedValue) -> DeviceReading {
        let raw = device.data_type.raw_from_f64(parsed.value);
        let mut reading = DeviceReading::new(&device.device_id, parsed.channel, raw)
            .with_unit(&device.unit);
        reading.processed_value = parsed.value * device.scale_factor;
        if let Some(timestamp) = parsed.timestamp {
            reading.timestamp = timestamp;
        }
        reading
    }

    fn parse_json(&self, device: &MqttDeviceConfig, payload: &[u8]) -> Option<ParsedValue> {
        let root: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(err) => {
                warn!(device_id = %device.device_id, %err, "Invalid JSON payload");
                return None;
            }
        };

        let value_path = device.value_json_path.as_deref().unwrap_or(DEFAULT_VALUE_PATH);
        let value = match json_path(&root, value_path).and_then(json_number) {
            Some(v) => v,
            None => {
                warn!(
                    device_id = %device.device_id,
                    path = %value_path,
                    "JSON payload has no value at configured path"
                );
                return None;
            }
        };

        let channel_path = device
            .channel_json_path
            .as_deref()
            .unwrap_or(DEFAULT_CHANNEL_PATH);
        let channel = json_path(&root, channel_path)
            .and_then(json_number)
            .map(|n| n as i32)
            .unwrap_or(0);

        let timestamp = device
            .timestamp_json_path
            .as_deref()
            .and_then(|path| json_path(&root, path))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(ParsedValue {
            channel,
            value,
            timestamp,
        })
    }

    /// Binary frames are `[1 byte channel][N bytes value]` or `[N bytes
    /// value]`, little-endian, N fixed by the data type. Anything else is
    /// dropped.
    fn parse_binary(&self, device: &MqttDeviceConfig, payload: &[u8]) -> Option<ParsedValue> {
        let width = device.data_type.byte_width();
        let (channel, value_bytes) = if payload.len() == width + 1 {
            (payload[0] as i32, &payload[1..])
        } else if payload.len() == width {
            (0, payload)
        } else {
            warn!(
                device_id = %device.device_id,
                len = payload.len(),
                expected = width,
                "Binary payload length matches no layout"
            );
            return None;
        };

        let value = decode_le(value_bytes, device.data_type)?;
        Some(ParsedValue {
            channel,
            value,
            timestamp: None,
        })
    }

    /// CSV lines are `value[,timestamp]` or `channel,value[,timestamp]`,
    /// dot-decimal numerics. A second field that parses as RFC-3339
    /// disambiguates the two-field layouts.
    fn parse_csv(&self, device: &MqttDeviceConfig, payload: &[u8]) -> Option<ParsedValue> {
        let text = std::str::from_utf8(payload).ok()?;
        let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();

        let parsed = match fields.as_slice() {
            [value] => ParsedValue {
                channel: 0,
                value: value.parse().ok()?,
                timestamp: None,
            },
            [first, second] => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(second) {
                    ParsedValue {
                        channel: 0,
                        value: first.parse().ok()?,
                        timestamp: Some(ts.with_timezone(&Utc)),
                    }
                } else {
                    ParsedValue {
                        channel: first.parse().ok()?,
                        value: second.parse().ok()?,
                        timestamp: None,
                    }
                }
            }
            [channel, value, timestamp] => ParsedValue {
                channel: channel.parse().ok()?,
                value: value.parse().ok()?,
                timestamp: Some(
                    DateTime::parse_from_rfc3339(timestamp)
                        .ok()?
                        .with_timezone(&Utc),
                ),
            },
            _ => return None,
        };
        Some(parsed)
    }
}

struct ParsedValue {
    channel: i32,
    value: f64,
    timestamp: Option<DateTime<Utc>>,
}

/// Resolve a simple dotted path (`$.a.b`) against a JSON document.
fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim_start_matches("$.").trim_start_matches('$');
    if trimmed.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in trimmed.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_le(bytes: &[u8], data_type: DataType) -> Option<f64> {
    let value = match data_type {
        DataType::Int16 => i16::from_le_bytes(bytes.try_into().ok()?) as f64,
        DataType::UInt16 => u16::from_le_bytes(bytes.try_into().ok()?) as f64,
        DataType::Int32 => i32::from_le_bytes(bytes.try_into().ok()?) as f64,
        DataType::UInt32Counter => u32::from_le_bytes(bytes.try_into().ok()?) as f64,
        DataType::Float32 => f32::from_le_bytes(bytes.try_into().ok()?) as f64,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_common::Quality;

    fn json_device() -> MqttDeviceConfig {
        MqttDeviceConfig {
            device_id: "flow-meter-7".to_string(),
            topics: vec!["sensors/+/value".to_string()],
            format: PayloadFormat::Json,
            data_type: DataType::Float32,
            value_json_path: Some("$.v".to_string()),
            scale_factor: 0.1,
            unit: "l/min".to_string(),
            ..MqttDeviceConfig::default()
        }
    }

    #[test]
    fn json_value_is_scaled_with_default_channel() {
        let processor = PayloadProcessor::new();
        let device = json_device();
        let reading = processor
            .process(&device, "sensors/A/value", br#"{"v": 250}"#)
            .unwrap();
        assert_eq!(reading.device_id, "flow-meter-7");
        assert_eq!(reading.channel, 0);
        assert!((reading.processed_value - 25.0).abs() < 1e-9);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.unit, "l/min");
    }

    #[test]
    fn json_missing_value_is_dropped_not_bad() {
        let processor = PayloadProcessor::new();
        let device = json_device();
        assert!(processor
            .process(&device, "sensors/A/value", br#"{"other": 1}"#)
            .is_none());
        assert!(processor.process(&device, "sensors/A/value", b"not json").is_none());
        assert_eq!(processor.dropped_count(), 2);
    }

    #[test]
    fn json_channel_and_timestamp_paths() {
        let processor = PayloadProcessor::new();
        let mut device = json_device();
        device.channel_json_path = Some("$.meta.ch".to_string());
        device.timestamp_json_path = Some("$.meta.at".to_string());
        let payload = br#"{"v": 10, "meta": {"ch": 3, "at": "2026-03-01T12:00:00Z"}}"#;
        let reading = processor.process(&device, "sensors/A/value", payload).unwrap();
        assert_eq!(reading.channel, 3);
        assert_eq!(
            reading.timestamp,
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap()
        );
    }

    #[test]
    fn binary_with_and_without_channel_byte() {
        let processor = PayloadProcessor::new();
        let mut device = json_device();
        device.format = PayloadFormat::Binary;
        device.data_type = DataType::UInt32Counter;
        device.scale_factor = 1.0;

        let bare = 1234u32.to_le_bytes();
        let reading = processor.process(&device, "t", &bare).unwrap();
        assert_eq!(reading.channel, 0);
        assert_eq!(reading.raw_value, 1234);

        let mut framed = vec![7u8];
        framed.extend_from_slice(&bare);
        let reading = processor.process(&device, "t", &framed).unwrap();
        assert_eq!(reading.channel, 7);
        assert_eq!(reading.raw_value, 1234);
    }

    #[test]
    fn binary_bad_length_is_dropped() {
        let processor = PayloadProcessor::new();
        let mut device = json_device();
        device.format = PayloadFormat::Binary;
        device.data_type = DataType::Int16;
        assert!(processor.process(&device, "t", &[1, 2, 3, 4, 5]).is_none());
        assert_eq!(processor.dropped_count(), 1);
    }

    #[test]
    fn csv_layouts() {
        let processor = PayloadProcessor::new();
        let mut device = json_device();
        device.format = PayloadFormat::Csv;
        device.scale_factor = 1.0;

        let reading = processor.process(&device, "t", b"42.5").unwrap();
        assert_eq!(reading.channel, 0);
        assert!((reading.processed_value - 42.5).abs() < 1e-9);

        let reading = processor.process(&device, "t", b"3,42.5").unwrap();
        assert_eq!(reading.channel, 3);

        let reading = processor
            .process(&device, "t", b"42.5,2026-03-01T12:00:00Z")
            .unwrap();
        assert_eq!(reading.channel, 0);
        assert_eq!(
            reading.timestamp,
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap()
        );

        let reading = processor
            .process(&device, "t", b"5,42.5,2026-03-01T12:00:00Z")
            .unwrap();
        assert_eq!(reading.channel, 5);

        assert!(processor.process(&device, "t", b"not,a number").is_none());
    }

    #[test]
    fn integer_types_truncate() {
        let processor = PayloadProcessor::new();
        let mut device = json_device();
        device.format = PayloadFormat::Csv;
        device.data_type = DataType::Int16;
        device.scale_factor = 1.0;
        let reading = processor.process(&device, "t", b"41.9").unwrap();
        assert_eq!(reading.raw_value, 41);
    }
}
