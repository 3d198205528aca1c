//! Data processing
//!
//! Applies per-channel scaling, derives rates, and classifies quality.
//! Counter channels get the windowed rate for smoothing; when a caller
//! supplies the previous reading explicitly, a point-to-point derivative is
//! used instead. Unavailable readings short-circuit: they are never scaled,
//! never bound-checked, and never acquire a rate.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use fl_common::{DeviceReading, Quality};
use fl_config::{ChannelConfig, DataType, ModbusDeviceConfig};

use crate::rate::WindowedRateCalculator;

pub struct DataProcessor {
    channels: HashMap<(String, i32), ChannelConfig>,
    rate: Arc<WindowedRateCalculator>,
    last_readings: parking_lot::Mutex<HashMap<(String, i32), DeviceReading>>,
}

impl DataProcessor {
    pub fn new(devices: &[ModbusDeviceConfig], rate: Arc<WindowedRateCalculator>) -> Self {
        let mut channels = HashMap::new();
        for device in devices {
            for channel in &device.channels {
                channels.insert(
                    (device.device_id.clone(), channel.channel_number),
                    channel.clone(),
                );
            }
        }
        Self {
            channels,
            rate,
            last_readings: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Streaming entry point used by the ingestion drainer: looks up the
    /// previous reading for this `(device, channel)`, processes, and stores
    /// the result as the new last reading. Counter channels always take the
    /// windowed rate path; the remembered reading feeds the derivative for
    /// everything else.
    pub fn process_stream(&self, reading: DeviceReading) -> DeviceReading {
        let key = (reading.device_id.clone(), reading.channel);
        let is_counter = self
            .channels
            .get(&key)
            .map(|c| c.data_type == DataType::UInt32Counter)
            .unwrap_or(false);
        let previous = if is_counter {
            None
        } else {
            self.last_readings.lock().get(&key).cloned()
        };
        let processed = self.process(reading, previous.as_ref());
        self.last_readings.lock().insert(key, processed.clone());
        processed
    }

    /// Process one raw reading. `previous` switches the rate computation to
    /// a point-to-point derivative; otherwise counter channels go through
    /// the windowed calculator.
    pub fn process(
        &self,
        mut reading: DeviceReading,
        previous: Option<&DeviceReading>,
    ) -> DeviceReading {
        let key = (reading.device_id.clone(), reading.channel);
        let Some(channel) = self.channels.get(&key) else {
            warn!(
                device_id = %reading.device_id,
                channel = reading.channel,
                "No channel config, passing reading through unchanged"
            );
            return reading;
        };

        if reading.is_unavailable() {
            // The placeholder stays exactly as produced; deriving numbers
            // from a non-measurement would fabricate data.
            reading.rate = None;
            return reading;
        }

        let numeric = channel.data_type.f64_from_raw(reading.raw_value);
        reading.processed_value = numeric * channel.scale_factor;
        reading.quality = Quality::Good;
        if reading.unit.is_empty() {
            reading.unit = channel.unit.clone();
        }

        reading.rate = match previous {
            Some(previous) => point_to_point_rate(&reading, previous, channel),
            None if channel.data_type == DataType::UInt32Counter => {
                self.rate.record_and_rate(&reading, channel)
            }
            None => None,
        };

        // Rate limit first: Degraded set here survives the bounds check
        // below (Degraded is sticky versus Bad, and per-reading only).
        if let (Some(rate), Some(max_change)) = (reading.rate, channel.max_change_rate) {
            if rate.abs() > max_change {
                reading.quality = Quality::Degraded;
            }
        }

        let below_min = channel
            .min_value
            .map(|min| reading.processed_value < min)
            .unwrap_or(false);
        let above_max = channel
            .max_value
            .map(|max| reading.processed_value > max)
            .unwrap_or(false);
        if (below_min || above_max) && reading.quality != Quality::Degraded {
            reading.quality = Quality::Bad;
        }

        reading
    }
}

/// Derivative against an explicit previous reading, wrap-corrected for
/// counter channels.
fn point_to_point_rate(
    current: &DeviceReading,
    previous: &DeviceReading,
    channel: &ChannelConfig,
) -> Option<f64> {
    if previous.is_unavailable() {
        return None;
    }
    let delta_seconds =
        (current.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    if delta_seconds <= 0.0 {
        return None;
    }

    let diff = if channel.data_type == DataType::UInt32Counter {
        let raw_diff = current.raw_value - previous.raw_value;
        let max_value = channel.counter_max_value();
        if raw_diff < 0 && raw_diff.unsigned_abs() > max_value / 2 {
            (raw_diff + max_value as i64 + 1) as f64
        } else {
            raw_diff as f64
        }
    } else {
        channel.data_type.f64_from_raw(current.raw_value)
            - channel.data_type.f64_from_raw(previous.raw_value)
    };

    Some((diff / delta_seconds) * channel.scale_factor)
}
