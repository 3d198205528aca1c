//! Windowed rate calculation
//!
//! Computes a smoothed units-per-second figure for counter channels by
//! comparing the newest sample against the oldest sample inside a
//! configurable window, hiding transient stoppages that a point-to-point
//! derivative would amplify. Counter wrap-around is detected by a large
//! negative delta and corrected arithmetically.
//!
//! One ring of timestamped samples per `(device, channel)`, each behind its
//! own lock that is never held across I/O. A periodic reaper evicts rings
//! that stopped receiving samples.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use fl_common::{CircularBuffer, DeviceReading};
use fl_config::ChannelConfig;

/// Samples kept per channel; at 1Hz polling this covers several minutes
/// beyond any sane window.
const RATE_RING_CAPACITY: usize = 256;
/// Fallback window when the configured one holds no usable reference.
const FLOOR_WINDOW_SECS: i64 = 10;
/// Cadence of the eviction sweep.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);
/// Rings idle longer than this are dropped.
const RING_IDLE_EVICTION_SECS: i64 = 1200;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    timestamp: DateTime<Utc>,
    raw_value: i64,
}

type RingKey = (String, i32);

#[derive(Default)]
pub struct WindowedRateCalculator {
    rings: DashMap<RingKey, Arc<Mutex<CircularBuffer<RateSample>>>>,
}

impl WindowedRateCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// Insert the reading's sample and compute the windowed rate.
    ///
    /// Returns None when fewer than two samples fall inside the window (or
    /// the floor window), or when the timestamps do not advance. Never
    /// errors and never blocks the caller beyond the per-ring lock.
    pub fn record_and_rate(&self, reading: &DeviceReading, channel: &ChannelConfig) -> Option<f64> {
        if reading.is_unavailable() {
            // No measurement, no sample, no rate.
            return None;
        }

        let key = (reading.device_id.clone(), reading.channel);
        let ring = self
            .rings
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(CircularBuffer::new(RATE_RING_CAPACITY))))
            .clone();

        // Insertion and computation happen under one lock so a newer sample
        // for this channel can never be reordered with this calculation.
        let mut ring = ring.lock();
        ring.add(RateSample {
            timestamp: reading.timestamp,
            raw_value: reading.raw_value,
        });

        let window = chrono::Duration::seconds(channel.rate_window_seconds as i64);
        let reference = Self::reference_sample(&ring, reading.timestamp, window)?;

        let delta_seconds =
            (reading.timestamp - reference.timestamp).num_milliseconds() as f64 / 1000.0;
        if delta_seconds <= 0.0 {
            trace!(
                device_id = %reading.device_id,
                channel = reading.channel,
                "Non-advancing timestamps, no rate"
            );
            return None;
        }

        let diff = wrap_corrected_diff(
            reading.raw_value,
            reference.raw_value,
            channel.counter_max_value(),
        );
        Some((diff as f64 / delta_seconds) * channel.scale_factor)
    }

    /// Oldest sample inside the window, falling back to the floor window of
    /// `min(configured, 10s)`. A usable reference needs at least one sample
    /// older than the current one inside the window.
    fn reference_sample(
        ring: &CircularBuffer<RateSample>,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Option<RateSample> {
        for candidate_window in [
            window,
            chrono::Duration::seconds(window.num_seconds().min(FLOOR_WINDOW_SECS)),
        ] {
            let cutoff = now - candidate_window;
            let in_window = ring.items_within(cutoff, |s| s.timestamp);
            if in_window.len() >= 2 {
                return Some(in_window[0]);
            }
        }
        None
    }

    /// Drop rings whose newest sample is older than the idle threshold.
    pub fn evict_idle(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(RING_IDLE_EVICTION_SECS);
        let stale: Vec<RingKey> = self
            .rings
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .peek_newest()
                    .map(|s| s.timestamp < cutoff)
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let evicted = stale.len();
        for key in stale {
            self.rings.remove(&key);
        }
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate rings");
        }
        evicted
    }
}

/// Counter wrap detection: a negative delta larger than half the counter
/// range means the counter rolled over, so shift it back into positive
/// territory. Smaller negative deltas are legitimate decrements and pass
/// through unchanged.
fn wrap_corrected_diff(current: i64, reference: i64, max_value: u64) -> i64 {
    let diff = current - reference;
    if diff < 0 && diff.unsigned_abs() > max_value / 2 {
        diff + max_value as i64 + 1
    } else {
        diff
    }
}

/// Five-minute maintenance sweep, stopped by the service's token.
pub fn spawn_reaper(
    calculator: Arc<WindowedRateCalculator>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(REAPER_INTERVAL) => {}
            }
            calculator.evict_idle();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_config::DataType;

    fn counter_channel(register_count: u16, window_secs: u64) -> ChannelConfig {
        ChannelConfig {
            register_count,
            data_type: DataType::UInt32Counter,
            rate_window_seconds: window_secs,
            ..ChannelConfig::default()
        }
    }

    fn reading_at(raw: i64, at: DateTime<Utc>) -> DeviceReading {
        DeviceReading::new("adam-01", 0, raw).with_timestamp(at)
    }

    #[test]
    fn steady_counter_yields_steady_rate() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let start = Utc::now();

        let mut rates = Vec::new();
        for (i, raw) in [100i64, 110, 120, 130, 140].iter().enumerate() {
            let reading = reading_at(*raw, start + chrono::Duration::seconds(i as i64));
            rates.push(calc.record_and_rate(&reading, &channel));
        }

        assert_eq!(rates[0], None); // single sample, no reference yet
        for rate in &rates[1..] {
            let rate = rate.expect("rate after two samples");
            assert!((rate - 10.0).abs() < 1e-9, "rate was {rate}");
        }
    }

    #[test]
    fn sixteen_bit_counter_wrap() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(1, 10);
        let start = Utc::now();

        assert_eq!(calc.record_and_rate(&reading_at(65530, start), &channel), None);
        let rate = calc
            .record_and_rate(
                &reading_at(10, start + chrono::Duration::seconds(1)),
                &channel,
            )
            .unwrap();
        // (65536 + 10 - 65530) / 1s
        assert!((rate - 16.0).abs() < 1e-9, "rate was {rate}");
    }

    #[test]
    fn thirty_two_bit_counter_wrap() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let start = Utc::now();

        let near_max = u32::MAX as i64 - 5;
        calc.record_and_rate(&reading_at(near_max, start), &channel);
        let rate = calc
            .record_and_rate(
                &reading_at(4, start + chrono::Duration::seconds(1)),
                &channel,
            )
            .unwrap();
        assert!((rate - 10.0).abs() < 1e-9, "rate was {rate}");
    }

    #[test]
    fn small_decrement_passes_through_negative() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let start = Utc::now();

        calc.record_and_rate(&reading_at(1000, start), &channel);
        let rate = calc
            .record_and_rate(
                &reading_at(980, start + chrono::Duration::seconds(1)),
                &channel,
            )
            .unwrap();
        assert!((rate + 20.0).abs() < 1e-9, "rate was {rate}");
    }

    #[test]
    fn scale_factor_is_applied() {
        let calc = WindowedRateCalculator::new();
        let mut channel = counter_channel(2, 10);
        channel.scale_factor = 0.5;
        let start = Utc::now();

        calc.record_and_rate(&reading_at(0, start), &channel);
        let rate = calc
            .record_and_rate(
                &reading_at(100, start + chrono::Duration::seconds(10)),
                &channel,
            )
            .unwrap();
        assert!((rate - 5.0).abs() < 1e-9, "rate was {rate}");
    }

    #[test]
    fn window_excludes_stale_reference() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let start = Utc::now();

        // A sample far outside the window must not serve as reference.
        calc.record_and_rate(&reading_at(0, start - chrono::Duration::seconds(120)), &channel);
        assert_eq!(
            calc.record_and_rate(&reading_at(1000, start), &channel),
            None
        );
    }

    #[test]
    fn unavailable_reading_is_ignored() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let reading = DeviceReading::unavailable("adam-01", 0, "counts");
        assert_eq!(calc.record_and_rate(&reading, &channel), None);
        assert_eq!(calc.ring_count(), 0);
    }

    #[test]
    fn channels_are_independent() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let start = Utc::now();

        // Interleave two channels; each rate only sees its own samples.
        let mut a0 = reading_at(0, start);
        a0.channel = 0;
        let mut b0 = reading_at(5000, start);
        b0.channel = 1;
        let mut a1 = reading_at(100, start + chrono::Duration::seconds(1));
        a1.channel = 0;
        let mut b1 = reading_at(5020, start + chrono::Duration::seconds(1));
        b1.channel = 1;

        calc.record_and_rate(&a0, &channel);
        calc.record_and_rate(&b0, &channel);
        let rate_a = calc.record_and_rate(&a1, &channel).unwrap();
        let rate_b = calc.record_and_rate(&b1, &channel).unwrap();
        assert!((rate_a - 100.0).abs() < 1e-9);
        assert!((rate_b - 20.0).abs() < 1e-9);
        assert_eq!(calc.ring_count(), 2);
    }

    #[test]
    fn idle_rings_are_evicted() {
        let calc = WindowedRateCalculator::new();
        let channel = counter_channel(2, 10);
        let stale = Utc::now() - chrono::Duration::seconds(RING_IDLE_EVICTION_SECS + 60);

        calc.record_and_rate(&reading_at(1, stale), &channel);
        calc.record_and_rate(
            &DeviceReading::new("adam-02", 0, 1).with_timestamp(Utc::now()),
            &channel,
        );
        assert_eq!(calc.ring_count(), 2);
        assert_eq!(calc.evict_idle(), 1);
        assert_eq!(calc.ring_count(), 1);
    }
}
