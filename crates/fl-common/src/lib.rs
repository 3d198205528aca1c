use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod logging;
pub mod ring;

pub use ring::CircularBuffer;

// ============================================================================
// Readings
// ============================================================================

/// Data quality attached to every reading.
///
/// `Unavailable` is compliance-critical: it marks "no measurement exists" and
/// must never be substituted with a synthetic number. Readings with this
/// quality carry zero-valued placeholders and no rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    /// Measured and within configured bounds.
    Good,
    /// Measured but outside acceptable rate-of-change; value retained.
    Degraded,
    /// Value produced but failed validation (min/max).
    Bad,
    /// No value available (device offline, read failure, transport error).
    Unavailable,
}

impl Quality {
    /// Text form stored in the `quality` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "Good",
            Quality::Degraded => "Degraded",
            Quality::Bad => "Bad",
            Quality::Unavailable => "Unavailable",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "good" => Some(Quality::Good),
            "degraded" => Some(Quality::Degraded),
            "bad" => Some(Quality::Bad),
            "unavailable" => Some(Quality::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic unit flowing through the acquisition pipeline.
///
/// `(timestamp, device_id, channel)` is the primary key in the store; the
/// writer upserts on conflict. Field names are camelCase on the wire to match
/// the dead-letter file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: String,
    pub channel: i32,
    /// Native counter or scaled integer source value.
    pub raw_value: i64,
    pub timestamp: DateTime<Utc>,
    /// Raw value after scale factor is applied.
    pub processed_value: f64,
    /// Units per second over the configured window. None when fewer than two
    /// samples are available, and always None for Unavailable readings.
    pub rate: Option<f64>,
    pub quality: Quality,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_unit() -> String {
    "counts".to_string()
}

impl DeviceReading {
    /// A measured reading, quality `Good` until the processor says otherwise.
    pub fn new(device_id: impl Into<String>, channel: i32, raw_value: i64) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            raw_value,
            timestamp: Utc::now(),
            processed_value: raw_value as f64,
            rate: None,
            quality: Quality::Good,
            unit: default_unit(),
        }
    }

    /// Placeholder emitted when a device or channel could not be read.
    ///
    /// Raw and processed values are zero and no rate is ever derived from it.
    pub fn unavailable(device_id: impl Into<String>, channel: i32, unit: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            raw_value: 0,
            timestamp: Utc::now(),
            processed_value: 0.0,
            rate: None,
            quality: Quality::Unavailable,
            unit: unit.into(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_unavailable(&self) -> bool {
        self.quality == Quality::Unavailable
    }
}

// ============================================================================
// Device Health
// ============================================================================

/// A device is reported offline after this many consecutive read failures.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Per-device connectivity and read statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub device_id: String,
    pub is_connected: bool,
    pub last_successful_read: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub total_reads: u64,
    pub successful_reads: u64,
}

impl HealthRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            is_connected: false,
            last_successful_read: None,
            consecutive_failures: 0,
            last_error: None,
            total_reads: 0,
            successful_reads: 0,
        }
    }

    /// Fraction of reads that succeeded, 0.0 when nothing was attempted yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64
        }
    }

    pub fn is_offline(&self) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }
}

// ============================================================================
// Dead-Letter Batches
// ============================================================================

/// A batch is eligible for replay while it is younger than this.
pub const FAILED_BATCH_MAX_AGE_HOURS: i64 = 24;
/// A batch is eligible for replay until it has been attempted this many times.
pub const FAILED_BATCH_MAX_RETRIES: u32 = 3;

/// A batch of readings the writer could not persist, parked on disk for replay.
///
/// Serialized as one `<uuid>.json` file per batch under the DLQ directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<DeviceReading>,
    pub error: String,
    pub retry_attempts: u32,
}

impl FailedBatch {
    pub fn new(readings: Vec<DeviceReading>, error: impl Into<String>, retry_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            readings,
            error: error.into(),
            retry_attempts,
        }
    }

    /// Replay predicate: under the retry cap and younger than 24 hours.
    /// Exhausted batches stay on disk for audit but are never retried again.
    pub fn should_retry(&self) -> bool {
        self.retry_attempts < FAILED_BATCH_MAX_RETRIES
            && Utc::now() - self.timestamp < chrono::Duration::hours(FAILED_BATCH_MAX_AGE_HOURS)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FieldLogError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, FieldLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_reading_has_no_value_and_no_rate() {
        let reading = DeviceReading::unavailable("adam-01", 2, "counts");
        assert_eq!(reading.raw_value, 0);
        assert_eq!(reading.processed_value, 0.0);
        assert_eq!(reading.rate, None);
        assert_eq!(reading.quality, Quality::Unavailable);
    }

    #[test]
    fn quality_round_trips_through_text() {
        for q in [Quality::Good, Quality::Degraded, Quality::Bad, Quality::Unavailable] {
            assert_eq!(Quality::from_str_loose(q.as_str()), Some(q));
        }
        assert_eq!(Quality::from_str_loose("nonsense"), None);
    }

    #[test]
    fn reading_serializes_camel_case() {
        let reading = DeviceReading::new("adam-01", 0, 42);
        let json = serde_json::to_value(&reading).unwrap();
        assert!(json.get("deviceId").is_some());
        assert!(json.get("rawValue").is_some());
        assert!(json.get("processedValue").is_some());
        assert!(json.get("device_id").is_none());
    }

    #[test]
    fn health_record_success_rate() {
        let mut record = HealthRecord::new("adam-01");
        assert_eq!(record.success_rate(), 0.0);
        record.total_reads = 10;
        record.successful_reads = 7;
        assert!((record.success_rate() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn health_record_offline_threshold() {
        let mut record = HealthRecord::new("adam-01");
        record.consecutive_failures = MAX_CONSECUTIVE_FAILURES - 1;
        assert!(!record.is_offline());
        record.consecutive_failures = MAX_CONSECUTIVE_FAILURES;
        assert!(record.is_offline());
    }

    #[test]
    fn fresh_failed_batch_is_retryable() {
        let batch = FailedBatch::new(vec![DeviceReading::new("adam-01", 0, 1)], "timeout", 0);
        assert!(batch.should_retry());
    }

    #[test]
    fn exhausted_failed_batch_is_not_retryable() {
        let batch = FailedBatch::new(vec![], "timeout", FAILED_BATCH_MAX_RETRIES);
        assert!(!batch.should_retry());
    }

    #[test]
    fn stale_failed_batch_is_not_retryable() {
        let mut batch = FailedBatch::new(vec![], "timeout", 0);
        batch.timestamp = Utc::now() - chrono::Duration::hours(FAILED_BATCH_MAX_AGE_HOURS + 1);
        assert!(!batch.should_retry());
    }

    #[test]
    fn failed_batch_json_round_trip_preserves_readings() {
        let reading = DeviceReading::new("adam-01", 3, 9001).with_unit("items");
        let batch = FailedBatch::new(vec![reading.clone()], "db down", 1);
        let json = serde_json::to_string(&batch).unwrap();
        let restored: FailedBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, batch.id);
        assert_eq!(restored.retry_attempts, 1);
        assert_eq!(restored.readings, vec![reading]);
    }
}
