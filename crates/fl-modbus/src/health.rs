//! Device health tracking
//!
//! Per-device counters of attempts, successes and consecutive failures. The
//! pool updates these on every cycle; the service status query reads them.

use chrono::Utc;
use dashmap::DashMap;
use fl_common::HealthRecord;

#[derive(Debug, Default)]
pub struct DeviceHealthTracker {
    records: DashMap<String, HealthRecord>,
}

impl DeviceHealthTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn register(&self, device_id: &str) {
        self.records
            .entry(device_id.to_string())
            .or_insert_with(|| HealthRecord::new(device_id));
    }

    pub fn remove(&self, device_id: &str) {
        self.records.remove(device_id);
    }

    pub fn mark_connected(&self, device_id: &str, connected: bool) {
        if let Some(mut record) = self.records.get_mut(device_id) {
            record.is_connected = connected;
        }
    }

    pub fn record_success(&self, device_id: &str) {
        let mut record = self
            .records
            .entry(device_id.to_string())
            .or_insert_with(|| HealthRecord::new(device_id));
        record.total_reads += 1;
        record.successful_reads += 1;
        record.consecutive_failures = 0;
        record.last_successful_read = Some(Utc::now());
        record.last_error = None;
    }

    pub fn record_failure(&self, device_id: &str, error: impl Into<String>) {
        let mut record = self
            .records
            .entry(device_id.to_string())
            .or_insert_with(|| HealthRecord::new(device_id));
        record.total_reads += 1;
        record.consecutive_failures += 1;
        record.last_error = Some(error.into());
    }

    pub fn is_offline(&self, device_id: &str) -> bool {
        self.records
            .get(device_id)
            .map(|r| r.is_offline())
            .unwrap_or(true)
    }

    pub fn snapshot(&self, device_id: &str) -> Option<HealthRecord> {
        self.records.get(device_id).map(|r| r.clone())
    }

    /// Copy of every record, for the status query.
    pub fn all(&self) -> Vec<HealthRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_connected).count()
    }
}
