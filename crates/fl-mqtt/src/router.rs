//! Topic routing
//!
//! Maps an incoming topic to the device config whose filter matches it.
//! First match wins across the ordered list; match cost is O(levels).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use fl_config::MqttDeviceConfig;

/// Unmatched topics are logged at most this often; each occurrence is counted.
const UNMATCHED_LOG_PERIOD: Duration = Duration::from_secs(30);

pub struct TopicRouter {
    devices: Vec<MqttDeviceConfig>,
    unmatched: AtomicU64,
    last_unmatched_log: Mutex<Option<Instant>>,
}

impl TopicRouter {
    /// Build a router over the enabled device configs, preserving order.
    pub fn new(devices: impl IntoIterator<Item = MqttDeviceConfig>) -> Self {
        Self {
            devices: devices.into_iter().filter(|d| d.enabled).collect(),
            unmatched: AtomicU64::new(0),
            last_unmatched_log: Mutex::new(None),
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All filters the client should subscribe to, in device order.
    pub fn all_filters(&self) -> Vec<(String, Option<u8>)> {
        self.devices
            .iter()
            .flat_map(|d| {
                d.topics
                    .iter()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| (t.clone(), d.qos_level))
            })
            .collect()
    }

    /// First device whose filter list matches the topic.
    pub fn route(&self, topic: &str) -> Option<&MqttDeviceConfig> {
        let hit = self
            .devices
            .iter()
            .find(|d| d.topics.iter().any(|f| topic_matches(f, topic)));
        if hit.is_none() {
            self.note_unmatched(topic);
        }
        hit
    }

    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    fn note_unmatched(&self, topic: &str) {
        let count = self.unmatched.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last = self.last_unmatched_log.lock();
        let due = last
            .map(|at| at.elapsed() >= UNMATCHED_LOG_PERIOD)
            .unwrap_or(true);
        if due {
            *last = Some(Instant::now());
            warn!(topic = %topic, total_unmatched = count, "Topic matched no configured device");
        }
    }
}

/// MQTT filter match: `+` consumes exactly one level, a trailing `#` consumes
/// the rest (including nothing), anything else is a literal level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
