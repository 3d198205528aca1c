//! Logger service orchestration
//!
//! Boots the acquisition pipeline and wires its pieces together: Modbus
//! device pool and MQTT ingest on the producing side, processor and rate
//! calculator in the middle, the storage writer at the end. Raw readings
//! travel over explicit bounded channels drained by dedicated tasks; the
//! producers only ever enqueue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fl_common::{DeviceReading, FieldLogError, HealthRecord, Result};
use fl_config::AppConfig;
use fl_modbus::{DeviceHealthTracker, DevicePool};
use fl_mqtt::{MqttEvent, MqttIngestClient, PayloadProcessor, TopicFilter, TopicRouter};
use fl_storage::{TimescaleWriter, WriterHealth};

pub mod processor;
pub mod rate;

pub use processor::DataProcessor;
pub use rate::WindowedRateCalculator;

/// Capacity of the raw-readings channel between the pool and the drainer.
const READINGS_CHANNEL_CAPACITY: usize = 1024;

/// In-process status query answered without touching live I/O.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub total_devices: usize,
    pub connected_devices: usize,
    pub devices: Vec<HealthRecord>,
    pub storage: WriterHealth,
}

pub struct LoggerService {
    pool: Arc<DevicePool>,
    health: Arc<DeviceHealthTracker>,
    writer: Arc<TimescaleWriter>,
    mqtt: Option<MqttIngestClient>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl LoggerService {
    /// Validate the configuration, connect storage, and bring the pipeline
    /// up. Configuration and storage failures abort the start; everything
    /// after that is handled internally.
    pub async fn start(config: AppConfig) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|err| FieldLogError::Config(err.to_string()))?;

        let writer = Arc::new(
            TimescaleWriter::connect(config.timescale.clone())
                .await
                .map_err(|err| FieldLogError::Storage(err.to_string()))?,
        );
        writer
            .probe()
            .await
            .map_err(|err| FieldLogError::Storage(err.to_string()))?;

        let cancel = CancellationToken::new();
        let health = Arc::new(DeviceHealthTracker::new());
        let (readings_tx, readings_rx) = mpsc::channel(READINGS_CHANNEL_CAPACITY);
        let pool = Arc::new(DevicePool::new(readings_tx, Arc::clone(&health)));

        let rate = Arc::new(WindowedRateCalculator::new());
        let data_processor = DataProcessor::new(&config.devices, Arc::clone(&rate));

        let mut tasks = Vec::new();
        tasks.push(rate::spawn_reaper(Arc::clone(&rate), cancel.clone()));
        tasks.push(spawn_modbus_drainer(
            readings_rx,
            data_processor,
            Arc::clone(&writer),
            cancel.clone(),
        ));

        for device in config.enabled_devices() {
            if !pool.add_device(device.clone()) {
                warn!(device_id = %device.device_id, "Device was not added to the pool");
            }
        }

        let mqtt = match &config.mqtt {
            Some(settings) if config.enabled_mqtt_devices().next().is_some() => {
                let router = TopicRouter::new(config.mqtt_devices.iter().cloned());
                let filters = router
                    .all_filters()
                    .into_iter()
                    .map(|(path, qos)| TopicFilter { path, qos })
                    .collect();
                let (client, events) = MqttIngestClient::start(settings, filters)?;
                tasks.push(spawn_mqtt_drainer(
                    events,
                    router,
                    Arc::clone(&writer),
                    cancel.clone(),
                ));
                Some(client)
            }
            _ => None,
        };

        let service = Arc::new(Self {
            pool,
            health,
            writer,
            mqtt,
            cancel,
            tasks: Mutex::new(tasks),
            running: AtomicBool::new(true),
            start_time: Mutex::new(Some(Utc::now())),
        });

        info!(
            modbus_devices = service.pool.device_count(),
            mqtt = service.mqtt.is_some(),
            "Logger service started"
        );
        Ok(service)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Overall health: the writer's background task is healthy and at least
    /// one device is connected (vacuously healthy with no devices).
    pub fn is_healthy(&self) -> bool {
        let storage_healthy = self.writer.health().is_healthy;
        let devices_ok =
            self.pool.device_count() == 0 || self.health.connected_count() > 0;
        self.is_running() && storage_healthy && devices_ok
    }

    /// Snapshot for the admin surface; never blocks on live state.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            is_running: self.is_running(),
            start_time: *self.start_time.lock(),
            total_devices: self.pool.device_count(),
            connected_devices: self.health.connected_count(),
            devices: self.health.all(),
            storage: self.writer.health(),
        }
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn writer_health(&self) -> WriterHealth {
        self.writer.health()
    }

    /// Orderly shutdown: stop producers first, then let the drainers empty
    /// their channels, then drain the writer (which runs a final DLQ pass).
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping logger service");

        self.pool.shutdown().await;
        if let Some(mqtt) = &self.mqtt {
            mqtt.shutdown().await;
        }

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.writer.shutdown().await;
        info!("Logger service stopped");
    }
}

/// Drains raw Modbus readings: process (scaling, rate, quality), then hand
/// to storage. A failed hand-off is logged with context and never stops the
/// loop. On cancellation the channel backlog is flushed before exiting.
fn spawn_modbus_drainer(
    mut rx: mpsc::Receiver<DeviceReading>,
    data_processor: DataProcessor,
    writer: Arc<TimescaleWriter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reading = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(reading) => reading,
                    None => break,
                },
            };
            forward_reading(&data_processor, &writer, reading).await;
        }

        // Producers are already stopped; empty what is left in the channel.
        let mut backlog = VecDeque::new();
        while let Ok(reading) = rx.try_recv() {
            backlog.push_back(reading);
        }
        for reading in backlog {
            forward_reading(&data_processor, &writer, reading).await;
        }
        debug!("Modbus reading drainer stopped");
    })
}

async fn forward_reading(
    data_processor: &DataProcessor,
    writer: &TimescaleWriter,
    reading: DeviceReading,
) {
    let processed = data_processor.process_stream(reading);
    if let Err(err) = writer.write(processed.clone()).await {
        error!(
            device_id = %processed.device_id,
            channel = processed.channel,
            %err,
            "Could not hand reading to storage"
        );
    }
}

/// Drains MQTT events: route the topic to a device, parse the payload, hand
/// the reading to storage. Parse failures are dropped (and counted by the
/// payload processor); routing misses are counted by the router.
fn spawn_mqtt_drainer(
    mut events: mpsc::Receiver<MqttEvent>,
    router: TopicRouter,
    writer: Arc<TimescaleWriter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let payload_processor = PayloadProcessor::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                MqttEvent::Connected => info!("MQTT ingest connected"),
                MqttEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "MQTT ingest disconnected")
                }
                MqttEvent::Message { topic, payload } => {
                    let Some(device) = router.route(&topic) else {
                        continue;
                    };
                    let Some(reading) = payload_processor.process(device, &topic, &payload)
                    else {
                        continue;
                    };
                    if let Err(err) = writer.write(reading).await {
                        error!(
                            topic = %topic,
                            device_id = %device.device_id,
                            %err,
                            "Could not hand MQTT reading to storage"
                        );
                    }
                }
            }
        }
        debug!("MQTT drainer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_config::{ModbusDeviceConfig, TimescaleSettings};

    /// Invalid configuration must fail before any connection attempt; the
    /// unreachable connection string would otherwise hang or error later.
    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let mut config = AppConfig {
            timescale: TimescaleSettings {
                connection_string: "postgres://nobody@nowhere:1/void".to_string(),
                ..TimescaleSettings::default()
            },
            ..AppConfig::default()
        };
        config.devices.push(ModbusDeviceConfig {
            device_id: "dup".to_string(),
            channels: vec![fl_config::ChannelConfig::default()],
            ..ModbusDeviceConfig::default()
        });
        config.devices.push(ModbusDeviceConfig {
            device_id: "dup".to_string(),
            channels: vec![fl_config::ChannelConfig::default()],
            ..ModbusDeviceConfig::default()
        });

        let Err(err) = LoggerService::start(config).await else {
            panic!("expected start to fail on duplicate ids");
        };
        assert!(matches!(err, FieldLogError::Config(_)));
    }

    #[tokio::test]
    async fn bad_table_name_is_a_config_error_before_sql() {
        let config = AppConfig {
            timescale: TimescaleSettings {
                connection_string: "postgres://nobody@nowhere:1/void".to_string(),
                table_name: "drop".to_string(),
                ..TimescaleSettings::default()
            },
            ..AppConfig::default()
        };
        let Err(err) = LoggerService::start(config).await else {
            panic!("expected start to fail on the table name");
        };
        assert!(matches!(err, FieldLogError::Config(_)));
    }
}
