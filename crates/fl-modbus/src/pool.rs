//! Modbus device pool
//!
//! Owns one polling task per device. Every produced reading goes out over a
//! shared bounded channel; a slow consumer back-pressures the polls rather
//! than dropping data. Add, remove and restart of the same device are
//! serialized through a per-device lock so at most one polling task exists
//! per device at any instant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fl_common::DeviceReading;
use fl_config::ModbusDeviceConfig;

use crate::codec;
use crate::connection::ModbusConnection;
use crate::health::DeviceHealthTracker;

/// How long a cancelled polling task gets to wind down before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Pause before respawning a polling task that panicked.
const PANIC_RESTART_DELAY: Duration = Duration::from_secs(1);

struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct DeviceContext {
    config: ModbusDeviceConfig,
    /// Serializes remove/restart for this device; holding it means "the
    /// polling task of this device is being swapped".
    poll: Mutex<PollHandle>,
}

pub struct DevicePool {
    devices: DashMap<String, Arc<DeviceContext>>,
    readings_tx: mpsc::Sender<DeviceReading>,
    health: Arc<DeviceHealthTracker>,
    shutdown: CancellationToken,
}

impl DevicePool {
    pub fn new(readings_tx: mpsc::Sender<DeviceReading>, health: Arc<DeviceHealthTracker>) -> Self {
        Self {
            devices: DashMap::new(),
            readings_tx,
            health,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn health(&self) -> Arc<DeviceHealthTracker> {
        Arc::clone(&self.health)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// True while the device has a live (or currently restarting) poll task.
    pub fn is_device_active(&self, device_id: &str) -> bool {
        match self.devices.get(device_id) {
            Some(ctx) => match ctx.poll.try_lock() {
                Ok(handle) => !handle.task.is_finished(),
                Err(_) => true, // a restart holds the lock; the device is live
            },
            None => false,
        }
    }

    /// Register a device and spawn its polling task.
    ///
    /// Returns false for a duplicate id or a config the pool cannot poll.
    pub fn add_device(&self, config: ModbusDeviceConfig) -> bool {
        if config.device_id.is_empty() || config.channels.is_empty() {
            warn!(device_id = %config.device_id, "Rejecting device with empty id or no channels");
            return false;
        }
        let device_id = config.device_id.clone();
        match self.devices.entry(device_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(device_id = %device_id, "Device already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                self.health.register(&device_id);
                let cancel = self.shutdown.child_token();
                let task = self.spawn_polling_task(config.clone(), cancel.clone());
                entry.insert(Arc::new(DeviceContext {
                    config,
                    poll: Mutex::new(PollHandle { cancel, task }),
                }));
                info!(device_id = %device_id, "Device added to pool");
                true
            }
        }
    }

    /// Stop and forget a device. Waits for its polling task with a bounded
    /// grace period.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        let Some((_, ctx)) = self.devices.remove(device_id) else {
            return false;
        };
        let mut handle = ctx.poll.lock().await;
        handle.cancel.cancel();
        Self::join_with_grace(device_id, &mut handle.task).await;
        self.health.remove(device_id);
        info!(device_id = %device_id, "Device removed from pool");
        true
    }

    /// Tear down and relaunch a device's polling task.
    ///
    /// Serialized per device through the context lock: the old task is
    /// cancelled and awaited (5s ceiling, then aborted) before the fresh
    /// cancellation source and task are installed, so no two polling tasks
    /// for one device ever overlap. Restarts of different devices proceed in
    /// parallel.
    pub async fn restart_device(&self, device_id: &str) -> bool {
        let ctx = match self.devices.get(device_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };
        let mut handle = ctx.poll.lock().await;
        info!(device_id = %device_id, "Restarting device");

        handle.cancel.cancel();
        Self::join_with_grace(device_id, &mut handle.task).await;

        let cancel = self.shutdown.child_token();
        handle.task = self.spawn_polling_task(ctx.config.clone(), cancel.clone());
        handle.cancel = cancel;
        true
    }

    /// Cancel every polling task and wait each one out.
    pub async fn shutdown(&self) {
        info!(devices = self.devices.len(), "Stopping device pool");
        self.shutdown.cancel();
        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for device_id in ids {
            if let Some((_, ctx)) = self.devices.remove(&device_id) {
                let mut handle = ctx.poll.lock().await;
                Self::join_with_grace(&device_id, &mut handle.task).await;
            }
        }
    }

    async fn join_with_grace(device_id: &str, task: &mut JoinHandle<()>) {
        match timeout(STOP_GRACE, &mut *task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(device_id = %device_id, %err, "Polling task ended abnormally"),
            Err(_) => {
                warn!(
                    device_id = %device_id,
                    grace_secs = STOP_GRACE.as_secs(),
                    "Polling task did not stop within grace period, aborting"
                );
                task.abort();
            }
        }
    }

    /// Polling tasks are supervised: a panic inside the poll loop is caught,
    /// logged, and the loop is respawned unless the device was cancelled.
    fn spawn_polling_task(
        &self,
        config: ModbusDeviceConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tx = self.readings_tx.clone();
        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            loop {
                let run = std::panic::AssertUnwindSafe(poll_device(
                    config.clone(),
                    cancel.clone(),
                    tx.clone(),
                    Arc::clone(&health),
                ))
                .catch_unwind();
                match run.await {
                    Ok(()) => break,
                    Err(_) => {
                        error!(device_id = %config.device_id, "Polling task panicked, restarting");
                        if cancel.is_cancelled() {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(PANIC_RESTART_DELAY) => {}
                        }
                    }
                }
            }
        })
    }
}

/// One device's poll loop: connect (with cooldown), read each channel in
/// order, emit, sleep out the remainder of the interval. Cancellation is
/// observed at every await point.
async fn poll_device(
    config: ModbusDeviceConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<DeviceReading>,
    health: Arc<DeviceHealthTracker>,
) {
    let device_id = config.device_id.clone();
    let mut conn = match ModbusConnection::new(&device_id, &config.ip, config.port, config.unit_id)
    {
        Ok(conn) => conn,
        Err(err) => {
            // Config validation should have caught this; nothing to poll.
            error!(device_id = %device_id, %err, "Unpollable device address");
            return;
        }
    };
    let interval = Duration::from_millis(config.poll_interval_ms);
    info!(
        device_id = %device_id,
        poll_interval_ms = config.poll_interval_ms,
        channels = config.channels.len(),
        "Polling started"
    );

    while !cancel.is_cancelled() {
        let cycle_start = Instant::now();

        if !conn.is_connected() {
            match conn.connect().await {
                Ok(()) => {
                    health.mark_connected(&device_id, true);
                    info!(device_id = %device_id, "Device connected");
                }
                Err(err) => {
                    health.mark_connected(&device_id, false);
                    health.record_failure(&device_id, err.to_string());
                    debug!(device_id = %device_id, %err, "Connect failed");
                    // The cycle still accounts for every channel: one
                    // Unavailable reading each, so downstream sees the gap.
                    for channel in &config.channels {
                        let reading = DeviceReading::unavailable(
                            &device_id,
                            channel.channel_number,
                            &channel.unit,
                        );
                        if !send_reading(&tx, &cancel, reading).await {
                            return;
                        }
                    }
                }
            }
        }

        if conn.is_connected() {
            for channel in &config.channels {
                let reading = match conn
                    .read_registers(
                        channel.register_type,
                        channel.start_register,
                        channel.register_count,
                    )
                    .await
                {
                    Ok(words) => match codec::decode_registers(&words, channel.data_type) {
                        Ok(raw) => {
                            health.record_success(&device_id);
                            DeviceReading::new(&device_id, channel.channel_number, raw)
                                .with_unit(&channel.unit)
                        }
                        Err(err) => {
                            health.record_failure(&device_id, err.to_string());
                            warn!(
                                device_id = %device_id,
                                channel = channel.channel_number,
                                %err,
                                "Undecodable register response"
                            );
                            DeviceReading::unavailable(
                                &device_id,
                                channel.channel_number,
                                &channel.unit,
                            )
                        }
                    },
                    Err(err) => {
                        health.record_failure(&device_id, err.to_string());
                        if !conn.is_connected() {
                            health.mark_connected(&device_id, false);
                        }
                        debug!(
                            device_id = %device_id,
                            channel = channel.channel_number,
                            %err,
                            "Read failed"
                        );
                        DeviceReading::unavailable(&device_id, channel.channel_number, &channel.unit)
                    }
                };
                if !send_reading(&tx, &cancel, reading).await {
                    return;
                }
            }
        }

        let pause = interval.saturating_sub(cycle_start.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }

    conn.disconnect();
    debug!(device_id = %device_id, "Polling stopped");
}

/// Back-pressuring send that still honors cancellation. Returns false when
/// the loop should exit.
async fn send_reading(
    tx: &mpsc::Sender<DeviceReading>,
    cancel: &CancellationToken,
    reading: DeviceReading,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = tx.send(reading) => result.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_common::Quality;
    use fl_config::ChannelConfig;

    /// Loopback port 1 refuses connections immediately, which makes an
    /// always-offline device for pool tests.
    fn unreachable_device(id: &str) -> ModbusDeviceConfig {
        ModbusDeviceConfig {
            device_id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 1,
            poll_interval_ms: 20,
            channels: vec![ChannelConfig::default()],
            ..ModbusDeviceConfig::default()
        }
    }

    fn pool_with_channel(capacity: usize) -> (DevicePool, mpsc::Receiver<DeviceReading>) {
        let (tx, rx) = mpsc::channel(capacity);
        let pool = DevicePool::new(tx, Arc::new(DeviceHealthTracker::new()));
        (pool, rx)
    }

    #[tokio::test]
    async fn duplicate_device_is_rejected() {
        let (pool, _rx) = pool_with_channel(16);
        assert!(pool.add_device(unreachable_device("adam-01")));
        assert!(!pool.add_device(unreachable_device("adam-01")));
        assert_eq!(pool.device_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (pool, _rx) = pool_with_channel(16);
        let mut config = unreachable_device("adam-01");
        config.channels.clear();
        assert!(!pool.add_device(config));
        assert_eq!(pool.device_count(), 0);
    }

    #[tokio::test]
    async fn offline_device_emits_unavailable_readings() {
        let (pool, mut rx) = pool_with_channel(16);
        assert!(pool.add_device(unreachable_device("adam-01")));

        let reading = rx.recv().await.expect("reading");
        assert_eq!(reading.device_id, "adam-01");
        assert_eq!(reading.quality, Quality::Unavailable);
        assert_eq!(reading.raw_value, 0);
        assert_eq!(reading.rate, None);

        let record = pool.health().snapshot("adam-01").unwrap();
        assert!(record.consecutive_failures >= 1);
        assert!(!record.is_connected);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn restart_keeps_exactly_one_task() {
        let (pool, mut rx) = pool_with_channel(1024);
        assert!(pool.add_device(unreachable_device("adam-01")));

        for _ in 0..10 {
            assert!(pool.restart_device("adam-01").await);
            assert_eq!(pool.device_count(), 1);
            assert!(pool.is_device_active("adam-01"));
        }

        // The pool still produces after the churn.
        let reading = rx.recv().await.expect("reading after restarts");
        assert_eq!(reading.device_id, "adam-01");

        pool.shutdown().await;
        assert_eq!(pool.device_count(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_device_is_false() {
        let (pool, _rx) = pool_with_channel(16);
        assert!(!pool.remove_device("ghost").await);
        assert!(!pool.restart_device("ghost").await);
    }

    #[tokio::test]
    async fn remove_stops_and_forgets() {
        let (pool, _rx) = pool_with_channel(1024);
        assert!(pool.add_device(unreachable_device("adam-01")));
        assert!(pool.remove_device("adam-01").await);
        assert_eq!(pool.device_count(), 0);
        assert!(!pool.is_device_active("adam-01"));
        assert!(pool.health().snapshot("adam-01").is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_even_with_full_channel() {
        // Capacity 1 forces the poll task to block on send; shutdown must
        // still complete because sends race the cancellation token.
        let (pool, _rx) = pool_with_channel(1);
        assert!(pool.add_device(unreachable_device("adam-01")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;
        assert_eq!(pool.device_count(), 0);
    }
}
