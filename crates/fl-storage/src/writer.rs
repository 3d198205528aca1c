//! Time-series storage writer
//!
//! A bounded channel of single readings feeds one background batcher (the
//! sole reader). Batches flush on size or interval through an upsert path,
//! inside a retry policy; exhausted batches go to the dead-letter queue and
//! the writer moves on. Producers never observe storage errors and never
//! drop: a full channel suspends them, which is the pipeline's back-pressure
//! regulator.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fl_common::{CircularBuffer, DeviceReading};
use fl_config::TimescaleSettings;

use crate::dlq::DeadLetterQueue;
use crate::retry::RetryPolicy;
use crate::sql::ReadingsSql;

/// Channel capacity is the batch size times this.
const CHANNEL_CAPACITY_MULTIPLIER: usize = 4;
/// Batches above this go through the array-bind bulk path.
const BULK_INSERT_THRESHOLD: usize = 10;
/// Flush latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 100;
/// Cadence of the dead-letter replay loop.
const REPLAY_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff after the replay loop itself errors.
const REPLAY_ERROR_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid table name: {0}")]
    TableName(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database initialization timed out after {0:?}")]
    InitTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("writer is shut down")]
    Shutdown,
}

/// Non-blocking health snapshot. The DLQ size is a cached figure maintained
/// by the replay loop and after failed flushes, never a synchronous walk of
/// the file system.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterHealth {
    pub is_healthy: bool,
    pub last_successful_write: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_writes: usize,
    pub total_successful_batches: u64,
    pub total_failed_batches: u64,
    pub total_retries: u64,
    pub average_batch_latency_ms: f64,
    pub dead_letter_queue_size: usize,
}

#[derive(Debug)]
struct WriterState {
    healthy: AtomicBool,
    total_successful_batches: AtomicU64,
    total_failed_batches: AtomicU64,
    total_retries: AtomicU64,
    pending_hint: AtomicUsize,
    dlq_size_cache: AtomicUsize,
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    last_successful_write: Option<DateTime<Utc>>,
    last_error: Option<String>,
    latencies_ms: CircularBuffer<f64>,
}

impl WriterState {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            total_successful_batches: AtomicU64::new(0),
            total_failed_batches: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            pending_hint: AtomicUsize::new(0),
            dlq_size_cache: AtomicUsize::new(0),
            inner: Mutex::new(StateInner {
                last_successful_write: None,
                last_error: None,
                latencies_ms: CircularBuffer::new(LATENCY_WINDOW),
            }),
        }
    }

    fn record_batch_success(&self, latency_ms: f64) {
        self.healthy.store(true, Ordering::Relaxed);
        self.total_successful_batches.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_successful_write = Some(Utc::now());
        inner.last_error = None;
        inner.latencies_ms.add(latency_ms);
    }

    /// A replayed batch counts toward the totals but not the flush latency
    /// window.
    fn record_replay_success(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        self.total_successful_batches.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_successful_write = Some(Utc::now());
        inner.last_error = None;
    }

    fn record_batch_failure(&self, error: &str, mark_unhealthy: bool) {
        self.total_failed_batches.fetch_add(1, Ordering::Relaxed);
        if mark_unhealthy {
            self.healthy.store(false, Ordering::Relaxed);
        }
        self.inner.lock().last_error = Some(error.to_string());
    }
}

/// Everything a background loop needs, cloned out of the writer so the
/// loops own their state and the writer can be queried independently.
#[derive(Clone)]
struct FlushContext {
    pool: PgPool,
    sql: ReadingsSql,
    policy: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    state: Arc<WriterState>,
    dlq: Option<Arc<DeadLetterQueue>>,
}

pub struct TimescaleWriter {
    tx: Mutex<Option<mpsc::Sender<DeviceReading>>>,
    state: Arc<WriterState>,
    dlq: Option<Arc<DeadLetterQueue>>,
    cancel: CancellationToken,
    batcher: Mutex<Option<JoinHandle<()>>>,
    replay: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    shut_down: AtomicBool,
    pool: PgPool,
    sql: ReadingsSql,
}

impl TimescaleWriter {
    /// Validate, connect, bootstrap the schema and start the background
    /// loops. The table name is checked before any SQL is built or executed;
    /// schema bootstrap runs inside the configured init budget.
    pub async fn connect(settings: TimescaleSettings) -> Result<Self, StorageError> {
        let sql = ReadingsSql::new(&settings.table_name)?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&settings.connection_string)
            .await?;

        let init_budget = Duration::from_secs(settings.database_init_timeout_seconds);
        timeout(init_budget, init_schema(&pool, &sql))
            .await
            .map_err(|_| StorageError::InitTimeout(init_budget))??;

        let dlq = if settings.enable_dead_letter_queue {
            Some(DeadLetterQueue::open(&settings.dead_letter_queue_path)?)
        } else {
            None
        };

        let state = Arc::new(WriterState::new());
        let capacity = settings.batch_size.max(1) * CHANNEL_CAPACITY_MULTIPLIER;
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();

        let context = FlushContext {
            pool: pool.clone(),
            sql: sql.clone(),
            policy: RetryPolicy::from_settings(&settings),
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms),
            state: Arc::clone(&state),
            dlq: dlq.clone(),
        };

        let batcher = tokio::spawn(run_batcher(context.clone(), rx));
        let replay = dlq.as_ref().map(|queue| {
            tokio::spawn(run_replay(
                context.clone(),
                Arc::clone(queue),
                cancel.clone(),
            ))
        });

        info!(
            table = %sql.table_name(),
            batch_size = settings.batch_size,
            flush_interval_ms = settings.flush_interval_ms,
            channel_capacity = capacity,
            dlq = settings.enable_dead_letter_queue,
            "Storage writer started"
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            state,
            dlq,
            cancel,
            batcher: Mutex::new(batcher.into()),
            replay: Mutex::new(replay),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_seconds),
            shut_down: AtomicBool::new(false),
            pool,
            sql,
        })
    }

    /// Cheap liveness probe against the pool.
    pub async fn probe(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Enqueue one reading. Suspends when the channel is full; the caller is
    /// never handed a storage error and nothing is dropped.
    pub async fn write(&self, reading: DeviceReading) -> Result<(), StorageError> {
        let sender = self.tx.lock().clone();
        let Some(sender) = sender else {
            return Err(StorageError::Shutdown);
        };
        // Counted before the send: the batcher decrements on receive, and a
        // decrement racing ahead of the increment would wrap the counter.
        self.state.pending_hint.fetch_add(1, Ordering::Relaxed);
        if sender.send(reading).await.is_err() {
            self.state.pending_hint.fetch_sub(1, Ordering::Relaxed);
            return Err(StorageError::Shutdown);
        }
        Ok(())
    }

    pub fn health(&self) -> WriterHealth {
        let inner = self.state.inner.lock();
        let latencies = inner.latencies_ms.snapshot();
        let average = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        WriterHealth {
            is_healthy: self.state.healthy.load(Ordering::Relaxed),
            last_successful_write: inner.last_successful_write,
            last_error: inner.last_error.clone(),
            pending_writes: self.state.pending_hint.load(Ordering::Relaxed),
            total_successful_batches: self.state.total_successful_batches.load(Ordering::Relaxed),
            total_failed_batches: self.state.total_failed_batches.load(Ordering::Relaxed),
            total_retries: self.state.total_retries.load(Ordering::Relaxed),
            average_batch_latency_ms: average,
            dead_letter_queue_size: self.state.dlq_size_cache.load(Ordering::Relaxed),
        }
    }

    /// Graceful drain: close intake, let the batcher flush what is queued,
    /// attempt one dead-letter replay pass, persist the queue and close.
    /// Residual items are abandoned (with a warning) once the shutdown
    /// budget runs out. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping storage writer");

        // Dropping the sender closes the channel; the batcher drains the
        // backlog and exits on its own.
        self.tx.lock().take();
        self.cancel.cancel();

        let batcher = self.batcher.lock().take();
        if let Some(mut task) = batcher {
            if timeout(self.shutdown_timeout, &mut task).await.is_err() {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Drain did not finish within the shutdown budget, abandoning residual items"
                );
                task.abort();
            }
        }

        let replay = self.replay.lock().take();
        if let Some(task) = replay {
            let _ = task.await;
        }

        if let Some(dlq) = &self.dlq {
            match replay_once(&self.pool, &self.sql, &self.state, dlq).await {
                Ok(replayed) if replayed > 0 => {
                    info!(replayed, "Final dead-letter replay pass")
                }
                Ok(_) => {}
                Err(err) => debug!(%err, "Final dead-letter replay pass failed"),
            }
            dlq.shutdown().await;
        }

        self.pool.close().await;
        info!("Storage writer stopped");
    }
}

fn uses_bulk_path(rows: usize) -> bool {
    rows > BULK_INSERT_THRESHOLD
}

async fn init_schema(pool: &PgPool, sql: &ReadingsSql) -> Result<(), StorageError> {
    sqlx::query(&sql.create_table()).execute(pool).await?;

    let extensions: i64 = sqlx::query_scalar(ReadingsSql::timescaledb_installed())
        .fetch_one(pool)
        .await?;
    if extensions > 0 {
        sqlx::query(&sql.create_hypertable()).execute(pool).await?;
        info!(table = %sql.table_name(), "Hypertable ready");
    } else {
        warn!(
            table = %sql.table_name(),
            "TimescaleDB extension not installed, falling back to a plain table"
        );
    }
    Ok(())
}

/// The sole channel reader. Accumulates until the batch is full or the
/// flush interval has elapsed with at least one pending reading, then
/// flushes. A closed channel means shutdown: flush the remainder and exit.
async fn run_batcher(context: FlushContext, mut rx: mpsc::Receiver<DeviceReading>) {
    let mut batch: Vec<DeviceReading> = Vec::with_capacity(context.batch_size);
    let mut flush_deadline = Instant::now() + context.flush_interval;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(reading) => {
                    context.state.pending_hint.fetch_sub(1, Ordering::Relaxed);
                    if batch.is_empty() {
                        flush_deadline = Instant::now() + context.flush_interval;
                    }
                    batch.push(reading);
                    if batch.len() >= context.batch_size {
                        flush_with_retry(&context, &mut batch).await;
                    }
                }
                None => {
                    if !batch.is_empty() {
                        flush_with_retry(&context, &mut batch).await;
                    }
                    break;
                }
            },
            _ = tokio::time::sleep_until(flush_deadline), if !batch.is_empty() => {
                flush_with_retry(&context, &mut batch).await;
                flush_deadline = Instant::now() + context.flush_interval;
            }
        }
    }
    debug!("Batch writer stopped");
}

/// Flush one batch under the retry policy. After exhaustion the batch goes
/// to the DLQ (when enabled) and the loop continues; nothing propagates to
/// producers.
async fn flush_with_retry(context: &FlushContext, batch: &mut Vec<DeviceReading>) {
    let readings = std::mem::take(batch);
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match write_batch(&context.pool, &context.sql, &readings).await {
            Ok(()) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                context.state.record_batch_success(latency_ms);
                debug!(rows = readings.len(), latency_ms, "Batch flushed");
                return;
            }
            Err(err) if attempt < context.policy.max_attempts => {
                attempt += 1;
                context.state.total_retries.fetch_add(1, Ordering::Relaxed);
                let delay = context.policy.delay_for(attempt);
                warn!(
                    attempt,
                    max = context.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "Batch write failed, backing off"
                );
                sleep(delay).await;
            }
            Err(err) => {
                let message = err.to_string();
                match &context.dlq {
                    Some(dlq) => {
                        warn!(
                            rows = readings.len(),
                            %err,
                            "Retries exhausted, routing batch to dead-letter queue"
                        );
                        context.state.record_batch_failure(&message, false);
                        dlq.enqueue(readings, message, 0);
                        let size = dlq.size().await;
                        context.state.dlq_size_cache.store(size, Ordering::Relaxed);
                    }
                    None => {
                        error!(
                            rows = readings.len(),
                            %err,
                            "Retries exhausted and no dead-letter queue, batch lost"
                        );
                        context.state.record_batch_failure(&message, true);
                    }
                }
                return;
            }
        }
    }
}

/// Upsert a batch. Small batches use a parameterized multi-row insert, big
/// ones a single statement with eight array binds expanded by UNNEST. Both
/// upsert on `(timestamp, device_id, channel)` so replays are idempotent.
async fn write_batch(
    pool: &PgPool,
    sql: &ReadingsSql,
    readings: &[DeviceReading],
) -> Result<(), StorageError> {
    if readings.is_empty() {
        return Ok(());
    }

    if uses_bulk_path(readings.len()) {
        let n = readings.len();
        let mut timestamps = Vec::with_capacity(n);
        let mut device_ids = Vec::with_capacity(n);
        let mut channels = Vec::with_capacity(n);
        let mut raw_values = Vec::with_capacity(n);
        let mut processed = Vec::with_capacity(n);
        let mut rates: Vec<Option<f64>> = Vec::with_capacity(n);
        let mut qualities = Vec::with_capacity(n);
        let mut units = Vec::with_capacity(n);
        for reading in readings {
            timestamps.push(reading.timestamp);
            device_ids.push(reading.device_id.clone());
            channels.push(reading.channel);
            raw_values.push(reading.raw_value);
            processed.push(reading.processed_value);
            rates.push(reading.rate);
            qualities.push(reading.quality.as_str().to_string());
            units.push(reading.unit.clone());
        }

        sqlx::query(&sql.bulk_unnest_insert())
            .bind(timestamps)
            .bind(device_ids)
            .bind(channels)
            .bind(raw_values)
            .bind(processed)
            .bind(rates)
            .bind(qualities)
            .bind(units)
            .execute(pool)
            .await?;
    } else {
        let statement = sql.multi_row_insert(readings.len());
        let mut query = sqlx::query(&statement);
        for reading in readings {
            query = query
                .bind(reading.timestamp)
                .bind(&reading.device_id)
                .bind(reading.channel)
                .bind(reading.raw_value)
                .bind(reading.processed_value)
                .bind(reading.rate)
                .bind(reading.quality.as_str())
                .bind(&reading.unit);
        }
        query.execute(pool).await?;
    }
    Ok(())
}

/// Once-a-minute replay of retryable dead-letter batches through the same
/// write path. An error in the pass itself backs the loop off to five
/// minutes.
async fn run_replay(context: FlushContext, dlq: Arc<DeadLetterQueue>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(REPLAY_INTERVAL) => {}
        }
        match replay_once(&context.pool, &context.sql, &context.state, &dlq).await {
            Ok(replayed) => {
                if replayed > 0 {
                    info!(replayed, "Replayed dead-letter batches");
                }
            }
            Err(err) => {
                error!(%err, "Dead-letter replay pass failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(REPLAY_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("Dead-letter replay task stopped");
}

async fn replay_once(
    pool: &PgPool,
    sql: &ReadingsSql,
    state: &WriterState,
    dlq: &DeadLetterQueue,
) -> Result<usize, StorageError> {
    let batches = dlq.snapshot().await?;
    let mut replayed = 0usize;
    for mut batch in batches {
        if !batch.should_retry() {
            continue;
        }
        match write_batch(pool, sql, &batch.readings).await {
            Ok(()) => {
                dlq.mark_processed(batch.id).await;
                state.record_replay_success();
                replayed += 1;
            }
            Err(err) => {
                debug!(id = %batch.id, %err, "Replay attempt failed");
                batch.retry_attempts += 1;
                batch.error = err.to_string();
                dlq.requeue(batch).await?;
            }
        }
    }
    state.dlq_size_cache.store(dlq.size().await, Ordering::Relaxed);
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bad_table_name_fails_before_touching_the_database() {
        // The connection string is garbage on purpose: validation must
        // reject the table name before a connection is ever attempted.
        for bad_table in ["drop", "readings; drop table x"] {
            let settings = TimescaleSettings {
                connection_string: "postgres://nobody@nowhere:1/void".to_string(),
                table_name: bad_table.to_string(),
                ..TimescaleSettings::default()
            };
            let Err(err) = TimescaleWriter::connect(settings).await else {
                panic!("expected rejection for {bad_table:?}");
            };
            assert!(matches!(err, StorageError::TableName(_)));
        }
    }

    #[test]
    fn bulk_path_cutover() {
        assert!(!uses_bulk_path(1));
        assert!(!uses_bulk_path(10));
        assert!(uses_bulk_path(11));
        assert!(uses_bulk_path(500));
    }

    #[test]
    fn fresh_state_reports_healthy_and_empty() {
        let state = WriterState::new();
        assert!(state.healthy.load(Ordering::Relaxed));
        let inner = state.inner.lock();
        assert!(inner.last_successful_write.is_none());
        assert!(inner.latencies_ms.is_empty());
    }

    #[test]
    fn latency_average_window_is_bounded() {
        let state = WriterState::new();
        for i in 0..250 {
            state.record_batch_success(i as f64);
        }
        let inner = state.inner.lock();
        assert_eq!(inner.latencies_ms.len(), LATENCY_WINDOW);
        // Only the most recent 100 samples remain: 150..250.
        assert_eq!(inner.latencies_ms.peek_oldest(), Some(&150.0));
    }

    #[test]
    fn failure_without_dlq_marks_unhealthy() {
        let state = WriterState::new();
        state.record_batch_failure("timeout", true);
        assert!(!state.healthy.load(Ordering::Relaxed));
        assert_eq!(state.total_failed_batches.load(Ordering::Relaxed), 1);
        assert_eq!(
            state.inner.lock().last_error.as_deref(),
            Some("timeout")
        );
    }
}
