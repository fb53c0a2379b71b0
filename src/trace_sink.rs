//! Best-effort, batched persistence of trace events.
//!
//! ```text
//! TraceRecorder --offer--> ChannelTap --try_send--> [bounded queue] --> writer task --> TraceSink
//! ```
//!
//! The tap never waits: when the queue is full the event is dropped and
//! counted. The writer flushes when a batch fills or the flush interval
//! elapses. A failing sink loses that batch and nothing else; the recorder
//! and the pipeline it observes are unaffected either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ragline_core::trace::{TraceEvent, TraceTap};

use crate::config::TraceConfig;
use crate::sqlite_store::{format_ts, parse_ts};

/// Durable destination for trace batches.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn persist_batch(&self, events: &[TraceEvent]) -> Result<()>;
}

/// [`TraceTap`] that forwards into a bounded channel without blocking.
pub struct ChannelTap {
    tx: mpsc::Sender<TraceEvent>,
    dropped: AtomicU64,
}

impl ChannelTap {
    /// Events discarded because the queue was full or the writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TraceTap for ChannelTap {
    fn offer(&self, event: &TraceEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

impl From<&TraceConfig> for WriterConfig {
    fn from(config: &TraceConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

/// Handle to the background writer task.
pub struct TraceWriter {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TraceWriter {
    /// Flush whatever is queued, then stop the writer.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "trace writer task failed");
        }
    }
}

/// Spawn the writer task. Must be called from within a tokio runtime.
pub fn spawn_trace_writer(
    sink: Arc<dyn TraceSink>,
    config: WriterConfig,
) -> (Arc<ChannelTap>, TraceWriter) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let tap = Arc::new(ChannelTap {
        tx,
        dropped: AtomicU64::new(0),
    });
    let handle = tokio::spawn(run_writer(rx, shutdown_rx, sink, config));
    (
        tap,
        TraceWriter {
            shutdown: shutdown_tx,
            handle,
        },
    )
}

async fn run_writer(
    mut rx: mpsc::Receiver<TraceEvent>,
    mut shutdown: oneshot::Receiver<()>,
    sink: Arc<dyn TraceSink>,
    config: WriterConfig,
) {
    let mut batch: Vec<TraceEvent> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= config.batch_size {
                        flush(sink.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(sink.as_ref(), &mut batch).await,
            _ = &mut shutdown => {
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                    if batch.len() >= config.batch_size {
                        flush(sink.as_ref(), &mut batch).await;
                    }
                }
                break;
            }
        }
    }

    flush(sink.as_ref(), &mut batch).await;
    debug!("trace writer stopped");
}

async fn flush(sink: &dyn TraceSink, batch: &mut Vec<TraceEvent>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = sink.persist_batch(batch).await {
        warn!(error = %e, events = batch.len(), "trace batch discarded");
    }
    batch.clear();
}

/// Persists trace events to the `trace_events` table.
pub struct SqliteTraceSink {
    pool: SqlitePool,
}

impl SqliteTraceSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Up to `limit` persisted events, most recent first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<TraceEvent>> {
        let rows = sqlx::query(
            "SELECT correlation_id, timestamp, duration_ms, payload_json \
             FROM trace_events ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: String = row.get("timestamp");
            let duration_ms: Option<i64> = row.get("duration_ms");
            let payload_json: String = row.get("payload_json");
            events.push(TraceEvent {
                correlation_id: row.get("correlation_id"),
                timestamp: parse_ts(&timestamp)
                    .with_context(|| format!("bad trace timestamp '{}'", timestamp))?,
                duration_ms: duration_ms.and_then(|d| u64::try_from(d).ok()),
                payload: serde_json::from_str(&payload_json)
                    .context("Failed to decode trace payload")?,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl TraceSink for SqliteTraceSink {
    async fn persist_batch(&self, events: &[TraceEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO trace_events (correlation_id, stage, timestamp, duration_ms, payload_json) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&event.correlation_id)
            .bind(event.stage().as_str())
            .bind(format_ts(&event.timestamp))
            .bind(event.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
            .bind(serde_json::to_string(&event.payload)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
