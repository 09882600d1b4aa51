//! Event Emitter - fan-out of finalized events to external sinks
//!
//! The emitter receives fully-formed, immutable [`Event`] records on a
//! channel and hands each one to every configured sink. Sinks own their own
//! durability and retry story; the emitter logs a failure and moves on so a
//! slow or broken sink never backs up into detection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::types::{Event, EventType};

/// Destination for finalized events.
///
/// `emit` must treat the event as read-only; retries and backoff are the
/// sink's own responsibility.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &Event) -> Result<()>;

    /// Human-readable name for logging (e.g. "tracing", "jsonl", "sled").
    fn sink_name(&self) -> &str;
}

// ============================================================================
// Tracing Sink
// ============================================================================

/// Logs every event through the structured logger. Always configured first so
/// an operator tailing the process sees events even with no durable sink.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: &Event) -> Result<()> {
        match event.event_type {
            EventType::Error => error!(
                robot_id = event.robot_id,
                axis = event.axis,
                start = %event.start_time,
                end = %event.end_time,
                duration_secs = event.duration_seconds,
                max_residual = event.max_residual,
                avg_residual = event.avg_residual,
                threshold = event.threshold_used,
                ttf_days = ?event.predicted_ttf_days,
                "ERROR: sustained critical deviation"
            ),
            EventType::Alert => warn!(
                robot_id = event.robot_id,
                axis = event.axis,
                start = %event.start_time,
                end = %event.end_time,
                duration_secs = event.duration_seconds,
                max_residual = event.max_residual,
                avg_residual = event.avg_residual,
                threshold = event.threshold_used,
                ttf_days = ?event.predicted_ttf_days,
                "ALERT: sustained deviation above baseline"
            ),
        }
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "tracing"
    }
}

// ============================================================================
// JSON-Lines Sink
// ============================================================================

/// Appends one JSON object per event to a log file. Flushed per event — the
/// rate is bounded by the cooldown policy, so durability wins over batching.
pub struct JsonlSink {
    writer: Mutex<std::io::BufWriter<std::fs::File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(std::io::BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn emit(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("event log writer poisoned"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "jsonl"
    }
}

// ============================================================================
// Sled Sink (durable event table)
// ============================================================================

/// Durable event table backed by sled.
///
/// Key: end-time millis as u64 big-endian plus a process-local sequence
/// suffix (sorts chronologically, never collides when two pairs close an
/// episode in the same millisecond). Value: JSON-serialized event.
pub struct SledSink {
    db: sled::Db,
    seq: AtomicU32,
}

impl SledSink {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("opening event db {}", path.display()))?;
        Ok(Self {
            db,
            seq: AtomicU32::new(0),
        })
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let mut events = Vec::with_capacity(limit);
        for item in self.db.iter().rev() {
            if events.len() >= limit {
                break;
            }
            if let Ok((_key, value)) = item {
                if let Ok(event) = serde_json::from_slice::<Event>(&value) {
                    events.push(event);
                }
            }
        }
        events
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }
}

#[async_trait]
impl EventSink for SledSink {
    async fn emit(&self, event: &Event) -> Result<()> {
        let millis = u64::try_from(event.end_time.timestamp_millis().max(0))?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&millis.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());

        let value = serde_json::to_vec(event)?;
        self.db.insert(key, value)?;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "sled"
    }
}

// ============================================================================
// Memory Sink (tests)
// ============================================================================

/// Collects events in memory. Test instrumentation.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Fans each event out to all configured sinks.
pub struct EventEmitter {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventEmitter {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub async fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                error!(
                    sink = sink.sink_name(),
                    error = %e,
                    robot_id = event.robot_id,
                    axis = event.axis,
                    "Event sink failed — event dropped for this sink"
                );
            }
        }
    }
}

/// Drains the event channel until all senders hang up. Runs as its own task
/// so sink I/O stays off the state machine path.
pub async fn run_emitter(mut rx: mpsc::Receiver<Event>, emitter: EventEmitter) {
    let mut handled: u64 = 0;
    while let Some(event) = rx.recv().await {
        emitter.emit(&event).await;
        handled += 1;
    }
    info!(events = handled, "Event emitter drained and stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn event(offset: i64) -> Event {
        let start = Utc
            .timestamp_opt(1_700_000_000 + offset, 0)
            .single()
            .expect("valid ts");
        Event {
            robot_id: 2,
            axis: 4,
            event_type: EventType::Alert,
            start_time: start,
            end_time: start + chrono::Duration::seconds(10),
            duration_seconds: 10.0,
            max_residual: 4.2,
            avg_residual: 3.1,
            threshold_used: 2.0,
            predicted_ttf_days: Some(1.5),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_parseable_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/events.jsonl");
        let sink = JsonlSink::open(&path).expect("open");

        sink.emit(&event(0)).await.expect("emit");
        sink.emit(&event(60)).await.expect("emit");

        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Event = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(parsed.robot_id, 2);
        assert!(lines[0].contains("\"ALERT\""));
    }

    #[tokio::test]
    async fn test_sled_sink_orders_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SledSink::open(&dir.path().join("events.db")).expect("open");

        sink.emit(&event(0)).await.expect("emit");
        sink.emit(&event(60)).await.expect("emit");
        sink.emit(&event(120)).await.expect("emit");

        assert_eq!(sink.count(), 3);
        let recent = sink.recent(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].end_time > recent[1].end_time);
    }

    #[tokio::test]
    async fn test_emitter_continues_past_failing_sink() {
        struct FailingSink;

        #[async_trait]
        impl EventSink for FailingSink {
            async fn emit(&self, _event: &Event) -> Result<()> {
                anyhow::bail!("sink unavailable")
            }
            fn sink_name(&self) -> &str {
                "failing"
            }
        }

        let memory = Arc::new(MemorySink::new());

        struct SharedSink(Arc<MemorySink>);
        #[async_trait]
        impl EventSink for SharedSink {
            async fn emit(&self, event: &Event) -> Result<()> {
                self.0.emit(event).await
            }
            fn sink_name(&self) -> &str {
                "memory"
            }
        }

        let emitter = EventEmitter::new(vec![
            Box::new(FailingSink),
            Box::new(SharedSink(memory.clone())),
        ]);
        emitter.emit(&event(0)).await;
        assert_eq!(memory.events().len(), 1);
    }

    #[tokio::test]
    async fn test_run_emitter_drains_channel() {
        let memory = Arc::new(MemorySink::new());

        struct SharedSink(Arc<MemorySink>);
        #[async_trait]
        impl EventSink for SharedSink {
            async fn emit(&self, event: &Event) -> Result<()> {
                self.0.emit(event).await
            }
            fn sink_name(&self) -> &str {
                "memory"
            }
        }

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_emitter(
            rx,
            EventEmitter::new(vec![Box::new(SharedSink(memory.clone()))]),
        ));

        tx.send(event(0)).await.expect("send");
        tx.send(event(60)).await.expect("send");
        drop(tx);
        task.await.expect("join");

        assert_eq!(memory.events().len(), 2);
    }
}
