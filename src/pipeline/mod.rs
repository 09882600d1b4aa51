//! Detection Pipeline - one worker per monitored (robot, axis) pair
//!
//! Pairs never share mutable state, so the pipeline runs one tokio task per
//! pair, each owning its scorer handle and episode tracker, fed by a bounded
//! per-pair channel. Within a pair processing is strictly sequential and
//! in arrival order; across pairs it is embarrassingly parallel.
//!
//! Emission is decoupled: workers push finalized events onto a channel
//! drained by the emitter task, so sink latency never stalls detection.
//!
//! Shutdown is graceful by default: dropping the per-pair senders lets every
//! worker drain its queue, log any open episode, and exit; the event channel
//! then drains and the emitter stops. The cancellation token is the abort
//! path (ctrl-c) where queued records are allowed to be lost.

pub mod source;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config;
use crate::emitter::{run_emitter, EventEmitter};
use crate::episode::EpisodeTracker;
use crate::scorer::{CounterSnapshot, DiagnosticCounters, StreamingScorer};
use crate::store::ModelStore;
use crate::types::{AxisKey, Event, TelemetryRecord};

use self::source::{SourceEvent, TelemetrySource};

/// Per-pair worker arena plus the emitter task.
pub struct DetectorPipeline {
    workers: HashMap<AxisKey, mpsc::Sender<TelemetryRecord>>,
    tasks: JoinSet<()>,
    emitter_task: tokio::task::JoinHandle<()>,
    event_tx: mpsc::Sender<Event>,
    counters: Arc<DiagnosticCounters>,
    cancel: CancellationToken,
}

impl DetectorPipeline {
    /// Spawn one worker per pair currently published in the store.
    pub fn new(
        store: Arc<ModelStore>,
        emitter: EventEmitter,
        counters: Arc<DiagnosticCounters>,
    ) -> Self {
        let cfg = config::get();
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel::<Event>(cfg.streaming.channel_capacity);
        let emitter_task = tokio::spawn(run_emitter(event_rx, emitter));

        let mut workers = HashMap::new();
        let mut tasks = JoinSet::new();
        let pairs = store.monitored_pairs();
        for key in &pairs {
            let (tx, rx) = mpsc::channel::<TelemetryRecord>(cfg.streaming.channel_capacity);
            workers.insert(*key, tx);

            let scorer = StreamingScorer::new(store.clone(), counters.clone());
            let tracker = EpisodeTracker::new(
                *key,
                cfg.streaming.max_sample_gap_seconds,
                cfg.streaming.cooldown_seconds,
                counters.clone(),
            );
            tasks.spawn(pair_worker(
                rx,
                scorer,
                tracker,
                event_tx.clone(),
                cancel.clone(),
            ));
        }

        info!(pairs = pairs.len(), "Detection pipeline started");
        Self {
            workers,
            tasks,
            emitter_task,
            event_tx,
            counters,
            cancel,
        }
    }

    /// Token that aborts all workers without draining their queues.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Route one record to its pair's worker. Malformed keys and records for
    /// unmonitored pairs are dropped with a counter — not an error.
    pub async fn dispatch(&self, record: TelemetryRecord) {
        let key = record.key();
        if !key.is_valid() {
            self.counters.malformed_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(robot_id = record.robot_id, axis = record.axis,
                   "Axis index outside declared range — record skipped");
            return;
        }
        match self.workers.get(&key) {
            Some(tx) => {
                if tx.send(record).await.is_err() {
                    warn!(pair = %key, "Worker gone — record dropped");
                }
            }
            None => {
                self.counters
                    .unmonitored_dropped
                    .fetch_add(1, Ordering::Relaxed);
                debug!(pair = %key, "Record for unmonitored pair dropped");
            }
        }
    }

    /// Feed records from a source until EOF or cancellation.
    pub async fn run_source<S: TelemetrySource>(&self, mut source: S) {
        let name = source.source_name().to_string();
        info!(source = %name, "Feeding telemetry");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(source = %name, "Feed cancelled");
                    break;
                }
                next = source.next_record() => match next {
                    Ok(SourceEvent::Record(record)) => {
                        self.dispatch(record).await;
                    }
                    Ok(SourceEvent::Eof) => {
                        info!(source = %name, "Source reached end of data");
                        break;
                    }
                    Err(e) => {
                        warn!(source = %name, error = %e, "Source failed — stopping feed");
                        break;
                    }
                },
            }
        }
    }

    /// Graceful shutdown: drain workers, drain the event channel, stop the
    /// emitter, and report final diagnostics.
    pub async fn shutdown(mut self) -> CounterSnapshot {
        self.workers.clear();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Pair worker panicked");
            }
        }
        drop(self.event_tx);
        if let Err(e) = self.emitter_task.await {
            warn!(error = %e, "Emitter task failed");
        }

        let snapshot = self.counters.snapshot();
        info!(
            scored = snapshot.records_scored,
            emitted = snapshot.events_emitted,
            suppressed = snapshot.events_suppressed,
            discarded = snapshot.episodes_discarded,
            unmonitored = snapshot.unmonitored_dropped,
            out_of_order = snapshot.out_of_order_rejected,
            "Detection pipeline stopped"
        );
        snapshot
    }
}

/// One pair's worker loop: score, evaluate the state machine, forward events.
async fn pair_worker(
    mut rx: mpsc::Receiver<TelemetryRecord>,
    scorer: StreamingScorer,
    mut tracker: EpisodeTracker,
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            record = rx.recv() => {
                let Some(record) = record else { break };
                let (point, entry) = match scorer.score(&record) {
                    Ok(scored) => scored,
                    Err(e) => {
                        // model withdrawn between routing and scoring;
                        // counter already bumped by the scorer
                        debug!(error = %e, "Record dropped at scoring");
                        continue;
                    }
                };
                match tracker.observe(&point, &entry.thresholds) {
                    Ok(Some(event)) => {
                        if event_tx.send(event).await.is_err() {
                            warn!(pair = %tracker.key(), "Emitter gone — event lost");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // counter already bumped; state intentionally untouched
                        warn!(error = %e, "Rejected out-of-order record");
                    }
                }
            }
        }
    }
    tracker.finish();
}
