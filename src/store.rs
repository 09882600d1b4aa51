//! Model/Threshold Store - versioned, atomically published pair models
//!
//! Read-mostly map from (robot_id, axis) to the current fitted baseline and
//! its threshold set. The write path runs only at training time and publishes
//! by swapping the whole map in one atomic operation, so a streaming reader
//! always sees a fully consistent (model, thresholds) version and never a
//! half-written entry.
//!
//! A JSON snapshot with a schema-version guard makes published models survive
//! restarts; on load the version counters continue where they left off.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{AxisKey, BaselineModel, ThresholdSet};

/// Schema version for the model snapshot file.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema version mismatch: file has v{0}, expected v{1}")]
    SchemaMismatch(u32, u32),
}

/// One published version for a pair: the baseline and the thresholds derived
/// from it always travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairModel {
    pub model: BaselineModel,
    pub thresholds: ThresholdSet,
    /// Monotonic per-pair version; bumps on every republish.
    pub version: u32,
}

impl PairModel {
    pub fn key(&self) -> AxisKey {
        self.model.key()
    }
}

/// Serializable snapshot for persistence.
#[derive(Serialize, Deserialize)]
struct StoreState {
    schema_version: u32,
    entries: Vec<PairModel>,
}

// ============================================================================
// Store
// ============================================================================

type PairMap = HashMap<AxisKey, Arc<PairModel>>;

/// Lock-free published-model store.
///
/// Readers call [`lookup`](Self::lookup) on the hot path (one atomic load per
/// record); writers clone-and-swap the map. No reader ever blocks a writer or
/// vice versa.
#[derive(Debug, Default)]
pub struct ModelStore {
    inner: ArcSwap<PairMap>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(PairMap::new()),
        }
    }

    /// Current model + thresholds for a pair. `None` means the pair is not
    /// monitored — callers treat that as a drop-and-count condition, never a
    /// fatal error.
    pub fn lookup(&self, key: &AxisKey) -> Option<Arc<PairModel>> {
        self.inner.load().get(key).cloned()
    }

    /// Publish one pair. The new version supersedes any prior one atomically;
    /// in-flight readers keep the version they already loaded.
    pub fn publish(&self, model: BaselineModel, thresholds: ThresholdSet) {
        self.publish_batch(vec![(model, thresholds)]);
    }

    /// Publish a batch of pairs in a single atomic swap. This is the training
    /// path: all activated pairs of a training run become visible together.
    pub fn publish_batch(&self, pairs: Vec<(BaselineModel, ThresholdSet)>) {
        if pairs.is_empty() {
            return;
        }
        self.inner.rcu(|current| {
            let mut next: PairMap = (**current).clone();
            for (model, thresholds) in &pairs {
                let key = model.key();
                let version = next.get(&key).map_or(1, |prev| prev.version + 1);
                next.insert(
                    key,
                    Arc::new(PairModel {
                        model: model.clone(),
                        thresholds: thresholds.clone(),
                        version,
                    }),
                );
            }
            next
        });
        debug!(published = pairs.len(), total = self.len(), "Models published");
    }

    /// Keys of all currently monitored pairs, in deterministic order.
    pub fn monitored_pairs(&self) -> Vec<AxisKey> {
        let mut keys: Vec<AxisKey> = self.inner.load().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Save the published map to a JSON snapshot. Parent directories are
    /// created automatically.
    pub fn save_to_file(&self, path: &Path) -> Result<(), StoreError> {
        let mut entries: Vec<PairModel> = self
            .inner
            .load()
            .values()
            .map(|e| (**e).clone())
            .collect();
        entries.sort_by_key(PairModel::key);

        let state = StoreState {
            schema_version: SCHEMA_VERSION,
            entries,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), pairs = self.len(), "Model snapshot saved");
        Ok(())
    }

    /// Load a snapshot from disk. Fails on a schema mismatch rather than
    /// guessing at field meanings across versions.
    pub fn load_from_file(path: &Path) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path)?;
        let state: StoreState = serde_json::from_str(&json)?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch(state.schema_version, SCHEMA_VERSION));
        }

        let map: PairMap = state
            .entries
            .into_iter()
            .map(|e| (e.key(), Arc::new(e)))
            .collect();
        let pairs = map.len();
        info!(path = %path.display(), pairs, "Model snapshot loaded");

        Ok(Self {
            inner: ArcSwap::from_pointee(map),
        })
    }

    /// Load from file if present and valid, otherwise start empty.
    pub fn load_or_new(path: &Path) -> Self {
        match Self::load_from_file(path) {
            Ok(store) => store,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No model snapshot found, starting empty");
                Self::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable model snapshot");
                Self::new()
            }
        }
    }
}
