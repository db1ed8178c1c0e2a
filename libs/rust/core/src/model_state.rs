//! Owner of the committed model parameters.
//!
//! Apply is validate-then-commit-or-rollback under one exclusive lock, so a
//! concurrent reader sees either the previous weights or the accepted ones,
//! never a half-written set.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::backend::NumericBackend;
use crate::data::TrainingSample;
use crate::error::{FlError, FlResult};
use crate::tensor::Tensor;
use crate::update::ModelUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelVersion { pub major: u32, pub minor: u32, pub patch: u32 }

impl ModelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self { Self { major, minor, patch } }
    pub fn bump_patch(self) -> Self { Self { patch: self.patch + 1, ..self } }
}

impl Default for ModelVersion {
    fn default() -> Self { Self::new(1, 0, 0) }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}.{}", self.major, self.minor, self.patch) }
}

impl FromStr for ModelVersion {
    type Err = FlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let parse = |p: &str| p.parse::<u32>().map_err(|_| FlError::Configuration(format!("invalid version '{s}'")));
        match parts.as_slice() {
            [a, b, c] => Ok(Self::new(parse(a)?, parse(b)?, parse(c)?)),
            _ => Err(FlError::Configuration(format!("invalid version '{s}'"))),
        }
    }
}

pub fn weights_checksum(weights: &[Tensor]) -> String {
    let mut hasher = Sha256::new();
    for t in weights {
        for v in t.data() { hasher.update(v.to_le_bytes()); }
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: ModelVersion,
    pub round: Option<u32>,
    pub weights: Vec<Tensor>,
    pub loss: Option<f32>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

pub trait SnapshotStore: Send + Sync {
    fn persist(&self, snapshot: &ModelSnapshot) -> FlResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<Vec<ModelSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self { Self::default() }
    pub fn snapshots(&self) -> Vec<ModelSnapshot> { self.snapshots.lock().clone() }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn persist(&self, snapshot: &ModelSnapshot) -> FlResult<()> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore { dir: PathBuf }

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn path_for(&self, snapshot: &ModelSnapshot) -> PathBuf {
        let name = match snapshot.round {
            Some(r) => format!("model-{}-round-{r}.json", snapshot.version),
            None => format!("model-{}-final.json", snapshot.version),
        };
        self.dir.join(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn persist(&self, snapshot: &ModelSnapshot) -> FlResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FlError::Persistence(format!("{}: {e}", self.dir.display())))?;
        let body = serde_json::to_vec_pretty(snapshot).map_err(|e| FlError::Persistence(e.to_string()))?;
        let path = self.path_for(snapshot);
        std::fs::write(&path, body).map_err(|e| FlError::Persistence(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Committed { validation_loss: f32 },
    RolledBack { attempted_loss: f32, restored_loss: f32 },
}

impl ApplyOutcome {
    pub fn attempted_loss(&self) -> f32 {
        match *self { ApplyOutcome::Committed { validation_loss } => validation_loss, ApplyOutcome::RolledBack { attempted_loss, .. } => attempted_loss }
    }
    pub fn committed_loss(&self) -> f32 {
        match *self { ApplyOutcome::Committed { validation_loss } => validation_loss, ApplyOutcome::RolledBack { restored_loss, .. } => restored_loss }
    }
    pub fn is_rollback(&self) -> bool { matches!(self, ApplyOutcome::RolledBack { .. }) }
}

#[derive(Debug)]
struct ModelState {
    weights: Vec<Tensor>,
    committed_loss: Option<f32>,
    version: ModelVersion,
}

pub struct ModelStateManager {
    backend: Arc<dyn NumericBackend>,
    store: Arc<dyn SnapshotStore>,
    rollback_factor: f32,
    state: RwLock<ModelState>,
    validation: RwLock<Arc<Vec<TrainingSample>>>,
}

impl ModelStateManager {
    pub fn new(backend: Arc<dyn NumericBackend>, store: Arc<dyn SnapshotStore>, rollback_factor: f32, version: ModelVersion) -> Self {
        let weights = backend.initial_weights();
        Self {
            backend,
            store,
            rollback_factor,
            state: RwLock::new(ModelState { weights, committed_loss: None, version }),
            validation: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn weights(&self) -> Vec<Tensor> { self.state.read().weights.clone() }
    pub fn version(&self) -> ModelVersion { self.state.read().version }
    pub fn committed_loss(&self) -> Option<f32> { self.state.read().committed_loss }

    pub fn set_validation_set(&self, samples: Vec<TrainingSample>) { *self.validation.write() = Arc::new(samples); }

    fn evaluate(&self, weights: &[Tensor]) -> FlResult<f32> {
        let samples = self.validation.read().clone();
        if samples.is_empty() { return Err(FlError::Data("validation set is empty".into())); }
        self.backend.evaluate(weights, &samples)
    }

    /// Evaluates the committed weights and records the result as the
    /// reference loss for the next rollback decision.
    pub fn validate(&self) -> FlResult<f32> {
        let mut state = self.state.write();
        let loss = self.evaluate(&state.weights)?;
        state.committed_loss = Some(loss);
        Ok(loss)
    }

    pub fn apply(&self, update: &ModelUpdate) -> FlResult<ApplyOutcome> {
        let mut state = self.state.write();
        let same_layout = update.weights.len() == state.weights.len()
            && update.weights.iter().zip(&state.weights).all(|(a, b)| a.shape() == b.shape());
        if !same_layout {
            return Err(FlError::Backend("aggregated update does not match the model layout".into()));
        }
        let backup = std::mem::replace(&mut state.weights, update.weights.clone());
        let validation_loss = match self.evaluate(&state.weights) {
            Ok(l) => l,
            Err(e) => { state.weights = backup; return Err(e); }
        };
        let previous = state.committed_loss;
        let rejected = !validation_loss.is_finite() || previous.map_or(false, |p| validation_loss > p * self.rollback_factor);
        if rejected {
            state.weights = backup;
            let restored_loss = previous.unwrap_or(f32::NAN);
            warn!(validation_loss, previous_loss = ?previous, factor = self.rollback_factor, "update rejected, weights restored");
            return Ok(ApplyOutcome::RolledBack { attempted_loss: validation_loss, restored_loss });
        }
        state.committed_loss = Some(validation_loss);
        Ok(ApplyOutcome::Committed { validation_loss })
    }

    pub fn snapshot(&self, round: Option<u32>) -> FlResult<ModelSnapshot> {
        let snap = {
            let state = self.state.read();
            ModelSnapshot {
                version: state.version,
                round,
                checksum: weights_checksum(&state.weights),
                weights: state.weights.clone(),
                loss: state.committed_loss,
                created_at: Utc::now(),
            }
        };
        self.store.persist(&snap)?;
        Ok(snap)
    }

    pub fn bump_patch(&self) -> ModelVersion {
        let mut state = self.state.write();
        state.version = state.version.bump_patch();
        info!(version = %state.version, "model version bumped");
        state.version
    }
}
