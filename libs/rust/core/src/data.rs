//! Training data model, the external data source seam and the bounded
//! version-keyed cache in front of it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlError, FlResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub features: Vec<f32>,
    pub label: f32,
    pub weight: f32,
}

impl TrainingSample {
    pub fn new(features: Vec<f32>, label: f32) -> Self { Self { features, label, weight: 1.0 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingData {
    pub samples: Vec<TrainingSample>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub quality_score: f32,
}

impl TrainingData {
    pub fn new(source: impl Into<String>, samples: Vec<TrainingSample>) -> Self {
        Self { samples, source: source.into(), fetched_at: Utc::now(), quality_score: 1.0 }
    }

    pub fn len(&self) -> usize { self.samples.len() }
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    pub fn feature_dim(&self) -> Option<usize> { self.samples.first().map(|s| s.features.len()) }

    /// Rejects data the trainer cannot consume. Empty sets pass; callers
    /// decide what an empty fetch means.
    pub fn validate(&self) -> FlResult<()> {
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(FlError::Data(format!("quality score {} outside [0,1]", self.quality_score)));
        }
        let dim = match self.feature_dim() { Some(d) => d, None => return Ok(()) };
        if dim == 0 { return Err(FlError::Data("samples have no features".into())); }
        for (i, s) in self.samples.iter().enumerate() {
            if s.features.len() != dim {
                return Err(FlError::Data(format!("sample {i} has {} features, expected {dim}", s.features.len())));
            }
            if !s.label.is_finite() || s.features.iter().any(|f| !f.is_finite()) {
                return Err(FlError::Data(format!("sample {i} contains non-finite values")));
            }
            if !(s.weight > 0.0) || !s.weight.is_finite() {
                return Err(FlError::Data(format!("sample {i} has invalid weight {}", s.weight)));
            }
        }
        Ok(())
    }

    /// Splits off a validation tail. Sets too small to split validate on the
    /// full set.
    pub fn split_validation(&self, fraction: f32) -> (Vec<TrainingSample>, Vec<TrainingSample>) {
        let n = self.samples.len();
        let held_out = ((n as f32) * fraction.clamp(0.0, 0.9)).floor() as usize;
        if held_out == 0 || held_out >= n {
            return (self.samples.clone(), self.samples.clone());
        }
        let (train, valid) = self.samples.split_at(n - held_out);
        (train.to_vec(), valid.to_vec())
    }
}

/// External, potentially slow, source of labelled samples.
#[async_trait]
pub trait TrainingDataSource: Send + Sync {
    async fn fetch(&self, version_key: &str) -> FlResult<TrainingData>;
}

pub fn cache_key(model_version: &str) -> String { format!("training-data-v{model_version}") }

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Arc<TrainingData>>,
    order: VecDeque<String>,
}

/// Bounded map with oldest-inserted-first eviction. Reads take a shared lock,
/// so concurrent sessions can hit it without serializing.
pub struct TrainingDataCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

impl TrainingDataCache {
    pub fn new(capacity: usize) -> Self { Self { capacity: capacity.max(1), inner: RwLock::new(CacheInner::default()) } }

    pub fn get(&self, key: &str) -> Option<Arc<TrainingData>> { self.inner.read().entries.get(key).cloned() }

    pub fn insert(&self, key: String, data: Arc<TrainingData>) {
        let mut inner = self.inner.write();
        if inner.entries.insert(key.clone(), data).is_none() { inner.order.push_back(key); }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => { inner.entries.remove(&oldest); debug!(key = %oldest, "training data evicted"); }
                None => break,
            }
        }
    }

    pub async fn get_or_fetch(&self, source: &dyn TrainingDataSource, key: &str) -> FlResult<Arc<TrainingData>> {
        if let Some(hit) = self.get(key) { debug!(key, "training data cache hit"); return Ok(hit); }
        let data = Arc::new(source.fetch(key).await?);
        self.insert(key.to_string(), data.clone());
        Ok(data)
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.write();
        if inner.entries.remove(key).is_some() { inner.order.retain(|k| k != key); }
    }

    pub fn len(&self) -> usize { self.inner.read().entries.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
