use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// One round's model contribution. Transient: produced by the trainer and
/// consumed by privacy, channel and apply steps of the same round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub weights: Vec<Tensor>,
    pub loss: f32,
    pub samples: usize,
    pub timestamp: DateTime<Utc>,
}

impl ModelUpdate {
    pub fn new(weights: Vec<Tensor>, loss: f32, samples: usize) -> Self {
        Self { weights, loss, samples, timestamp: Utc::now() }
    }

    pub fn parameter_count(&self) -> usize { self.weights.iter().map(Tensor::len).sum() }

    pub fn is_finite(&self) -> bool { self.loss.is_finite() && self.weights.iter().all(Tensor::is_finite) }
}
