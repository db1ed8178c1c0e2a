//! Numeric backend seam. The controller only ever talks to `NumericBackend`;
//! `LinearModel` is the in-tree implementation used by the runner and tests.

use crate::data::TrainingSample;
use crate::error::{FlError, FlResult};
use crate::tensor::Tensor;

/// Loss and parameter gradients produced by one mini-batch.
#[derive(Debug, Clone)]
pub struct BatchGradients {
    pub loss: f32,
    pub gradients: Vec<Tensor>,
    pub weight_sum: f32,
}

pub trait NumericBackend: Send + Sync + 'static {
    fn initial_weights(&self) -> Vec<Tensor>;

    fn predict(&self, weights: &[Tensor], features: &[f32]) -> FlResult<f32>;

    /// Forward + backward pass over one batch: regularized loss
    /// (weighted MSE + `l2 * ||w||^2`) and its gradients.
    fn batch_gradients(&self, weights: &[Tensor], batch: &[TrainingSample], l2: f32) -> FlResult<BatchGradients>;

    /// Held-out evaluation used after an update is applied.
    fn evaluate(&self, weights: &[Tensor], samples: &[TrainingSample]) -> FlResult<f32> {
        let mut sq = 0.0f32;
        let mut total = 0.0f32;
        for s in samples {
            let err = self.predict(weights, &s.features)? - s.label;
            sq += s.weight * err * err;
            total += s.weight;
        }
        if total <= 0.0 { return Err(FlError::Data("no validation samples".into())); }
        Ok(sq / total)
    }
}

/// Linear regressor `y = w·x + b`; parameters are `[w (dim), b (1)]`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    input_dim: usize,
}

impl LinearModel {
    pub fn new(input_dim: usize) -> Self { Self { input_dim } }
    pub fn input_dim(&self) -> usize { self.input_dim }

    fn unpack<'a>(&self, weights: &'a [Tensor]) -> FlResult<(&'a Tensor, f32)> {
        match weights {
            [w, b] if w.len() == self.input_dim && b.len() == 1 => Ok((w, b.data()[0])),
            _ => Err(FlError::Backend(format!("linear model expects [w({}), b(1)] parameters", self.input_dim))),
        }
    }
}

impl NumericBackend for LinearModel {
    fn initial_weights(&self) -> Vec<Tensor> {
        vec![Tensor::zeros(vec![self.input_dim]), Tensor::zeros(vec![1])]
    }

    fn predict(&self, weights: &[Tensor], features: &[f32]) -> FlResult<f32> {
        let (w, b) = self.unpack(weights)?;
        Ok(w.dot(features)? + b)
    }

    fn batch_gradients(&self, weights: &[Tensor], batch: &[TrainingSample], l2: f32) -> FlResult<BatchGradients> {
        let (w, _) = self.unpack(weights)?;
        let mut grad_w = vec![0.0f32; self.input_dim];
        let mut grad_b = 0.0f32;
        let mut sq = 0.0f32;
        let mut weight_sum = 0.0f32;
        for s in batch {
            let err = self.predict(weights, &s.features)? - s.label;
            sq += s.weight * err * err;
            weight_sum += s.weight;
            let g = 2.0 * s.weight * err;
            for (gw, x) in grad_w.iter_mut().zip(&s.features) { *gw += g * x; }
            grad_b += g;
        }
        if weight_sum <= 0.0 { return Err(FlError::Data("empty batch".into())); }
        let mse = sq / weight_sum;
        let penalty = l2 * w.squared_norm();
        let mut gw = Tensor::from_vec(grad_w);
        gw.scale_in_place(1.0 / weight_sum);
        gw.axpy(2.0 * l2, w)?;
        let gb = Tensor::from_vec(vec![grad_b / weight_sum]);
        Ok(BatchGradients { loss: mse + penalty, gradients: vec![gw, gb], weight_sum })
    }
}
