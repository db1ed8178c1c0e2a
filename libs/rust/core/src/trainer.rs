//! Local trainer: concurrent mini-batch gradient passes, single-writer
//! parameter update per epoch.
//!
//! Batches of one epoch run on the blocking pool, bounded by a semaphore,
//! each against a read-only snapshot of the weights. Gradients are combined
//! in batch order, clipped by global norm and applied with momentum SGD once
//! the whole epoch has finished, so no task ever writes parameters.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, instrument};

use crate::backend::{BatchGradients, NumericBackend};
use crate::data::TrainingSample;
use crate::error::{FlError, FlResult};
use crate::metrics::FL_METRICS;
use crate::session::FederatedConfig;
use crate::settings::ControllerSettings;
use crate::tensor::{global_norm, Tensor};
use crate::update::ModelUpdate;

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub optimal_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub l2_coefficient: f32,
    pub max_grad_norm: f32,
    pub momentum: f32,
}

impl From<&ControllerSettings> for TrainerOptions {
    fn from(s: &ControllerSettings) -> Self {
        Self {
            optimal_batch_size: s.optimal_batch_size,
            max_concurrent_batches: s.max_concurrent_batches,
            l2_coefficient: s.l2_coefficient,
            max_grad_norm: s.max_grad_norm,
            momentum: s.momentum,
        }
    }
}

impl Default for TrainerOptions {
    fn default() -> Self { (&ControllerSettings::default()).into() }
}

/// Scales gradients down so their global L2 norm is at most `max_norm`.
pub fn clip_by_global_norm(gradients: &mut [Tensor], max_norm: f32) -> f32 {
    let norm = global_norm(gradients);
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for g in gradients.iter_mut() { g.scale_in_place(scale); }
    }
    norm
}

/// Momentum SGD state for one training call.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    learning_rate: f32,
    momentum: f32,
    velocity: Vec<Tensor>,
}

impl MomentumSgd {
    pub fn new(learning_rate: f32, momentum: f32, params: &[Tensor]) -> Self {
        let velocity = params.iter().map(|p| Tensor::zeros(p.shape().to_vec())).collect();
        Self { learning_rate, momentum, velocity }
    }

    pub fn step(&mut self, params: &mut [Tensor], gradients: &[Tensor]) -> FlResult<()> {
        if params.len() != gradients.len() || params.len() != self.velocity.len() {
            return Err(FlError::Backend("gradient/parameter arity mismatch".into()));
        }
        for ((p, g), v) in params.iter_mut().zip(gradients).zip(self.velocity.iter_mut()) {
            v.scale_in_place(self.momentum);
            v.axpy(1.0, g)?;
            p.axpy(-self.learning_rate, v)?;
        }
        Ok(())
    }
}

pub struct LocalTrainer {
    backend: Arc<dyn NumericBackend>,
    options: TrainerOptions,
    permits: Arc<Semaphore>,
    progress: watch::Sender<f32>,
}

impl LocalTrainer {
    pub fn new(backend: Arc<dyn NumericBackend>, options: TrainerOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_batches.max(1)));
        let (progress, _) = watch::channel(0.0);
        Self { backend, options, permits, progress }
    }

    /// Fraction of epochs finished in the current `train` call.
    pub fn subscribe_progress(&self) -> watch::Receiver<f32> { self.progress.subscribe() }

    pub fn batch_size(&self, config: &FederatedConfig) -> usize {
        self.options.optimal_batch_size.min(config.batch_size).max(1)
    }

    #[instrument(skip(self, initial, samples, config), fields(samples = samples.len()))]
    pub async fn train(&self, initial: Vec<Tensor>, samples: Arc<Vec<TrainingSample>>, config: &FederatedConfig, round: u32) -> FlResult<ModelUpdate> {
        if samples.is_empty() {
            return Err(FlError::Data(format!("no training data for round {round}")));
        }
        let started = Instant::now();
        let batch_size = self.batch_size(config);
        let n = samples.len();
        let mut weights = initial;
        let mut optimizer = MomentumSgd::new(config.learning_rate, self.options.momentum, &weights);
        let mut epoch_losses = Vec::with_capacity(config.local_epochs as usize);
        self.progress.send_replace(0.0);

        for epoch in 0..config.local_epochs {
            let snapshot = Arc::new(weights.clone());
            let mut handles = Vec::with_capacity(n.div_ceil(batch_size));
            for start in (0..n).step_by(batch_size) {
                let end = (start + batch_size).min(n);
                let permit = self.permits.clone().acquire_owned().await.map_err(|e| FlError::Backend(e.to_string()))?;
                let backend = self.backend.clone();
                let samples = samples.clone();
                let snapshot = snapshot.clone();
                let l2 = self.options.l2_coefficient;
                handles.push(tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    backend.batch_gradients(&snapshot, &samples[start..end], l2)
                }));
            }

            let mut batch_losses = Vec::with_capacity(handles.len());
            let mut summed: Option<Vec<Tensor>> = None;
            let mut total_weight = 0.0f32;
            for handle in handles {
                let BatchGradients { loss, gradients, weight_sum } = handle.await.map_err(|e| FlError::Backend(format!("batch task failed: {e}")))??;
                batch_losses.push(loss);
                total_weight += weight_sum;
                match summed.as_mut() {
                    None => summed = Some(gradients.iter().map(|g| g.scale(weight_sum)).collect()),
                    Some(acc) => for (a, g) in acc.iter_mut().zip(&gradients) { a.axpy(weight_sum, g)?; },
                }
            }
            let mut gradients = summed.ok_or_else(|| FlError::Data("epoch produced no batches".into()))?;
            for g in &mut gradients { g.scale_in_place(1.0 / total_weight); }
            let norm = clip_by_global_norm(&mut gradients, self.options.max_grad_norm);
            optimizer.step(&mut weights, &gradients)?;

            let epoch_loss = batch_losses.iter().sum::<f32>() / batch_losses.len() as f32;
            if !epoch_loss.is_finite() {
                return Err(FlError::Backend(format!("non-finite loss in epoch {epoch}")));
            }
            epoch_losses.push(epoch_loss);
            self.progress.send_replace((epoch + 1) as f32 / config.local_epochs as f32);
            debug!(round, epoch, epoch_loss, grad_norm = norm, batches = batch_losses.len(), "epoch finished");
        }

        let loss = epoch_losses.iter().sum::<f32>() / epoch_losses.len() as f32;
        FL_METRICS.training_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        Ok(ModelUpdate::new(weights, loss, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LinearModel;

    fn line_samples(n: usize) -> Arc<Vec<TrainingSample>> {
        Arc::new((0..n).map(|i| { let x = i as f32 / n as f32; TrainingSample::new(vec![x], 3.0 * x + 1.0) }).collect())
    }

    fn trainer() -> (LocalTrainer, Vec<Tensor>) {
        let backend = Arc::new(LinearModel::new(1));
        let init = backend.initial_weights();
        (LocalTrainer::new(backend, TrainerOptions { optimal_batch_size: 8, ..Default::default() }), init)
    }

    #[tokio::test]
    async fn empty_data_is_rejected() {
        let (t, init) = trainer();
        let err = t.train(init, Arc::new(vec![]), &FederatedConfig::default(), 0).await.unwrap_err();
        assert!(matches!(err, FlError::Data(_)));
    }

    #[tokio::test]
    async fn loss_decreases_over_epochs_and_progress_completes() {
        let (t, init) = trainer();
        let progress = t.subscribe_progress();
        let cfg = FederatedConfig { local_epochs: 20, learning_rate: 0.1, batch_size: 64, ..Default::default() };
        let samples = line_samples(50);
        let first = t.train(init.clone(), samples.clone(), &FederatedConfig { local_epochs: 1, ..cfg.clone() }, 0).await.unwrap();
        let many = t.train(init, samples, &cfg, 0).await.unwrap();
        assert_eq!(many.samples, 50);
        assert!(many.loss < first.loss);
        assert_eq!(*progress.borrow(), 1.0);
    }

    /// Holds each batch long enough for a watcher to see every epoch.
    struct Sluggish(LinearModel);

    impl NumericBackend for Sluggish {
        fn initial_weights(&self) -> Vec<Tensor> { self.0.initial_weights() }
        fn predict(&self, weights: &[Tensor], features: &[f32]) -> FlResult<f32> { self.0.predict(weights, features) }
        fn batch_gradients(&self, weights: &[Tensor], batch: &[TrainingSample], l2: f32) -> FlResult<BatchGradients> {
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.0.batch_gradients(weights, batch, l2)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_rises_once_per_epoch() {
        let t = LocalTrainer::new(Arc::new(Sluggish(LinearModel::new(1))), TrainerOptions { optimal_batch_size: 8, ..Default::default() });
        let init = t.backend.initial_weights();
        let mut rx = t.subscribe_progress();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let v = *rx.borrow_and_update();
                if v > 0.0 { seen.push(v); }
                if v >= 1.0 { break; }
            }
            seen
        });
        let cfg = FederatedConfig { local_epochs: 3, batch_size: 8, ..Default::default() };
        t.train(init, line_samples(8), &cfg, 0).await.unwrap();
        let seen = watcher.await.unwrap();
        assert_eq!(seen, vec![1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }

    #[tokio::test]
    async fn batch_size_is_capped_by_optimal() {
        let (t, _) = trainer();
        assert_eq!(t.batch_size(&FederatedConfig { batch_size: 64, ..Default::default() }), 8);
        assert_eq!(t.batch_size(&FederatedConfig { batch_size: 4, ..Default::default() }), 4);
    }

    #[test]
    fn clipping_bounds_norm() {
        let mut g = vec![Tensor::from_vec(vec![3.0, 4.0])];
        let before = clip_by_global_norm(&mut g, 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((global_norm(&g) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut params = vec![Tensor::from_vec(vec![0.0])];
        let mut opt = MomentumSgd::new(1.0, 0.5, &params);
        let grad = vec![Tensor::from_vec(vec![1.0])];
        opt.step(&mut params, &grad).unwrap();
        opt.step(&mut params, &grad).unwrap();
        // v1 = 1, v2 = 1.5
        assert!((params[0].data()[0] + 2.5).abs() < 1e-6);
    }
}
