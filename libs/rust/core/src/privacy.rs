//! Differential-privacy transform applied to a local update before it leaves
//! the device. Uniform additive noise whose scale decays with the round index.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditLog, SecurityEvent, SecurityEventKind};
use crate::update::ModelUpdate;

/// `budget / (2.0 + round * 0.1)`: strictly decreasing in `round`, never zero
/// while the budget is positive.
pub fn noise_multiplier(privacy_budget: f32, round: u32) -> f32 {
    privacy_budget / (2.0 + round as f32 * 0.1)
}

pub struct PrivacyEngine {
    rng: Mutex<StdRng>,
    audit: Arc<dyn AuditLog>,
}

impl PrivacyEngine {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self { Self { rng: Mutex::new(StdRng::from_entropy()), audit } }

    /// Deterministic noise stream, for reproducible runs.
    pub fn with_seed(audit: Arc<dyn AuditLog>, seed: u64) -> Self { Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), audit } }

    pub fn apply_privacy(&self, session_id: Uuid, mut update: ModelUpdate, privacy_budget: f32, round: u32) -> ModelUpdate {
        let multiplier = noise_multiplier(privacy_budget, round);
        if multiplier > 0.0 {
            let mut rng = self.rng.lock();
            for tensor in &mut update.weights {
                for v in tensor.data_mut() { *v += rng.gen_range(-multiplier..=multiplier); }
            }
        }
        debug!(%session_id, round, noise = multiplier, "privacy applied");
        self.audit.record(SecurityEvent::new(
            SecurityEventKind::PrivacyApplied,
            session_id,
            format!("round={round} noise_multiplier={multiplier:.6}"),
        ));
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::tensor::Tensor;

    #[test]
    fn multiplier_strictly_decreases() {
        let mut prev = f32::INFINITY;
        for round in 0..200 {
            let m = noise_multiplier(1.0, round);
            assert!(m < prev && m > 0.0, "round {round}");
            prev = m;
        }
        assert_eq!(noise_multiplier(0.0, 3), 0.0);
        assert!((noise_multiplier(1.0, 0) - 0.5).abs() < 1e-7);
    }

    #[test]
    fn noise_is_bounded_and_only_touches_weights() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let engine = PrivacyEngine::with_seed(audit.clone(), 7);
        let update = ModelUpdate::new(vec![Tensor::zeros(vec![64])], 0.42, 12);
        let out = engine.apply_privacy(Uuid::nil(), update.clone(), 1.0, 0);
        assert_eq!(out.loss, update.loss);
        assert_eq!(out.samples, update.samples);
        assert!(out.weights[0].data().iter().all(|v| v.abs() <= 0.5));
        assert!(out.weights[0].data().iter().any(|v| *v != 0.0));
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].detail.contains("round=0"));
    }

    #[test]
    fn seeded_engines_agree() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let a = PrivacyEngine::with_seed(audit.clone(), 11);
        let b = PrivacyEngine::with_seed(audit, 11);
        let u = ModelUpdate::new(vec![Tensor::zeros(vec![8])], 0.0, 1);
        assert_eq!(a.apply_privacy(Uuid::nil(), u.clone(), 0.3, 2).weights, b.apply_privacy(Uuid::nil(), u, 0.3, 2).weights);
    }
}
