use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::crypto::{decode_update, encode_update, verify_with, ChannelKeys};
use super::envelope::Envelope;
use super::Transport;
use crate::error::{ChannelErrorKind, FlError, FlResult};
use crate::tensor::Tensor;
use crate::update::ModelUpdate;

pub const COORDINATOR_SENDER: &str = "coordinator";

/// Sample-weighted mean (FedAvg) of the weights; loss is weighted the same
/// way and sample counts add up. Contributions whose layout differs from the
/// first one are skipped.
pub fn fed_avg(contributions: &[ModelUpdate]) -> FlResult<ModelUpdate> {
    let first = contributions.first().ok_or_else(|| FlError::Validation("nothing to aggregate".into()))?;
    let layout: Vec<Vec<usize>> = first.weights.iter().map(|t| t.shape().to_vec()).collect();
    let usable: Vec<&ModelUpdate> = contributions
        .iter()
        .filter(|u| {
            let ok = u.samples > 0 && u.weights.len() == layout.len() && u.weights.iter().zip(&layout).all(|(t, s)| t.shape() == s.as_slice());
            if !ok { warn!(samples = u.samples, "skipping contribution with mismatched layout"); }
            ok
        })
        .collect();
    let total_samples: usize = usable.iter().map(|u| u.samples).sum();
    if total_samples == 0 { return Err(FlError::Validation("contributions carry no samples".into())); }

    let mut weights: Vec<Tensor> = layout.iter().map(|s| Tensor::zeros(s.clone())).collect();
    let mut loss = 0.0f32;
    for u in &usable {
        let share = u.samples as f32 / total_samples as f32;
        for (acc, t) in weights.iter_mut().zip(&u.weights) { acc.axpy(share, t)?; }
        loss += u.loss * share;
    }
    Ok(ModelUpdate::new(weights, loss, total_samples))
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<String, VerifyingKey>,
    peer_updates: HashMap<(Uuid, u32), Vec<ModelUpdate>>,
    rounds_served: u64,
}

/// In-process coordinator that speaks the envelope protocol. Verifies and
/// decrypts the client contribution, averages it with whatever peer
/// contributions were registered for that `(session, round)`, and answers
/// with a signed, sealed aggregate.
pub struct LoopbackCoordinator {
    keys: ChannelKeys,
    inner: RwLock<Inner>,
}

impl LoopbackCoordinator {
    /// `keys` is the coordinator side of [`ChannelKeys::generate_pair`];
    /// its remote key is registered for `client`.
    pub fn new(keys: ChannelKeys, client: &str) -> Self {
        let mut inner = Inner::default();
        inner.clients.insert(client.to_string(), keys.remote_key());
        Self { keys, inner: RwLock::new(inner) }
    }

    pub fn register_client(&self, id: &str, key: VerifyingKey) { self.inner.write().clients.insert(id.to_string(), key); }

    pub fn submit_peer_update(&self, session_id: Uuid, round: u32, update: ModelUpdate) {
        self.inner.write().peer_updates.entry((session_id, round)).or_default().push(update);
    }

    pub fn rounds_served(&self) -> u64 { self.inner.read().rounds_served }

    fn handle(&self, request: &[u8]) -> FlResult<Vec<u8>> {
        let envelope = Envelope::from_bytes(request)?;
        let key = self.inner.read().clients.get(&envelope.sender).copied()
            .ok_or_else(|| FlError::channel(ChannelErrorKind::Signature, format!("unknown sender {}", envelope.sender)))?;
        verify_with(&key, &envelope)?;
        let update = decode_update(&self.keys.open(&envelope)?)?;

        // the sender's layout is the reference for the average
        let mut contributions = vec![update];
        contributions.extend(self.inner.write().peer_updates.remove(&(envelope.session_id, envelope.round)).unwrap_or_default());
        let aggregated = fed_avg(&contributions)?;
        debug!(session_id = %envelope.session_id, round = envelope.round, contributions = contributions.len(), samples = aggregated.samples, "aggregated round");

        let (nonce, ciphertext) = self.keys.seal(envelope.session_id, envelope.round, &encode_update(&aggregated)?)?;
        let mut response = Envelope {
            session_id: envelope.session_id,
            round: envelope.round,
            timestamp_ms: Utc::now().timestamp_millis(),
            sender: COORDINATOR_SENDER.to_string(),
            nonce,
            ciphertext,
            signature: Vec::new(),
        };
        self.keys.sign(&mut response);
        self.inner.write().rounds_served += 1;
        response.to_bytes()
    }
}

#[async_trait]
impl Transport for LoopbackCoordinator {
    async fn send(&self, envelope: Vec<u8>) -> FlResult<Vec<u8>> { self.handle(&envelope) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(w: Vec<f32>, samples: usize) -> ModelUpdate { ModelUpdate::new(vec![Tensor::from_vec(w)], 1.0, samples) }

    #[test]
    fn fedavg_weights_by_samples() {
        let agg = fed_avg(&[update(vec![0.1, 0.2, 0.3], 10), update(vec![0.2, 0.4, 0.6], 30)]).unwrap();
        // (0.1*10 + 0.2*30)/40 = 0.175
        assert!((agg.weights[0].data()[0] - 0.175).abs() < 1e-6);
        assert_eq!(agg.samples, 40);
    }

    #[test]
    fn fedavg_skips_mismatched_layout() {
        let agg = fed_avg(&[update(vec![1.0, 1.0], 5), update(vec![9.0], 5)]).unwrap();
        assert_eq!(agg.weights[0].data(), &[1.0, 1.0]);
        assert_eq!(agg.samples, 5);
        assert!(fed_avg(&[]).is_err());
    }
}
