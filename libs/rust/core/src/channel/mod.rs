//! Secure channel client: compress → encrypt → sign → transmit, then
//! verify → decrypt → decode the aggregated answer.
//!
//! Any failure here is fatal to the round; retry policy, if any, belongs to
//! the `Transport` implementation.

pub mod coordinator;
pub mod crypto;
pub mod envelope;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

pub use coordinator::{fed_avg, LoopbackCoordinator, COORDINATOR_SENDER};
pub use crypto::ChannelKeys;
pub use envelope::Envelope;

use crate::error::{ChannelErrorKind, FlError, FlResult};
use crate::session::ParticipantId;
use crate::update::ModelUpdate;

/// Opaque request/response byte exchange with the coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Vec<u8>) -> FlResult<Vec<u8>>;
}

pub struct SecureChannelClient {
    participant: ParticipantId,
    keys: ChannelKeys,
    transport: Arc<dyn Transport>,
}

impl SecureChannelClient {
    pub fn new(participant: ParticipantId, keys: ChannelKeys, transport: Arc<dyn Transport>) -> Self {
        Self { participant, keys, transport }
    }

    pub fn participant(&self) -> &ParticipantId { &self.participant }

    /// Plain serialization. Quantization or pruning would slot in here.
    fn compress(&self, update: &ModelUpdate) -> FlResult<Vec<u8>> { crypto::encode_update(update) }

    fn seal(&self, update: &ModelUpdate, session_id: Uuid, round: u32) -> FlResult<Envelope> {
        let payload = self.compress(update)?;
        let (nonce, ciphertext) = self.keys.seal(session_id, round, &payload)?;
        let mut envelope = Envelope {
            session_id,
            round,
            timestamp_ms: Utc::now().timestamp_millis(),
            sender: self.participant.0.clone(),
            nonce,
            ciphertext,
            signature: Vec::new(),
        };
        self.keys.sign(&mut envelope);
        Ok(envelope)
    }

    fn receive(&self, bytes: &[u8], session_id: Uuid, round: u32) -> FlResult<ModelUpdate> {
        let envelope = Envelope::from_bytes(bytes)?;
        self.keys.verify(&envelope)?;
        if envelope.session_id != session_id || envelope.round != round {
            return Err(FlError::channel(
                ChannelErrorKind::Mismatch,
                format!("response for {}/{} while expecting {}/{}", envelope.session_id, envelope.round, session_id, round),
            ));
        }
        let update = crypto::decode_update(&self.keys.open(&envelope)?)?;
        if !update.is_finite() {
            return Err(FlError::channel(ChannelErrorKind::Encoding, "aggregate contains non-finite values"));
        }
        Ok(update)
    }

    #[instrument(skip(self, update), fields(participant = %self.participant.0))]
    pub async fn exchange(&self, update: &ModelUpdate, session_id: Uuid, round: u32) -> FlResult<ModelUpdate> {
        let request = self.seal(update, session_id, round)?.to_bytes()?;
        let sent = request.len();
        let response = self.transport.send(request).await.map_err(|e| match e {
            FlError::Channel { .. } => e,
            other => FlError::channel(ChannelErrorKind::Transport, other.to_string()),
        })?;
        let aggregated = self.receive(&response, session_id, round)?;
        debug!(%session_id, round, bytes_sent = sent, bytes_received = response.len(), samples = aggregated.samples, "exchange complete");
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(&self, envelope: Vec<u8>) -> FlResult<Vec<u8>> { Ok(envelope) }
    }

    struct Down;

    #[async_trait]
    impl Transport for Down {
        async fn send(&self, _: Vec<u8>) -> FlResult<Vec<u8>> { Err(FlError::Backend("connection refused".into())) }
    }

    fn update() -> ModelUpdate { ModelUpdate::new(vec![Tensor::from_vec(vec![1.0, 2.0])], 0.5, 4) }

    #[tokio::test]
    async fn loopback_exchange_returns_aggregate() {
        let (client_keys, coord_keys) = ChannelKeys::generate_pair();
        let coord = Arc::new(LoopbackCoordinator::new(coord_keys, "p0"));
        let session = Uuid::new_v4();
        coord.submit_peer_update(session, 0, ModelUpdate::new(vec![Tensor::from_vec(vec![3.0, 4.0])], 1.5, 4));
        let client = SecureChannelClient::new("p0".into(), client_keys, coord.clone());
        let agg = client.exchange(&update(), session, 0).await.unwrap();
        assert_eq!(agg.weights[0].data(), &[2.0, 3.0]);
        assert_eq!(agg.samples, 8);
        assert_eq!(coord.rounds_served(), 1);
    }

    #[tokio::test]
    async fn own_signature_is_not_accepted_as_coordinator() {
        // echoing the request back means the response is signed by the client key
        let (client_keys, _) = ChannelKeys::generate_pair();
        let client = SecureChannelClient::new("p0".into(), client_keys, Arc::new(Echo));
        let err = client.exchange(&update(), Uuid::nil(), 0).await.unwrap_err();
        assert!(matches!(err, FlError::Channel { kind: ChannelErrorKind::Signature, .. }));
    }

    #[tokio::test]
    async fn transport_errors_are_channel_errors() {
        let (client_keys, _) = ChannelKeys::generate_pair();
        let client = SecureChannelClient::new("p0".into(), client_keys, Arc::new(Down));
        let err = client.exchange(&update(), Uuid::nil(), 0).await.unwrap_err();
        assert!(matches!(err, FlError::Channel { kind: ChannelErrorKind::Transport, .. }));
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected_by_coordinator() {
        let (client_keys, coord_keys) = ChannelKeys::generate_pair();
        let coord = Arc::new(LoopbackCoordinator::new(coord_keys, "someone-else"));
        let client = SecureChannelClient::new("p0".into(), client_keys, coord);
        assert!(client.exchange(&update(), Uuid::nil(), 0).await.is_err());
    }
}
