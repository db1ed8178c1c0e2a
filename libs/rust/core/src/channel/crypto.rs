//! Payload codec, XChaCha20-Poly1305 sealing and Ed25519 envelope signing.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::envelope::{associated_data, Envelope};
use crate::error::{ChannelErrorKind, FlError, FlResult};
use crate::update::ModelUpdate;

pub const NONCE_LEN: usize = 24;

/// Key material for one end of the channel.
#[derive(Clone)]
pub struct ChannelKeys {
    cipher_key: [u8; 32],
    signing: SigningKey,
    remote: VerifyingKey,
}

impl std::fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelKeys(local={}, remote={})", fingerprint(&self.signing.verifying_key()), fingerprint(&self.remote))
    }
}

impl ChannelKeys {
    pub fn new(cipher_key: [u8; 32], signing: SigningKey, remote: VerifyingKey) -> Self { Self { cipher_key, signing, remote } }

    /// Fresh symmetric key plus one signing identity per side.
    /// Returns `(client, coordinator)`.
    pub fn generate_pair() -> (ChannelKeys, ChannelKeys) {
        let mut cipher_key = [0u8; 32];
        OsRng.fill_bytes(&mut cipher_key);
        let client = SigningKey::generate(&mut OsRng);
        let coordinator = SigningKey::generate(&mut OsRng);
        (
            ChannelKeys::new(cipher_key, client.clone(), coordinator.verifying_key()),
            ChannelKeys::new(cipher_key, coordinator, client.verifying_key()),
        )
    }

    pub fn verifying_key(&self) -> VerifyingKey { self.signing.verifying_key() }
    pub fn remote_key(&self) -> VerifyingKey { self.remote }
    pub fn cipher_key(&self) -> &[u8; 32] { &self.cipher_key }

    pub fn seal(&self, session_id: Uuid, round: u32, plaintext: &[u8]) -> FlResult<(Vec<u8>, Vec<u8>)> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.cipher_key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(session_id, round);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|e| FlError::channel(ChannelErrorKind::Encryption, e.to_string()))?;
        Ok((nonce.to_vec(), ciphertext))
    }

    pub fn open(&self, envelope: &Envelope) -> FlResult<Vec<u8>> {
        if envelope.nonce.len() != NONCE_LEN {
            return Err(FlError::channel(ChannelErrorKind::Decryption, format!("nonce length {}", envelope.nonce.len())));
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.cipher_key));
        let aad = associated_data(envelope.session_id, envelope.round);
        cipher
            .decrypt(XNonce::from_slice(&envelope.nonce), Payload { msg: &envelope.ciphertext, aad: &aad })
            .map_err(|e| FlError::channel(ChannelErrorKind::Decryption, e.to_string()))
    }

    pub fn sign(&self, envelope: &mut Envelope) {
        envelope.signature = self.signing.sign(&envelope.signed_bytes()).to_bytes().to_vec();
    }

    /// Verifies against the configured remote identity.
    pub fn verify(&self, envelope: &Envelope) -> FlResult<()> { verify_with(&self.remote, envelope) }
}

pub fn verify_with(key: &VerifyingKey, envelope: &Envelope) -> FlResult<()> {
    let sig = Signature::from_slice(&envelope.signature)
        .map_err(|e| FlError::channel(ChannelErrorKind::Signature, format!("malformed signature: {e}")))?;
    key.verify_strict(&envelope.signed_bytes(), &sig)
        .map_err(|e| FlError::channel(ChannelErrorKind::Signature, e.to_string()))
}

pub fn encode_update(update: &ModelUpdate) -> FlResult<Vec<u8>> {
    bincode::serialize(update).map_err(|e| FlError::channel(ChannelErrorKind::Encoding, e.to_string()))
}

pub fn decode_update(bytes: &[u8]) -> FlResult<ModelUpdate> {
    bincode::deserialize(bytes).map_err(|e| FlError::channel(ChannelErrorKind::Encoding, e.to_string()))
}

/// Short hex id of a verifying key, for logs.
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(&Sha256::digest(key.as_bytes())[..8])
}
