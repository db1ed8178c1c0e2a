//! Signed message envelope exchanged with the coordinator. JSON on the wire,
//! binary fields base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ChannelErrorKind, FlError, FlResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: Uuid,
    pub round: u32,
    pub timestamp_ms: i64,
    pub sender: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Bytes covered by the signature: everything except the signature itself.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 4 + 8 + self.sender.len() + self.nonce.len() + self.ciphertext.len());
        out.extend_from_slice(self.session_id.as_bytes());
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn to_bytes(&self) -> FlResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FlError::channel(ChannelErrorKind::Encoding, e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> FlResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FlError::channel(ChannelErrorKind::Encoding, format!("malformed envelope: {e}")))
    }
}

/// Associated data binding a ciphertext to its session and round.
pub fn associated_data(session_id: Uuid, round: u32) -> Vec<u8> {
    let mut aad = session_id.as_bytes().to_vec();
    aad.extend_from_slice(&round.to_le_bytes());
    aad
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form_is_stable_and_signature_excludes_itself() {
        let mut env = Envelope { session_id: Uuid::nil(), round: 2, timestamp_ms: 5, sender: "p0".into(), nonce: vec![1; 24], ciphertext: vec![9, 8, 7], signature: vec![] };
        let before = env.signed_bytes();
        env.signature = vec![0xAA; 64];
        assert_eq!(before, env.signed_bytes());
        let parsed = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, env);
        assert!(matches!(Envelope::from_bytes(b"{"), Err(FlError::Channel { kind: ChannelErrorKind::Encoding, .. })));
    }
}
