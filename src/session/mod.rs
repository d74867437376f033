mod coordinator;
pub use coordinator::SessionCoordinator;
mod store;
pub use store::SessionStore;

use crate::crypto::{CryptoProvider, X25519PublicKey};
use crate::ratchet::{DoubleRatchet, RatchetMessage};
use crate::{Error, SessionKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Scheme tag stored next to every ciphertext.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionScheme {
    /// X3DH-established Double Ratchet with header encryption.
    #[default]
    DoubleRatchetV1,
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionScheme::DoubleRatchetV1 => f.write_str("double-ratchet-v1"),
        }
    }
}

/// One encrypted message as stored and sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub scheme: EncryptionScheme,
    pub session_id: String,
    /// Framed ratchet message: `[header len u32 BE][encrypted header][ciphertext]`.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl EncryptedPayload {
    pub fn body_base64(&self) -> String {
        STANDARD.encode(&self.body)
    }

    /// Rebuilds a payload from its persisted parts.
    pub fn from_parts(
        scheme: EncryptionScheme,
        session_id: impl Into<String>,
        body_base64: &str,
    ) -> Result<Self, Error> {
        Ok(Self {
            scheme,
            session_id: session_id.into(),
            body: STANDARD.decode(body_base64)?,
        })
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// The directional channel `from -> to`.
///
/// Holds the initiator's sending ratchet and the peer's receiving ratchet for
/// that direction only. Replies travel in the separate `to -> from` record.
pub struct Session {
    key: SessionKey,
    session_id: String,
    outbound: DoubleRatchet,
    inbound: DoubleRatchet,
    initiator_identity: X25519PublicKey,
    responder_identity: X25519PublicKey,
    signed_pre_key_id: u32,
    one_time_pre_key_id: Option<u32>,
    established_at: DateTime<Utc>,
}

/// Identity and pre-key material a session was established with.
pub(crate) struct SessionOrigin {
    pub(crate) initiator_identity: X25519PublicKey,
    pub(crate) responder_identity: X25519PublicKey,
    pub(crate) signed_pre_key_id: u32,
    pub(crate) one_time_pre_key_id: Option<u32>,
}

impl Session {
    pub(crate) fn new(
        key: SessionKey,
        session_id: String,
        outbound: DoubleRatchet,
        inbound: DoubleRatchet,
        origin: SessionOrigin,
    ) -> Self {
        Self {
            key,
            session_id,
            outbound,
            inbound,
            initiator_identity: origin.initiator_identity,
            responder_identity: origin.responder_identity,
            signed_pre_key_id: origin.signed_pre_key_id,
            one_time_pre_key_id: origin.one_time_pre_key_id,
            established_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn initiator_identity(&self) -> X25519PublicKey {
        self.initiator_identity
    }

    pub fn responder_identity(&self) -> X25519PublicKey {
        self.responder_identity
    }

    pub fn signed_pre_key_id(&self) -> u32 {
        self.signed_pre_key_id
    }

    /// `None` when the peer had no one-time pre-keys left.
    pub fn one_time_pre_key_id(&self) -> Option<u32> {
        self.one_time_pre_key_id
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Encrypts with the sending ratchet.
    pub fn encrypt(
        &mut self,
        provider: &dyn CryptoProvider,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, Error> {
        let message = self
            .outbound
            .encrypt(provider, plaintext)
            .map_err(|err| Error::Encryption(err.to_string()))?;

        Ok(EncryptedPayload {
            scheme: EncryptionScheme::DoubleRatchetV1,
            session_id: self.session_id.clone(),
            body: message.to_bytes(),
        })
    }

    /// Decrypts with the receiving ratchet.
    ///
    /// A payload bound to another session id is reported as a missing session.
    pub fn decrypt(
        &mut self,
        provider: &dyn CryptoProvider,
        payload: &EncryptedPayload,
    ) -> Result<Vec<u8>, Error> {
        if payload.session_id != self.session_id {
            return Err(Error::session_not_found(
                self.key.from.as_str(),
                self.key.to.as_str(),
            ));
        }

        let message = RatchetMessage::from_bytes(&payload.body)?;
        self.inbound.decrypt(provider, &message).map_err(|err| match err {
            Error::Decryption(_) => err,
            other => Error::Decryption(other.to_string()),
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

impl Zeroize for Session {
    fn zeroize(&mut self) {
        self.session_id.zeroize();
        self.outbound.zeroize();
        self.inbound.zeroize();
    }
}

impl ZeroizeOnDrop for Session {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_shape() {
        let payload = EncryptedPayload {
            scheme: EncryptionScheme::DoubleRatchetV1,
            session_id: "sid".to_string(),
            body: vec![1, 2, 3],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"scheme": "double-ratchet-v1", "sessionId": "sid", "body": "AQID"})
        );

        let parsed: EncryptedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_payload_from_parts() {
        let payload = EncryptedPayload::from_parts(EncryptionScheme::default(), "sid", "AQID").unwrap();
        assert_eq!(payload.body, vec![1, 2, 3]);
        assert_eq!(payload.body_base64(), "AQID");

        let err = EncryptedPayload::from_parts(EncryptionScheme::default(), "sid", "not base64!").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
