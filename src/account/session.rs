use crate::crypto::X25519PublicKey;
use crate::ratchet::DoubleRatchet;

/// X3DH key material the initiator used, which the responder needs to derive
/// the same shared secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboundSessionX3DHKeys {
    /// ID of the responder's signed pre-key used in the agreement.
    pub spk_id: u32,
    /// ID of the responder's one-time pre-key, if one was available.
    pub otpk_id: Option<u32>,
    /// Ephemeral public key from the agreement.
    pub ephemeral_key_public: X25519PublicKey,
}

/// Initiator's half of a freshly agreed session.
pub(crate) struct OutboundSession {
    pub(crate) session_id: String,
    pub(crate) ratchet: DoubleRatchet,
    pub(crate) x3dh_keys: OutboundSessionX3DHKeys,
}

/// Responder's half of a freshly agreed session.
pub(crate) struct InboundSession {
    pub(crate) session_id: String,
    pub(crate) ratchet: DoubleRatchet,
}
