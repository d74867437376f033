use crate::crypto::X25519PublicKey;
use crate::x3dh::X3DHPublicKeys;
use crate::{Error, UserId};
use ed25519_dalek::{Signature, VerifyingKey};

/// Public half of a signed pre-key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public_key: X25519PublicKey,
    /// Signature over `public_key` by the owner's identity key.
    pub signature: Signature,
}

/// Public half of a one-time pre-key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: X25519PublicKey,
}

/// Everything a peer needs to start a session with a user while that user
/// is offline.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub user_id: UserId,
    pub registration_id: u32,
    /// Identity key for DH operations.
    pub identity_key: X25519PublicKey,
    /// Identity verification key, signs the signed pre-key.
    pub signing_key: VerifyingKey,
    pub signed_pre_key: SignedPreKeyPublic,
    /// Published one-time pre-keys, in the order they will be claimed.
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Checks the signed pre-key signature against the bundle's identity.
    pub fn verify(&self) -> Result<(), Error> {
        self.signing_key
            .verify_strict(
                self.signed_pre_key.public_key.as_bytes(),
                &self.signed_pre_key.signature,
            )
            .map_err(|_| Error::UntrustedIdentity(self.user_id.to_string()))
    }

    /// Session keys for this bundle using its first one-time pre-key, if any.
    ///
    /// This does not consume the one-time pre-key; claims go through the
    /// key manager.
    pub fn x3dh_keys(&self) -> X3DHPublicKeys {
        X3DHPublicKeys::new(
            self.identity_key,
            self.signing_key,
            self.signed_pre_key.signature,
            (self.signed_pre_key.id, self.signed_pre_key.public_key),
            self.one_time_pre_keys
                .first()
                .map(|key| (key.id, key.public_key)),
        )
    }
}
