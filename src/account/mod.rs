mod bundle;
pub use bundle::*;
mod session;
pub use session::OutboundSessionX3DHKeys;
pub(crate) use session::{InboundSession, OutboundSession};

use crate::crypto::{CryptoProvider, X25519PublicKey};
use crate::ratchet::DoubleRatchet;
use crate::x3dh::{IdentityKey, OneTimePreKeyStore, SignedPreKeyStore, X3DH, X3DHPublicKeys};
use crate::{Error, SessionConfig, UserId};
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Registration ids are 14-bit and never zero.
const REGISTRATION_ID_MASK: u16 = 0x3fff;

/// Public identity of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKeys {
    pub identity_key: X25519PublicKey,
    pub signing_key: VerifyingKey,
    pub registration_id: u32,
}

/// One user's key material: identity, signed pre-keys and one-time pre-keys.
///
/// Private halves never leave the account. Peers see [`PreKeyBundle`]s and
/// [`X3DHPublicKeys`] only.
pub(crate) struct Account {
    user_id: UserId,
    ik: IdentityKey,
    registration_id: u32,
    spk_store: SignedPreKeyStore,
    otpk_store: OneTimePreKeyStore,
    config: SessionConfig,
}

impl Account {
    /// Creates an account with a fresh identity and no published pre-keys.
    pub(crate) fn new(
        provider: &dyn CryptoProvider,
        user_id: UserId,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let ik = IdentityKey::generate(provider)?;

        let mut id_bytes = [0u8; 2];
        provider
            .fill_random(&mut id_bytes)
            .map_err(|err| Error::KeyGeneration(format!("registration id: {err}")))?;
        let registration_id = u32::from((u16::from_be_bytes(id_bytes) & REGISTRATION_ID_MASK).max(1));

        Ok(Self {
            user_id,
            ik,
            registration_id,
            spk_store: SignedPreKeyStore::new(config.max_signed_pre_keys),
            otpk_store: OneTimePreKeyStore::new(),
            config,
        })
    }

    pub(crate) fn identity(&self) -> IdentityPublicKeys {
        IdentityPublicKeys {
            identity_key: self.ik.dh_key_public(),
            signing_key: self.ik.signing_key_public(),
            registration_id: self.registration_id,
        }
    }

    /// Issues `count` one-time pre-keys from `start_id` plus a new signed pre-key.
    pub(crate) fn issue_pre_keys(
        &mut self,
        provider: &dyn CryptoProvider,
        start_id: u32,
        count: u32,
    ) -> Result<PreKeyBundle, Error> {
        self.otpk_store.generate_keys(provider, start_id, count)?;
        self.spk_store.renew_key(provider)?;
        self.pre_key_bundle()
    }

    /// Issues fresh one-time pre-keys until `pre_key_batch_size` are published.
    ///
    /// Returns the newly issued keys.
    pub(crate) fn replenish(
        &mut self,
        provider: &dyn CryptoProvider,
    ) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        let target = self.config.pre_key_batch_size as usize;
        let missing = target.saturating_sub(self.otpk_store.published_count());
        let count = u32::try_from(missing)
            .map_err(|_| Error::Validation("pre-key batch too large".to_string()))?;

        let issued = self
            .otpk_store
            .generate_keys(provider, self.otpk_store.next_id(), count)?;

        Ok(issued
            .into_iter()
            .map(|(id, public_key)| OneTimePreKeyPublic { id, public_key })
            .collect())
    }

    /// Currently published bundle.
    pub(crate) fn pre_key_bundle(&self) -> Result<PreKeyBundle, Error> {
        let spk = self.spk_store.current().ok_or_else(|| {
            Error::Validation(format!("no pre-key bundle issued for {}", self.user_id))
        })?;

        Ok(PreKeyBundle {
            user_id: self.user_id.clone(),
            registration_id: self.registration_id,
            identity_key: self.ik.dh_key_public(),
            signing_key: self.ik.signing_key_public(),
            signed_pre_key: SignedPreKeyPublic {
                id: spk.id(),
                public_key: spk.public_key(),
                signature: spk.signature(&self.ik),
            },
            one_time_pre_keys: self
                .otpk_store
                .published()
                .into_iter()
                .map(|(id, public_key)| OneTimePreKeyPublic { id, public_key })
                .collect(),
        })
    }

    pub(crate) fn available_one_time_pre_keys(&self) -> usize {
        self.otpk_store.published_count()
    }

    pub(crate) fn needs_replenish(&self) -> bool {
        self.otpk_store.published_count() < self.config.min_one_time_pre_keys
    }

    /// Claims the oldest published one-time pre-key for one session.
    pub(crate) fn claim(&mut self) -> Result<X3DHPublicKeys, Error> {
        // Check the signed pre-key first so a failed claim consumes nothing
        let mut keys = self.signed_pre_key_only()?;
        let otpk = self
            .otpk_store
            .claim()
            .ok_or_else(|| Error::PreKeyExhausted(self.user_id.to_string()))?;
        keys.one_time_pre_key = Some(otpk);
        Ok(keys)
    }

    /// Session keys without a one-time pre-key.
    pub(crate) fn signed_pre_key_only(&self) -> Result<X3DHPublicKeys, Error> {
        let bundle_keys = self.pre_key_bundle()?;
        let mut keys = bundle_keys.x3dh_keys();
        keys.one_time_pre_key = None;
        Ok(keys)
    }

    /// Initiator's side: runs X3DH against `peer_keys` and builds the sending ratchet.
    pub(crate) fn create_outbound_session(
        &self,
        provider: &dyn CryptoProvider,
        peer_keys: &X3DHPublicKeys,
    ) -> Result<OutboundSession, Error> {
        let initiation =
            X3DH::new(&self.config.protocol_info).initiate(provider, &self.ik, peer_keys)?;

        let ephemeral_key_public = initiation.ephemeral_key();
        let session_id = derive_session_id(
            &self.ik.dh_key_public(),
            &peer_keys.identity_key(),
            &ephemeral_key_public,
        );
        let (spk_id, spk_public) = peer_keys.signed_pre_key();

        let ratchet = DoubleRatchet::new_initiator(
            provider,
            initiation.into_shared_secret(),
            &spk_public,
            self.config.max_skipped_messages,
            associated_data(&self.ik.dh_key_public(), &peer_keys.identity_key()),
        )?;

        Ok(OutboundSession {
            session_id,
            ratchet,
            x3dh_keys: OutboundSessionX3DHKeys {
                spk_id,
                otpk_id: peer_keys.one_time_pre_key().map(|(id, _)| id),
                ephemeral_key_public,
            },
        })
    }

    /// Drops the private half of a claimed one-time pre-key that no inbound
    /// session will consume. Returns whether one was held.
    pub(crate) fn discard_one_time_pre_key(&mut self, id: u32) -> bool {
        self.otpk_store.take(id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn held_one_time_pre_keys(&self) -> usize {
        self.otpk_store.held_count()
    }

    /// Responder's side: derives the same secret and builds the receiving ratchet.
    ///
    /// The claimed one-time pre-key is removed here and cannot be used again.
    pub(crate) fn create_inbound_session(
        &mut self,
        initiator_identity: &X25519PublicKey,
        x3dh_keys: &OutboundSessionX3DHKeys,
    ) -> Result<InboundSession, Error> {
        let spk = self.spk_store.get(x3dh_keys.spk_id).ok_or_else(|| {
            Error::Validation(format!("unknown signed pre-key {}", x3dh_keys.spk_id))
        })?;

        let otpk = match x3dh_keys.otpk_id {
            Some(id) => Some(self.otpk_store.take(id).ok_or_else(|| {
                Error::Validation(format!("one-time pre-key {id} is not claimable"))
            })?),
            None => None,
        };

        let shared_secret = X3DH::new(&self.config.protocol_info).respond(
            &self.ik,
            spk,
            otpk,
            initiator_identity,
            &x3dh_keys.ephemeral_key_public,
        )?;

        let ratchet = DoubleRatchet::new_responder(
            shared_secret,
            spk.key_pair(),
            self.config.max_skipped_messages,
            associated_data(initiator_identity, &self.ik.dh_key_public()),
        )?;

        Ok(InboundSession {
            session_id: derive_session_id(
                initiator_identity,
                &self.ik.dh_key_public(),
                &x3dh_keys.ephemeral_key_public,
            ),
            ratchet,
        })
    }
}

/// `AD = IK_initiator || IK_responder`
fn associated_data(initiator: &X25519PublicKey, responder: &X25519PublicKey) -> Box<[u8; 64]> {
    let mut ad = Box::new([0u8; 64]);
    ad[..32].copy_from_slice(initiator.as_bytes());
    ad[32..].copy_from_slice(responder.as_bytes());
    ad
}

/// Both parties derive the same id from the initiator's identity, the
/// responder's identity and the ephemeral key.
fn derive_session_id(
    initiator: &X25519PublicKey,
    responder: &X25519PublicKey,
    ephemeral_key_public: &X25519PublicKey,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(initiator.as_bytes());
    hasher.update(responder.as_bytes());
    hasher.update(ephemeral_key_public.as_bytes());

    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

impl Zeroize for Account {
    fn zeroize(&mut self) {
        self.ik.zeroize();
        self.otpk_store.zeroize();
        self.registration_id = 0;
    }
}

impl ZeroizeOnDrop for Account {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsCryptoProvider;

    fn account(name: &str, batch: u32) -> Account {
        let config = SessionConfig {
            pre_key_batch_size: batch,
            ..SessionConfig::default()
        };
        let mut account = Account::new(&OsCryptoProvider, UserId::from(name), config).unwrap();
        account.issue_pre_keys(&OsCryptoProvider, 1, batch).unwrap();
        account
    }

    #[test]
    fn test_bundle_verifies() {
        let bob = account("bob", 3);

        let bundle = bob.pre_key_bundle().unwrap();
        assert!(bundle.verify().is_ok());
        assert_eq!(bundle.one_time_pre_keys.len(), 3);
        assert!((1..=0x3fff).contains(&bundle.registration_id));
    }

    #[test]
    fn test_bundle_requires_issue() {
        let account = Account::new(
            &OsCryptoProvider,
            UserId::from("carol"),
            SessionConfig::default(),
        )
        .unwrap();

        assert!(matches!(account.pre_key_bundle(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_outbound_and_inbound_sessions_agree() {
        let provider = OsCryptoProvider;
        let alice = account("alice", 2);
        let mut bob = account("bob", 2);

        let keys = bob.claim().unwrap();
        let outbound = alice.create_outbound_session(&provider, &keys).unwrap();
        let inbound = bob
            .create_inbound_session(&alice.identity().identity_key, &outbound.x3dh_keys)
            .unwrap();

        assert_eq!(outbound.session_id, inbound.session_id);

        let mut sending = outbound.ratchet;
        let mut receiving = inbound.ratchet;
        let message = sending.encrypt(&provider, b"hello bob").unwrap();
        assert_eq!(receiving.decrypt(&provider, &message).unwrap(), b"hello bob");
    }

    #[test]
    fn test_claimed_key_is_consumed_once() {
        let provider = OsCryptoProvider;
        let alice = account("alice", 1);
        let mut bob = account("bob", 1);

        let keys = bob.claim().unwrap();
        assert_eq!(bob.available_one_time_pre_keys(), 0);
        assert!(matches!(bob.claim(), Err(Error::PreKeyExhausted(_))));

        let outbound = alice.create_outbound_session(&provider, &keys).unwrap();
        let alice_ik = alice.identity().identity_key;
        assert!(bob.create_inbound_session(&alice_ik, &outbound.x3dh_keys).is_ok());
        assert!(matches!(
            bob.create_inbound_session(&alice_ik, &outbound.x3dh_keys),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_replenish_tops_up_to_batch_size() {
        let mut bob = account("bob", 4);
        for _ in 0..3 {
            bob.claim().unwrap();
        }

        let issued = bob.replenish(&OsCryptoProvider).unwrap();
        assert_eq!(issued.len(), 3);
        assert_eq!(issued.first().map(|key| key.id), Some(5));
        assert_eq!(bob.available_one_time_pre_keys(), 4);
    }
}
