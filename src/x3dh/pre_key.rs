use crate::crypto::{CryptoProvider, X25519PublicKey, X25519Secret, generate_random_seed};
use crate::Error;
use crate::x3dh::IdentityKey;
use ed25519_dalek::Signature;
use std::collections::BTreeMap;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Medium-term X25519 key published in the bundle, signed by the identity.
///
/// Its private half also seeds the responder's first ratchet key.
pub struct SignedPreKey {
    id: u32,
    secret: X25519Secret,
}

impl SignedPreKey {
    pub fn generate(provider: &dyn CryptoProvider, id: u32) -> Result<Self, Error> {
        let secret = X25519Secret::from(generate_random_seed(provider)?);
        Ok(Self { id, secret })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.secret.public_key()
    }

    /// Ed25519 signature by `identity` over the raw public key bytes.
    pub fn signature(&self, identity: &IdentityKey) -> Signature {
        identity.sign(self.public_key().as_bytes())
    }

    pub(crate) fn key_pair(&self) -> X25519Secret {
        self.secret.clone()
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.secret.dh(public_key)
    }
}

impl Zeroize for SignedPreKey {
    fn zeroize(&mut self) {
        self.secret.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for SignedPreKey {}

/// Signed pre-keys of one account, newest last.
pub(crate) struct SignedPreKeyStore {
    keys: BTreeMap<u32, SignedPreKey>,
    next_id: u32,
    max_keys: usize,
}

impl SignedPreKeyStore {
    pub(crate) fn new(max_keys: usize) -> Self {
        Self {
            keys: BTreeMap::new(),
            next_id: 1,
            max_keys: max_keys.max(1),
        }
    }

    /// Issues a new current key, evicting the oldest beyond `max_keys`.
    pub(crate) fn renew_key(&mut self, provider: &dyn CryptoProvider) -> Result<&SignedPreKey, Error> {
        let id = self.next_id;
        let key = SignedPreKey::generate(provider, id)?;
        self.next_id = self.next_id.wrapping_add(1);
        self.keys.insert(id, key);

        while self.keys.len() > self.max_keys {
            if let Some((_, mut evicted)) = self.keys.pop_first() {
                evicted.zeroize();
            }
        }

        self.current()
            .ok_or_else(|| Error::KeyGeneration("signed pre-key missing after renewal".to_string()))
    }

    pub(crate) fn get(&self, id: u32) -> Option<&SignedPreKey> {
        self.keys.get(&id)
    }

    /// Returns the most recently issued signed pre-key.
    pub(crate) fn current(&self) -> Option<&SignedPreKey> {
        self.keys.last_key_value().map(|(_, key)| key)
    }
}
