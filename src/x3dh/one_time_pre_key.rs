use crate::crypto::{CryptoProvider, X25519PublicKey, X25519Secret, generate_random_seed};
use crate::Error;
use std::collections::{HashMap, VecDeque};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Single-use X25519 pre-key. Agreement consumes it, so the key cannot take
/// part in a second establishment.
pub struct OneTimePreKey {
    id: u32,
    secret: X25519Secret,
}

impl OneTimePreKey {
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

    pub(crate) fn dh(self, public_key: &X25519PublicKey) -> SharedSecret {
        self.secret.dh(public_key)
    }
}

impl Zeroize for OneTimePreKey {
    fn zeroize(&mut self) {
        self.secret.zeroize();
        self.id = 0;
    }
}

impl ZeroizeOnDrop for OneTimePreKey {}

/// One-time pre-keys of one account.
///
/// Keys move through two stages: *published* (claimable by a peer, in issue
/// order) and *claimed* (handed to exactly one initiator, private half still
/// held until the responder side derives the session).
pub(crate) struct OneTimePreKeyStore {
    keys: HashMap<u32, OneTimePreKey>,
    published: VecDeque<u32>,
    next_id: u32,
}

impl OneTimePreKeyStore {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
            published: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Generates `count` keys with sequential ids starting at `start_id`.
    ///
    /// Ids that were ever issued by this store cannot be reused.
    pub(crate) fn generate_keys(
        &mut self,
        provider: &dyn CryptoProvider,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<(u32, X25519PublicKey)>, Error> {
        if start_id == 0 {
            return Err(Error::Validation("pre-key ids start at 1".to_string()));
        }
        let end_id = start_id
            .checked_add(count)
            .ok_or_else(|| Error::Validation("pre-key id range overflows".to_string()))?;
        if start_id < self.next_id && count > 0 {
            return Err(Error::Validation(format!(
                "pre-key id {start_id} was already issued; next free id is {}",
                self.next_id
            )));
        }

        let mut issued = Vec::with_capacity(count as usize);
        let mut fresh = Vec::with_capacity(count as usize);
        for id in start_id..end_id {
            let key = OneTimePreKey::generate(provider, id)?;
            issued.push((id, key.public_key()));
            fresh.push(key);
        }

        for key in fresh {
            self.published.push_back(key.id());
            self.keys.insert(key.id(), key);
        }
        if count > 0 {
            self.next_id = end_id;
        }

        Ok(issued)
    }

    /// Next id that [`OneTimePreKeyStore::generate_keys`] will accept.
    pub(crate) fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Public keys still available for claiming, in issue order.
    pub(crate) fn published(&self) -> Vec<(u32, X25519PublicKey)> {
        self.published
            .iter()
            .filter_map(|id| self.keys.get(id).map(|key| (*id, key.public_key())))
            .collect()
    }

    pub(crate) fn published_count(&self) -> usize {
        self.published.len()
    }

    /// Removes the oldest published key from the available set.
    pub(crate) fn claim(&mut self) -> Option<(u32, X25519PublicKey)> {
        while let Some(id) = self.published.pop_front() {
            if let Some(key) = self.keys.get(&id) {
                return Some((id, key.public_key()));
            }
        }
        None
    }

    /// Removes and returns the private key of a claimed pre-key.
    pub(crate) fn take(&mut self, id: u32) -> Option<OneTimePreKey> {
        if self.published.contains(&id) {
            return None;
        }
        self.keys.remove(&id)
    }

    /// Private keys still held, published or claimed.
    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.keys.len()
    }
}

impl Zeroize for OneTimePreKeyStore {
    fn zeroize(&mut self) {
        for (_, key) in self.keys.iter_mut() {
            key.zeroize();
        }
        self.keys.clear();
        self.published.clear();
    }
}

impl ZeroizeOnDrop for OneTimePreKeyStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsCryptoProvider;

    #[test]
    fn test_claims_follow_issue_order() {
        let mut store = OneTimePreKeyStore::new();
        store.generate_keys(&OsCryptoProvider, 5, 3).unwrap();

        assert_eq!(store.claim().map(|(id, _)| id), Some(5));
        assert_eq!(store.claim().map(|(id, _)| id), Some(6));
        assert_eq!(store.published_count(), 1);
        assert_eq!(store.claim().map(|(id, _)| id), Some(7));
        assert!(store.claim().is_none());
    }

    #[test]
    fn test_private_half_is_handed_out_once() {
        let mut store = OneTimePreKeyStore::new();
        store.generate_keys(&OsCryptoProvider, 1, 2).unwrap();

        // Published keys cannot be taken before they are claimed
        assert!(store.take(1).is_none());

        let (id, _) = store.claim().unwrap();
        assert!(store.take(id).is_some());
        assert!(store.take(id).is_none());
    }

    #[test]
    fn test_issued_ids_are_never_reissued() {
        let mut store = OneTimePreKeyStore::new();
        store.generate_keys(&OsCryptoProvider, 1, 4).unwrap();

        let err = store.generate_keys(&OsCryptoProvider, 3, 2).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(store.generate_keys(&OsCryptoProvider, 5, 2).is_ok());
        assert_eq!(store.next_id(), 7);
    }
}
