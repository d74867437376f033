use crate::crypto::X25519PublicKey;
use crate::key_manager::KeyManager;
use crate::session::store::SessionHandle;
use crate::session::{EncryptedPayload, Session, SessionOrigin, SessionStore};
use crate::{Error, SessionKey, UserId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{MutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Establishes, uses and tears down directional pairwise sessions.
///
/// Session records follow the `(from, to)` convention of [`SessionKey`]:
/// `encrypt(a, b, ..)` and `decrypt(a, b, ..)` both use the `(a, b)` record.
/// The first identity key seen for each peer is pinned; a later bundle under
/// a different identity is refused until [`SessionCoordinator::trust_identity`].
pub struct SessionCoordinator {
    keys: Arc<KeyManager>,
    store: Arc<SessionStore>,
    pinned: RwLock<HashMap<UserId, X25519PublicKey>>,
}

impl SessionCoordinator {
    pub fn new(keys: Arc<KeyManager>, store: Arc<SessionStore>) -> Self {
        Self {
            keys,
            store,
            pinned: RwLock::new(HashMap::new()),
        }
    }

    /// Ensures the `(initiator, peer)` session exists and returns its id.
    ///
    /// Concurrent calls for the same pair share one establishment. On failure
    /// or timeout nothing is stored; a timeout is reported as
    /// [`Error::SessionNotFound`].
    pub async fn establish_session(
        &self,
        initiator: &UserId,
        peer: &UserId,
    ) -> Result<String, Error> {
        let handle = self.session_handle(initiator, peer).await?;
        let session = self.lock(&handle, initiator, peer).await?;
        Ok(session.session_id().to_string())
    }

    /// Encrypts `plaintext` from `sender` to `recipient`, establishing the
    /// session first if needed.
    pub async fn encrypt(
        &self,
        sender: &UserId,
        recipient: &UserId,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload, Error> {
        let handle = self.session_handle(sender, recipient).await?;
        let mut session = self.lock(&handle, sender, recipient).await?;
        session.encrypt(self.keys.provider(), plaintext)
    }

    /// Decrypts a payload `sender` sent to `recipient`. Never establishes.
    pub async fn decrypt(
        &self,
        sender: &UserId,
        recipient: &UserId,
        payload: &EncryptedPayload,
    ) -> Result<Vec<u8>, Error> {
        let key = SessionKey::new(sender, recipient);
        let handle = self
            .store
            .load(&key)
            .await
            .ok_or_else(|| Error::session_not_found(sender.as_str(), recipient.as_str()))?;

        let mut session = self.lock(&handle, sender, recipient).await?;
        session.decrypt(self.keys.provider(), payload)
    }

    pub async fn session_exists(&self, sender: &UserId, recipient: &UserId) -> bool {
        self.store.contains(&SessionKey::new(sender, recipient)).await
    }

    /// Removes the `(sender, recipient)` record. Idempotent.
    pub async fn destroy_session(&self, sender: &UserId, recipient: &UserId) -> bool {
        let key = SessionKey::new(sender, recipient);
        let removed = self.store.delete(&key).await;
        if removed {
            debug!(session = %key, "destroyed session");
        }
        removed
    }

    /// Removes both directions between `a` and `b`.
    pub async fn destroy_conversation(&self, a: &UserId, b: &UserId) {
        self.destroy_session(a, b).await;
        self.destroy_session(b, a).await;
    }

    /// Removes every record with `user` on either side. Returns how many were removed.
    pub async fn destroy_sessions_involving(&self, user: &UserId) -> usize {
        let mut removed = 0;
        for key in self.store.keys_involving(user).await {
            if self.store.delete(&key).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(user_id = %user, removed, "destroyed sessions");
        }
        removed
    }

    /// Identity key currently pinned for `user`.
    pub async fn pinned_identity(&self, user: &UserId) -> Option<X25519PublicKey> {
        self.pinned.read().await.get(user).copied()
    }

    /// Pins the current identity of `user` after an intentional reset and
    /// drops every session built on the previous one.
    pub async fn trust_identity(&self, user: &UserId) -> Result<(), Error> {
        let identity = self.keys.identity(user).await?;
        self.pinned
            .write()
            .await
            .insert(user.clone(), identity.identity_key);
        self.destroy_sessions_involving(user).await;
        info!(user_id = %user, "re-pinned identity");
        Ok(())
    }

    async fn session_handle(
        &self,
        initiator: &UserId,
        peer: &UserId,
    ) -> Result<SessionHandle, Error> {
        if initiator == peer {
            return Err(Error::Validation(format!(
                "cannot open a session from {initiator} to itself"
            )));
        }

        let key = SessionKey::new(initiator, peer);
        let establishment = self
            .store
            .get_or_establish(&key, || self.establish(key.clone()));

        match timeout(self.operation_timeout(), establishment).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session = %key, "session establishment timed out");
                Err(Error::session_not_found(initiator.as_str(), peer.as_str()))
            }
        }
    }

    async fn establish(&self, key: SessionKey) -> Result<Session, Error> {
        let SessionKey {
            from: initiator,
            to: peer,
        } = &key;

        let peer_identity = self.keys.identity(peer).await?.identity_key;
        self.check_pinned(peer, &peer_identity).await?;
        let initiator_identity = self.keys.identity(initiator).await?.identity_key;

        let peer_keys = match self.keys.claim_pre_keys(peer).await {
            Ok(peer_keys) => peer_keys,
            Err(Error::PreKeyExhausted(_)) => {
                warn!(
                    user_id = %peer,
                    "no one-time pre-keys left, establishing with the signed pre-key only"
                );
                self.keys.signed_pre_key_only(peer).await?
            }
            Err(err) => return Err(err),
        };
        let claimed = ClaimedPreKey {
            keys: &self.keys,
            user: peer,
            id: peer_keys.one_time_pre_key().map(|(id, _)| id),
        };

        let sides = async {
            if peer_keys.identity_key() != peer_identity {
                return Err(Error::UntrustedIdentity(peer.to_string()));
            }
            let outbound = self.keys.create_outbound(initiator, &peer_keys).await?;
            let inbound = self
                .keys
                .accept_session(peer, &initiator_identity, &outbound.x3dh_keys)
                .await?;
            Ok((outbound, inbound))
        }
        .await;
        let (outbound, inbound) = match sides {
            Ok(sides) => {
                claimed.consumed();
                sides
            }
            Err(err) => {
                claimed.discard().await;
                return Err(err);
            }
        };
        debug_assert_eq!(outbound.session_id, inbound.session_id);

        info!(
            session = %key,
            one_time_pre_key = ?outbound.x3dh_keys.otpk_id,
            "established session"
        );

        let origin = SessionOrigin {
            initiator_identity,
            responder_identity: peer_identity,
            signed_pre_key_id: outbound.x3dh_keys.spk_id,
            one_time_pre_key_id: outbound.x3dh_keys.otpk_id,
        };
        Ok(Session::new(
            key,
            outbound.session_id,
            outbound.ratchet,
            inbound.ratchet,
            origin,
        ))
    }

    /// Pins `identity` on first use, refuses a different one afterwards.
    async fn check_pinned(&self, user: &UserId, identity: &X25519PublicKey) -> Result<(), Error> {
        match self.pinned.write().await.entry(user.clone()) {
            Entry::Occupied(pinned) if pinned.get() != identity => {
                warn!(user_id = %user, "identity key differs from the pinned one");
                Err(Error::UntrustedIdentity(user.to_string()))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(*identity);
                Ok(())
            }
        }
    }

    async fn lock<'a>(
        &self,
        handle: &'a SessionHandle,
        sender: &UserId,
        recipient: &UserId,
    ) -> Result<MutexGuard<'a, Session>, Error> {
        timeout(self.operation_timeout(), handle.lock())
            .await
            .map_err(|_| {
                warn!(from = %sender, to = %recipient, "timed out waiting for session lock");
                Error::session_not_found(sender.as_str(), recipient.as_str())
            })
    }

    fn operation_timeout(&self) -> Duration {
        self.keys.config().operation_timeout
    }
}

/// A one-time pre-key claimed for an establishment that has not finished.
///
/// Unless [`ClaimedPreKey::consumed`] is called, the private half is dropped
/// so a failed or cancelled establishment does not keep it forever.
struct ClaimedPreKey<'a> {
    keys: &'a KeyManager,
    user: &'a UserId,
    id: Option<u32>,
}

impl ClaimedPreKey<'_> {
    fn consumed(mut self) {
        self.id = None;
    }

    async fn discard(mut self) {
        if let Some(id) = self.id.take() {
            self.keys.discard_pre_key(self.user, id).await;
        }
    }
}

impl Drop for ClaimedPreKey<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.keys.try_discard_pre_key(self.user, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionConfig;
    use crate::crypto::{CryptoProvider, NONCE_SIZE, OsCryptoProvider};
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn coordinator(users: &[&str], batch: u32) -> (Arc<KeyManager>, SessionCoordinator) {
        let keys = Arc::new(KeyManager::new(
            Arc::new(OsCryptoProvider),
            SessionConfig {
                pre_key_batch_size: batch,
                min_one_time_pre_keys: 0,
                ..SessionConfig::default()
            },
        ));
        for user in users {
            keys.setup_encryption(&UserId::from(*user)).await.unwrap();
        }
        let sessions = SessionCoordinator::new(keys.clone(), Arc::new(SessionStore::new()));
        (keys, sessions)
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_both_directions() {
        let (_, sessions) = coordinator(&["alice", "bob"], 5).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let payload = sessions.encrypt(&alice, &bob, b"hi bob").await.unwrap();
        assert_eq!(sessions.decrypt(&alice, &bob, &payload).await.unwrap(), b"hi bob");

        // Replies use their own record
        assert!(!sessions.session_exists(&bob, &alice).await);
        let reply = sessions.encrypt(&bob, &alice, b"hi alice").await.unwrap();
        assert_eq!(sessions.decrypt(&bob, &alice, &reply).await.unwrap(), b"hi alice");
        assert_ne!(payload.session_id, reply.session_id);
    }

    #[tokio::test]
    async fn test_decrypt_never_establishes() {
        let (_, sessions) = coordinator(&["alice", "bob"], 5).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let payload = sessions.encrypt(&alice, &bob, b"hi").await.unwrap();
        let err = sessions.decrypt(&bob, &alice, &payload).await.unwrap_err();
        assert_eq!(err, Error::session_not_found("bob", "alice"));
        assert!(!sessions.session_exists(&bob, &alice).await);
    }

    #[tokio::test]
    async fn test_mismatched_session_id_is_not_found() {
        let (_, sessions) = coordinator(&["alice", "bob"], 5).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let mut payload = sessions.encrypt(&alice, &bob, b"hi").await.unwrap();
        payload.session_id = "stale".to_string();
        let err = sessions.decrypt(&alice, &bob, &payload).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_establishment_is_single_flight() {
        let (keys, sessions) = coordinator(&["alice", "bob"], 5).await;
        let sessions = Arc::new(sessions);
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sessions = sessions.clone();
                let (alice, bob) = (alice.clone(), bob.clone());
                tokio::spawn(async move { sessions.establish_session(&alice, &bob).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        // Exactly one one-time pre-key was consumed
        assert_eq!(keys.available_one_time_pre_keys(&bob).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_pre_keys_fall_back_to_signed_pre_key() {
        let (keys, sessions) = coordinator(&["alice", "bob", "carol"], 1).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let carol = UserId::from("carol");

        sessions.establish_session(&alice, &bob).await.unwrap();
        assert_eq!(keys.available_one_time_pre_keys(&bob).await.unwrap(), 0);

        let payload = sessions.encrypt(&carol, &bob, b"still works").await.unwrap();
        assert_eq!(sessions.decrypt(&carol, &bob, &payload).await.unwrap(), b"still works");
    }

    #[tokio::test]
    async fn test_missing_identity_stores_nothing() {
        let (_, sessions) = coordinator(&["alice"], 1).await;
        let alice = UserId::from("alice");
        let ghost = UserId::from("ghost");

        let err = sessions.establish_session(&alice, &ghost).await.unwrap_err();
        assert_eq!(err, Error::IdentityNotFound("ghost".to_string()));
        assert!(!sessions.session_exists(&alice, &ghost).await);
    }

    #[tokio::test]
    async fn test_changed_identity_is_untrusted_until_repinned() {
        let (keys, sessions) = coordinator(&["alice", "bob"], 5).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        sessions.establish_session(&alice, &bob).await.unwrap();
        sessions.destroy_session(&alice, &bob).await;

        keys.setup_encryption(&bob).await.unwrap();
        let err = sessions.establish_session(&alice, &bob).await.unwrap_err();
        assert_eq!(err, Error::UntrustedIdentity("bob".to_string()));

        sessions.trust_identity(&bob).await.unwrap();
        assert!(sessions.establish_session(&alice, &bob).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (_, sessions) = coordinator(&["alice", "bob"], 5).await;
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        sessions.establish_session(&alice, &bob).await.unwrap();
        sessions.establish_session(&bob, &alice).await.unwrap();

        assert!(sessions.destroy_session(&alice, &bob).await);
        assert!(!sessions.destroy_session(&alice, &bob).await);
        assert!(sessions.session_exists(&bob, &alice).await);

        assert_eq!(sessions.destroy_sessions_involving(&alice).await, 1);
        assert!(!sessions.session_exists(&bob, &alice).await);
    }

    #[tokio::test]
    async fn test_session_with_self_is_rejected() {
        let (_, sessions) = coordinator(&["alice"], 1).await;
        let alice = UserId::from("alice");
        assert!(matches!(
            sessions.establish_session(&alice, &alice).await,
            Err(Error::Validation(_))
        ));
    }

    /// Refuses to produce randomness while `failing` is set.
    struct SwitchableEntropy {
        failing: AtomicBool,
    }

    impl CryptoProvider for SwitchableEntropy {
        fn fill_random(&self, dest: &mut [u8]) -> Result<(), Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::KeyGeneration("entropy source unavailable".to_string()));
            }
            OsCryptoProvider.fill_random(dest)
        }

        fn seal(
            &self,
            key: &[u8; 32],
            nonce: &[u8; NONCE_SIZE],
            plaintext: &[u8],
            aad: &[u8],
        ) -> Result<Vec<u8>, Error> {
            OsCryptoProvider.seal(key, nonce, plaintext, aad)
        }

        fn open(
            &self,
            key: &[u8; 32],
            nonce: &[u8; NONCE_SIZE],
            ciphertext: &[u8],
            aad: &[u8],
        ) -> Result<Vec<u8>, Error> {
            OsCryptoProvider.open(key, nonce, ciphertext, aad)
        }
    }

    #[tokio::test]
    async fn test_failed_establishment_drops_claimed_pre_key() {
        let provider = Arc::new(SwitchableEntropy {
            failing: AtomicBool::new(false),
        });
        let keys = Arc::new(KeyManager::new(
            provider.clone(),
            SessionConfig {
                pre_key_batch_size: 5,
                min_one_time_pre_keys: 0,
                ..SessionConfig::default()
            },
        ));
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        keys.setup_encryption(&alice).await.unwrap();
        keys.setup_encryption(&bob).await.unwrap();
        let sessions = SessionCoordinator::new(keys.clone(), Arc::new(SessionStore::new()));

        provider.failing.store(true, Ordering::SeqCst);
        let err = sessions.establish_session(&alice, &bob).await.unwrap_err();
        assert!(matches!(err, Error::KeyGeneration(_)));

        // Claimed and then dropped: neither published nor held
        assert_eq!(keys.available_one_time_pre_keys(&bob).await.unwrap(), 4);
        assert_eq!(keys.held_one_time_pre_keys(&bob).await.unwrap(), 4);
        assert!(!sessions.session_exists(&alice, &bob).await);

        provider.failing.store(false, Ordering::SeqCst);
        sessions.establish_session(&alice, &bob).await.unwrap();
        assert_eq!(keys.held_one_time_pre_keys(&bob).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_establishment_drops_claimed_pre_key() {
        let (keys, sessions) = coordinator(&["alice", "bob"], 5).await;
        let bob = UserId::from("bob");
        let claimed = keys.claim_pre_keys(&bob).await.unwrap();
        let (id, _) = claimed.one_time_pre_key().unwrap();

        drop(ClaimedPreKey {
            keys: &keys,
            user: &bob,
            id: Some(id),
        });

        assert_eq!(keys.held_one_time_pre_keys(&bob).await.unwrap(), 4);
        assert!(sessions.store.is_empty().await);
    }
}
