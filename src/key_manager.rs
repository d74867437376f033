use crate::account::{
    Account, IdentityPublicKeys, InboundSession, OneTimePreKeyPublic, OutboundSession,
    OutboundSessionX3DHKeys, PreKeyBundle,
};
use crate::crypto::{CryptoProvider, X25519PublicKey};
use crate::x3dh::X3DHPublicKeys;
use crate::{Config, Error, SessionConfig, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Issues and holds every user's identity and pre-keys.
///
/// Owns no session state. The private halves of all keys stay inside the
/// per-user accounts held here.
pub struct KeyManager {
    provider: Arc<dyn CryptoProvider>,
    config: SessionConfig,
    accounts: RwLock<HashMap<UserId, Account>>,
}

impl KeyManager {
    /// Key manager tuned by `config.session`.
    pub fn from_config(provider: Arc<dyn CryptoProvider>, config: &Config) -> Self {
        Self::new(provider, config.session.clone())
    }

    pub fn new(provider: Arc<dyn CryptoProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Generates a fresh identity for `user_id`, replacing any previous one
    /// together with all of its pre-keys.
    pub async fn generate_identity(&self, user_id: &UserId) -> Result<IdentityPublicKeys, Error> {
        let account = Account::new(self.provider.as_ref(), user_id.clone(), self.config.clone())?;
        let identity = account.identity();

        if self
            .accounts
            .write()
            .await
            .insert(user_id.clone(), account)
            .is_some()
        {
            warn!(user_id = %user_id, "replaced existing identity");
        } else {
            info!(user_id = %user_id, "generated identity");
        }

        Ok(identity)
    }

    /// Issues `count` one-time pre-keys with sequential ids from `start_id`
    /// and a new signed pre-key, and publishes them.
    pub async fn generate_pre_key_bundle(
        &self,
        user_id: &UserId,
        start_id: u32,
        count: u32,
    ) -> Result<PreKeyBundle, Error> {
        let mut accounts = self.accounts.write().await;
        let account = Self::account_mut(&mut accounts, user_id)?;

        let bundle = account.issue_pre_keys(self.provider.as_ref(), start_id, count)?;
        debug!(
            user_id = %user_id,
            start_id,
            count,
            signed_pre_key_id = bundle.signed_pre_key.id,
            "issued pre-key bundle"
        );

        Ok(bundle)
    }

    /// Generates an identity and the first bundle of `pre_key_batch_size`
    /// one-time pre-keys starting at id 1.
    pub async fn setup_encryption(&self, user_id: &UserId) -> Result<PreKeyBundle, Error> {
        self.generate_identity(user_id).await?;
        self.generate_pre_key_bundle(user_id, 1, self.config.pre_key_batch_size)
            .await
    }

    pub async fn has_identity(&self, user_id: &UserId) -> bool {
        self.accounts.read().await.contains_key(user_id)
    }

    pub async fn identity(&self, user_id: &UserId) -> Result<IdentityPublicKeys, Error> {
        let accounts = self.accounts.read().await;
        Ok(Self::account(&accounts, user_id)?.identity())
    }

    /// Currently published bundle. Claims nothing.
    pub async fn pre_key_bundle(&self, user_id: &UserId) -> Result<PreKeyBundle, Error> {
        let accounts = self.accounts.read().await;
        Self::account(&accounts, user_id)?.pre_key_bundle()
    }

    /// Claims one one-time pre-key of `user_id` for a single session.
    ///
    /// Fails with [`Error::PreKeyExhausted`] when none are published; callers
    /// may then fall back to [`KeyManager::signed_pre_key_only`]. The published
    /// set is topped back up once it drops below `min_one_time_pre_keys`.
    pub async fn claim_pre_keys(&self, user_id: &UserId) -> Result<X3DHPublicKeys, Error> {
        let mut accounts = self.accounts.write().await;
        let account = Self::account_mut(&mut accounts, user_id)?;

        let keys = account.claim()?;
        debug!(
            user_id = %user_id,
            pre_key_id = ?keys.one_time_pre_key().map(|(id, _)| id),
            remaining = account.available_one_time_pre_keys(),
            "claimed one-time pre-key"
        );

        if account.needs_replenish() {
            match account.replenish(self.provider.as_ref()) {
                Ok(issued) => info!(
                    user_id = %user_id,
                    issued = issued.len(),
                    "replenished one-time pre-keys"
                ),
                // The claim itself succeeded; replenishing is retried on the next claim
                Err(err) => warn!(user_id = %user_id, error = %err, "failed to replenish pre-keys"),
            }
        }

        Ok(keys)
    }

    /// Session keys for `user_id` without a one-time pre-key.
    pub async fn signed_pre_key_only(&self, user_id: &UserId) -> Result<X3DHPublicKeys, Error> {
        let accounts = self.accounts.read().await;
        Self::account(&accounts, user_id)?.signed_pre_key_only()
    }

    pub async fn available_one_time_pre_keys(&self, user_id: &UserId) -> Result<usize, Error> {
        let accounts = self.accounts.read().await;
        Ok(Self::account(&accounts, user_id)?.available_one_time_pre_keys())
    }

    /// Tops the published one-time pre-keys back up to `pre_key_batch_size`.
    pub async fn replenish_pre_keys(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<OneTimePreKeyPublic>, Error> {
        let mut accounts = self.accounts.write().await;
        let issued = Self::account_mut(&mut accounts, user_id)?.replenish(self.provider.as_ref())?;
        info!(user_id = %user_id, issued = issued.len(), "replenished one-time pre-keys");
        Ok(issued)
    }

    /// Initiator's side of an establishment against already claimed keys.
    pub(crate) async fn create_outbound(
        &self,
        initiator: &UserId,
        peer_keys: &X3DHPublicKeys,
    ) -> Result<OutboundSession, Error> {
        let accounts = self.accounts.read().await;
        Self::account(&accounts, initiator)?
            .create_outbound_session(self.provider.as_ref(), peer_keys)
    }

    /// Responder's side. Consumes the claimed one-time pre-key.
    pub(crate) async fn accept_session(
        &self,
        responder: &UserId,
        initiator_identity: &X25519PublicKey,
        x3dh_keys: &OutboundSessionX3DHKeys,
    ) -> Result<InboundSession, Error> {
        let mut accounts = self.accounts.write().await;
        Self::account_mut(&mut accounts, responder)?
            .create_inbound_session(initiator_identity, x3dh_keys)
    }

    /// Drops a claimed one-time pre-key after its establishment failed.
    pub(crate) async fn discard_pre_key(&self, user_id: &UserId, id: u32) {
        let mut accounts = self.accounts.write().await;
        if let Ok(account) = Self::account_mut(&mut accounts, user_id) {
            if account.discard_one_time_pre_key(id) {
                debug!(user_id = %user_id, pre_key_id = id, "discarded unused one-time pre-key");
            }
        }
    }

    /// Like [`KeyManager::discard_pre_key`] for drop paths that cannot wait.
    /// Leaves the key in place if the accounts are locked.
    pub(crate) fn try_discard_pre_key(&self, user_id: &UserId, id: u32) {
        match self.accounts.try_write() {
            Ok(mut accounts) => {
                if let Ok(account) = Self::account_mut(&mut accounts, user_id) {
                    if account.discard_one_time_pre_key(id) {
                        debug!(user_id = %user_id, pre_key_id = id, "discarded unused one-time pre-key");
                    }
                }
            }
            Err(_) => {
                warn!(user_id = %user_id, pre_key_id = id, "accounts busy, unused one-time pre-key kept");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn held_one_time_pre_keys(&self, user_id: &UserId) -> Result<usize, Error> {
        let accounts = self.accounts.read().await;
        Ok(Self::account(&accounts, user_id)?.held_one_time_pre_keys())
    }

    pub(crate) fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn account<'a>(
        accounts: &'a HashMap<UserId, Account>,
        user_id: &UserId,
    ) -> Result<&'a Account, Error> {
        accounts
            .get(user_id)
            .ok_or_else(|| Error::IdentityNotFound(user_id.to_string()))
    }

    fn account_mut<'a>(
        accounts: &'a mut HashMap<UserId, Account>,
        user_id: &UserId,
    ) -> Result<&'a mut Account, Error> {
        accounts
            .get_mut(user_id)
            .ok_or_else(|| Error::IdentityNotFound(user_id.to_string()))
    }
}
