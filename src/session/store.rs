use crate::session::Session;
use crate::{Error, SessionKey, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};

pub(crate) type SessionHandle = Arc<Mutex<Session>>;
type SessionSlot = Arc<OnceCell<SessionHandle>>;

/// Directional session records keyed by ordered `(from, to)` pair.
///
/// Each key maps to a slot that is filled at most once. Establishment runs
/// inside the slot's initializer, so concurrent callers for the same pair share
/// one establishment. A failed or cancelled one leaves the slot empty, and
/// empty slots nobody waits on are removed.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, SessionSlot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the established session for `key`, if any.
    pub(crate) async fn load(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Removes the record for `key`. Returns whether an established session was removed.
    pub async fn delete(&self, key: &SessionKey) -> bool {
        self.sessions
            .write()
            .await
            .remove(key)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn contains(&self, key: &SessionKey) -> bool {
        self.sessions
            .read()
            .await
            .get(key)
            .is_some_and(|slot| slot.initialized())
    }

    /// Keys of every established record with `user` on either side.
    pub async fn keys_involving(&self, user: &UserId) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(key, slot)| key.involves(user) && slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of established records.
    pub async fn len(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the session for `key`, running `establish` if there is none yet.
    ///
    /// At most one `establish` runs per key at a time; other callers wait for
    /// it and reuse its result. Nothing is stored if `establish` fails or the
    /// returned future is dropped.
    pub(crate) async fn get_or_establish<F, Fut>(
        &self,
        key: &SessionKey,
        establish: F,
    ) -> Result<SessionHandle, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session, Error>>,
    {
        let pending = PendingSlot {
            sessions: &self.sessions,
            key,
            slot: self.slot(key).await,
        };
        let handle = pending
            .slot
            .get_or_try_init(|| async move {
                let session = establish().await?;
                Ok::<_, Error>(Arc::new(Mutex::new(session)))
            })
            .await?;
        Ok(handle.clone())
    }

    async fn slot(&self, key: &SessionKey) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(key) {
            return slot.clone();
        }

        let mut sessions = self.sessions.write().await;
        // Leftovers from establishments whose cleanup found the map locked
        sessions.retain(|_, slot| slot.initialized() || Arc::strong_count(slot) > 1);
        sessions.entry(key.clone()).or_default().clone()
    }

    /// Slots in the map, established or not.
    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// A slot some caller is establishing. Dropping it while still empty removes
/// the slot unless another caller is waiting on it.
struct PendingSlot<'a> {
    sessions: &'a RwLock<HashMap<SessionKey, SessionSlot>>,
    key: &'a SessionKey,
    slot: SessionSlot,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.slot.initialized() {
            return;
        }
        let Ok(mut sessions) = self.sessions.try_write() else {
            return;
        };
        // One reference is the map's, the other ours
        let idle = sessions
            .get(self.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2);
        if idle {
            sessions.remove(self.key);
        }
    }
}
