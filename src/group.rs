use crate::session::{EncryptedPayload, SessionCoordinator};
use crate::{Error, GroupId, UserId};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Group conversations over pairwise sessions.
///
/// There is no shared group key: every ordered pair of distinct members has
/// its own directional session, and a group message is encrypted once per
/// recipient. Setup is O(n²) in the member count.
pub struct GroupSessionCoordinator {
    sessions: Arc<SessionCoordinator>,
    groups: RwLock<HashMap<GroupId, BTreeSet<UserId>>>,
    // Held shared by fan-outs and exclusively by membership changes
    membership: RwLock<()>,
}

impl GroupSessionCoordinator {
    pub fn new(sessions: Arc<SessionCoordinator>) -> Self {
        Self {
            sessions,
            groups: RwLock::new(HashMap::new()),
            membership: RwLock::new(()),
        }
    }

    /// Records `member_ids` as the membership of `group_id` and establishes a
    /// session for every ordered pair of distinct members.
    ///
    /// Existing sessions are reused. Every record between a removed member and
    /// the previous membership is destroyed before the new membership takes
    /// effect.
    pub async fn setup_group_session(
        &self,
        group_id: &GroupId,
        member_ids: &[UserId],
    ) -> Result<(), Error> {
        let _membership = self.membership.write().await;
        self.apply_membership(group_id, member_ids.iter().cloned().collect())
            .await
    }

    /// Encrypts `plaintext` once for every recipient other than the sender.
    ///
    /// Either every recipient gets a ciphertext or the call fails. Membership
    /// cannot change while the fan-out runs, so a member removed concurrently
    /// is either fully included or rejected.
    pub async fn encrypt_group_message(
        &self,
        group_id: &GroupId,
        sender: &UserId,
        plaintext: &[u8],
        recipient_ids: &[UserId],
    ) -> Result<BTreeMap<UserId, EncryptedPayload>, Error> {
        let _membership = self.membership.read().await;
        let recipients: BTreeSet<&UserId> = {
            let groups = self.groups.read().await;
            let members = groups
                .get(group_id)
                .ok_or_else(|| Error::Authorization(format!("unknown group {group_id}")))?;

            if !members.contains(sender) {
                return Err(Error::Authorization(format!(
                    "{sender} is not a member of {group_id}"
                )));
            }
            if let Some(outsider) = recipient_ids.iter().find(|user| !members.contains(*user)) {
                return Err(Error::Authorization(format!(
                    "{outsider} is not a member of {group_id}"
                )));
            }

            recipient_ids.iter().filter(|user| *user != sender).collect()
        };

        let payloads = try_join_all(recipients.into_iter().map(|recipient| async move {
            let payload = self.sessions.encrypt(sender, recipient, plaintext).await?;
            Ok::<_, Error>((recipient.clone(), payload))
        }))
        .await?;

        debug!(group_id = %group_id, sender = %sender, recipients = payloads.len(), "encrypted group message");
        Ok(payloads.into_iter().collect())
    }

    /// Adds `user` and re-runs setup for the new membership.
    pub async fn add_member(&self, group_id: &GroupId, user: &UserId) -> Result<(), Error> {
        let _membership = self.membership.write().await;
        let mut members = self.current_members(group_id).await?;
        members.insert(user.clone());
        self.apply_membership(group_id, members).await
    }

    /// Removes `user`, destroying its sessions with the other members.
    pub async fn remove_member(&self, group_id: &GroupId, user: &UserId) -> Result<(), Error> {
        let _membership = self.membership.write().await;
        let mut members = self.current_members(group_id).await?;
        members.remove(user);
        self.apply_membership(group_id, members).await
    }

    pub async fn members(&self, group_id: &GroupId) -> Option<Vec<UserId>> {
        self.groups
            .read()
            .await
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
    }

    pub async fn is_member(&self, group_id: &GroupId, user: &UserId) -> bool {
        self.groups
            .read()
            .await
            .get(group_id)
            .is_some_and(|members| members.contains(user))
    }

    /// Forgets the group and destroys the sessions between its members.
    pub async fn teardown_group(&self, group_id: &GroupId) -> bool {
        let _membership = self.membership.write().await;
        let Some(members) = self.groups.write().await.remove(group_id) else {
            return false;
        };

        for (a, b) in distinct_pairs(&members) {
            if a < b {
                self.sessions.destroy_conversation(a, b).await;
            }
        }
        info!(group_id = %group_id, members = members.len(), "tore down group");
        true
    }

    async fn current_members(&self, group_id: &GroupId) -> Result<BTreeSet<UserId>, Error> {
        self.groups
            .read()
            .await
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::Authorization(format!("unknown group {group_id}")))
    }

    async fn apply_membership(
        &self,
        group_id: &GroupId,
        members: BTreeSet<UserId>,
    ) -> Result<(), Error> {
        let previous = self
            .groups
            .read()
            .await
            .get(group_id)
            .cloned()
            .unwrap_or_default();

        for removed in previous.difference(&members) {
            for member in &previous {
                if member != removed {
                    self.sessions.destroy_conversation(removed, member).await;
                }
            }
            info!(group_id = %group_id, user_id = %removed, "member removed, sessions destroyed");
        }

        // Record first so removed members are already excluded if an establishment fails
        self.groups
            .write()
            .await
            .insert(group_id.clone(), members.clone());

        try_join_all(
            distinct_pairs(&members)
                .map(|(initiator, peer)| self.sessions.establish_session(initiator, peer)),
        )
        .await?;

        info!(group_id = %group_id, members = members.len(), "group sessions ready");
        Ok(())
    }
}

/// Every ordered pair of distinct members.
fn distinct_pairs(members: &BTreeSet<UserId>) -> impl Iterator<Item = (&UserId, &UserId)> {
    members
        .iter()
        .flat_map(move |a| members.iter().filter(move |b| *b != a).map(move |b| (a, b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsCryptoProvider;
    use crate::{KeyManager, SessionConfig, SessionStore};

    async fn groups(users: &[&str]) -> (Arc<SessionCoordinator>, GroupSessionCoordinator) {
        let keys = Arc::new(KeyManager::new(
            Arc::new(OsCryptoProvider),
            SessionConfig {
                pre_key_batch_size: 8,
                ..SessionConfig::default()
            },
        ));
        for user in users {
            keys.setup_encryption(&UserId::from(*user)).await.unwrap();
        }
        let sessions = Arc::new(SessionCoordinator::new(keys, Arc::new(SessionStore::new())));
        (sessions.clone(), GroupSessionCoordinator::new(sessions))
    }

    fn ids(users: &[&str]) -> Vec<UserId> {
        users.iter().map(|user| UserId::from(*user)).collect()
    }

    #[test]
    fn test_distinct_pairs() {
        let members: BTreeSet<_> = ids(&["a", "b", "c"]).into_iter().collect();
        assert_eq!(distinct_pairs(&members).count(), 6);
        assert!(distinct_pairs(&members).all(|(a, b)| a != b));
    }

    #[tokio::test]
    async fn test_setup_establishes_every_ordered_pair() {
        let (sessions, groups) = groups(&["a", "b", "c"]).await;
        let group = GroupId::from("g1");
        let members = ids(&["a", "b", "c"]);

        groups.setup_group_session(&group, &members).await.unwrap();

        for a in &members {
            for b in &members {
                assert_eq!(sessions.session_exists(a, b).await, a != b);
            }
        }
    }

    #[tokio::test]
    async fn test_group_message_reaches_every_other_member() {
        let (sessions, groups) = groups(&["a", "b", "c"]).await;
        let group = GroupId::from("g1");
        let members = ids(&["a", "b", "c"]);
        groups.setup_group_session(&group, &members).await.unwrap();

        let sender = UserId::from("a");
        let payloads = groups
            .encrypt_group_message(&group, &sender, b"hello group", &members)
            .await
            .unwrap();

        assert_eq!(payloads.keys().cloned().collect::<Vec<_>>(), ids(&["b", "c"]));
        for (recipient, payload) in &payloads {
            let plaintext = sessions.decrypt(&sender, recipient, payload).await.unwrap();
            assert_eq!(plaintext, b"hello group");
        }
    }

    #[tokio::test]
    async fn test_removed_member_is_isolated() {
        let (sessions, groups) = groups(&["a", "b", "c"]).await;
        let group = GroupId::from("g1");
        groups
            .setup_group_session(&group, &ids(&["a", "b", "c"]))
            .await
            .unwrap();

        groups.remove_member(&group, &UserId::from("c")).await.unwrap();

        let c = UserId::from("c");
        for other in ids(&["a", "b"]) {
            assert!(!sessions.session_exists(&c, &other).await);
            assert!(!sessions.session_exists(&other, &c).await);
        }
        assert!(!groups.is_member(&group, &c).await);

        let err = groups
            .encrypt_group_message(&group, &UserId::from("a"), b"secret", &ids(&["b", "c"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));

        let err = groups
            .encrypt_group_message(&group, &c, b"let me in", &ids(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn test_unknown_group_is_unauthorized() {
        let (_, groups) = groups(&["a"]).await;
        let err = groups
            .encrypt_group_message(&GroupId::from("nope"), &UserId::from("a"), b"x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn test_add_member_and_teardown() {
        let (sessions, groups) = groups(&["a", "b", "c"]).await;
        let group = GroupId::from("g1");
        groups.setup_group_session(&group, &ids(&["a", "b"])).await.unwrap();

        groups.add_member(&group, &UserId::from("c")).await.unwrap();
        assert_eq!(groups.members(&group).await, Some(ids(&["a", "b", "c"])));
        assert!(sessions
            .session_exists(&UserId::from("c"), &UserId::from("a"))
            .await);

        assert!(groups.teardown_group(&group).await);
        assert!(groups.members(&group).await.is_none());
        assert!(!sessions
            .session_exists(&UserId::from("a"), &UserId::from("b"))
            .await);
        assert!(!groups.teardown_group(&group).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_racing_removal_never_reaches_removed_member() {
        let (sessions, groups) = groups(&["a", "b", "c"]).await;
        let groups = Arc::new(groups);
        let group = GroupId::from("g1");
        let members = ids(&["a", "b", "c"]);
        groups.setup_group_session(&group, &members).await.unwrap();

        let sender = UserId::from("a");
        let c = UserId::from("c");
        let fan_outs: Vec<_> = (0..16)
            .map(|i| {
                let groups = groups.clone();
                let group = group.clone();
                let sender = sender.clone();
                let members = members.clone();
                tokio::spawn(async move {
                    let message = format!("message {i}");
                    groups
                        .encrypt_group_message(&group, &sender, message.as_bytes(), &members)
                        .await
                })
            })
            .collect();
        let removal = {
            let groups = groups.clone();
            let group = group.clone();
            let c = c.clone();
            tokio::spawn(async move { groups.remove_member(&group, &c).await })
        };

        for fan_out in fan_outs {
            match fan_out.await.unwrap() {
                Ok(payloads) => assert!(payloads.contains_key(&c)),
                Err(err) => assert!(matches!(err, Error::Authorization(_))),
            }
        }
        removal.await.unwrap().unwrap();

        for other in ids(&["a", "b"]) {
            assert!(!sessions.session_exists(&other, &c).await);
            assert!(!sessions.session_exists(&c, &other).await);
        }
        let payloads = groups
            .encrypt_group_message(&group, &sender, b"after", &ids(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(payloads.keys().cloned().collect::<Vec<_>>(), ids(&["b"]));
    }
}
