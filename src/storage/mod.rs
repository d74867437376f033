//! Persistence capability for message records.
//!
//! The realtime layer only talks to [`MessageStore`]. [`MemoryMessageStore`]
//! backs tests and single-process deployments; durable engines implement the
//! same trait.

mod memory;
pub use memory::MemoryMessageStore;

use crate::session::EncryptionScheme;
use crate::{Error, GroupId, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of content a message carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Gif,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Sender-chosen id used to deduplicate retries.
    pub client_message_id: String,
    pub device_id: Option<String>,
    /// Session the ciphertext was produced under.
    pub session_id: String,
}

/// One persisted message, addressed to exactly one recipient.
///
/// A group message is stored as one record per recipient, all sharing the
/// same [`MessageId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    /// Store-assigned insertion order.
    pub seq: u64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub group_id: Option<GroupId>,
    /// Plaintext, kept only when the persist-plaintext policy is on.
    pub content: Option<String>,
    /// Base64 ratchet message.
    pub encrypted_content: String,
    pub encryption_scheme: EncryptionScheme,
    pub message_type: MessageType,
    pub metadata: MessageMetadata,
    pub expires_at: Option<DateTime<Utc>>,
    pub reply_to: Option<MessageId>,
    pub status: MessageStatus,
    pub read_at: Option<DateTime<Utc>>,
    pub read_by: Option<UserId>,
    /// Emoji to the users who reacted with it.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores every record or none of them, assigning sequence numbers in order.
    ///
    /// Fails with [`Error::Validation`] if the sender already used the batch's
    /// client message id, or if a `(message id, recipient)` pair already exists.
    async fn insert(&self, records: Vec<MessageRecord>) -> Result<Vec<MessageRecord>, Error>;

    /// Records previously stored for `(sender, client_message_id)`.
    async fn find_by_client_id(
        &self,
        sender: &UserId,
        client_message_id: &str,
    ) -> Result<Vec<MessageRecord>, Error>;

    async fn get(&self, id: MessageId, recipient: &UserId) -> Result<Option<MessageRecord>, Error>;

    /// Marks a sent record delivered. Returns whether it changed.
    async fn mark_delivered(&self, id: MessageId, recipient: &UserId) -> Result<bool, Error>;

    /// Puts a delivered record back to sent after a push that never reached
    /// the recipient. Returns whether it changed.
    async fn mark_undelivered(&self, id: MessageId, recipient: &UserId) -> Result<bool, Error>;

    /// Marks the reader's record read and returns it.
    async fn mark_read(
        &self,
        id: MessageId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, Error>;

    /// Records still waiting for `recipient`, unexpired, in send order.
    async fn undelivered_for(
        &self,
        recipient: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, Error>;

    /// Adds or removes `user`'s `emoji` reaction. Returns whether it is now set.
    async fn toggle_reaction(
        &self,
        id: MessageId,
        recipient: &UserId,
        user: &UserId,
        emoji: &str,
    ) -> Result<bool, Error>;

    /// Drops expired records. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, Error>;
}
