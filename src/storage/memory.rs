use super::{MessageRecord, MessageStatus, MessageStore};
use crate::{Error, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// In-memory [`MessageStore`].
///
/// Records are kept in insertion order under their sequence number; lookups
/// by `(message id, recipient)` and by `(sender, client message id)` go
/// through secondary indexes.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<u64, MessageRecord>,
    by_recipient: HashMap<(MessageId, UserId), u64>,
    by_client_id: HashMap<(UserId, String), Vec<u64>>,
    next_seq: u64,
}

impl Inner {
    fn record_mut(&mut self, id: MessageId, recipient: &UserId) -> Option<&mut MessageRecord> {
        let seq = self.by_recipient.get(&(id, recipient.clone()))?;
        self.records.get_mut(seq)
    }

    fn remove(&mut self, seq: u64) {
        let Some(record) = self.records.remove(&seq) else {
            return;
        };
        self.by_recipient.remove(&(record.id, record.recipient_id.clone()));

        let client_key = (
            record.sender_id.clone(),
            record.metadata.client_message_id.clone(),
        );
        if let Some(seqs) = self.by_client_id.get_mut(&client_key) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.by_client_id.remove(&client_key);
            }
        }
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, records: Vec<MessageRecord>) -> Result<Vec<MessageRecord>, Error> {
        let mut inner = self.inner.write().await;

        // Validate the whole batch before touching anything
        let mut batch_keys = HashSet::new();
        for record in &records {
            let client_key = (
                record.sender_id.clone(),
                record.metadata.client_message_id.clone(),
            );
            if inner.by_client_id.contains_key(&client_key) {
                return Err(Error::Validation(format!(
                    "duplicate client message id {}",
                    record.metadata.client_message_id
                )));
            }

            let recipient_key = (record.id, record.recipient_id.clone());
            if inner.by_recipient.contains_key(&recipient_key) || !batch_keys.insert(recipient_key) {
                return Err(Error::Validation(format!(
                    "message {} already stored for {}",
                    record.id, record.recipient_id
                )));
            }
        }

        let mut stored = Vec::with_capacity(records.len());
        for mut record in records {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            record.seq = seq;

            inner
                .by_recipient
                .insert((record.id, record.recipient_id.clone()), seq);
            inner
                .by_client_id
                .entry((
                    record.sender_id.clone(),
                    record.metadata.client_message_id.clone(),
                ))
                .or_default()
                .push(seq);
            inner.records.insert(seq, record.clone());
            stored.push(record);
        }

        Ok(stored)
    }

    async fn find_by_client_id(
        &self,
        sender: &UserId,
        client_message_id: &str,
    ) -> Result<Vec<MessageRecord>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_client_id
            .get(&(sender.clone(), client_message_id.to_string()))
            .map(|seqs| {
                seqs.iter()
                    .filter_map(|seq| inner.records.get(seq).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, id: MessageId, recipient: &UserId) -> Result<Option<MessageRecord>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_recipient
            .get(&(id, recipient.clone()))
            .and_then(|seq| inner.records.get(seq).cloned()))
    }

    async fn mark_delivered(&self, id: MessageId, recipient: &UserId) -> Result<bool, Error> {
        let mut inner = self.inner.write().await;
        match inner.record_mut(id, recipient) {
            Some(record) if record.status == MessageStatus::Sent => {
                record.status = MessageStatus::Delivered;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_undelivered(&self, id: MessageId, recipient: &UserId) -> Result<bool, Error> {
        let mut inner = self.inner.write().await;
        match inner.record_mut(id, recipient) {
            Some(record) if record.status == MessageStatus::Delivered => {
                record.status = MessageStatus::Sent;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_read(
        &self,
        id: MessageId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<MessageRecord>, Error> {
        let mut inner = self.inner.write().await;
        Ok(inner.record_mut(id, reader).map(|record| {
            if record.status != MessageStatus::Read {
                record.status = MessageStatus::Read;
                record.read_at = Some(at);
                record.read_by = Some(reader.clone());
            }
            record.clone()
        }))
    }

    async fn undelivered_for(
        &self,
        recipient: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|record| {
                &record.recipient_id == recipient
                    && record.status == MessageStatus::Sent
                    && !record.is_expired(now)
            })
            .cloned()
            .collect())
    }

    async fn toggle_reaction(
        &self,
        id: MessageId,
        recipient: &UserId,
        user: &UserId,
        emoji: &str,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.write().await;
        let record = inner
            .record_mut(id, recipient)
            .ok_or_else(|| Error::Storage(format!("message {id} not found")))?;

        let users = record.reactions.entry(emoji.to_string()).or_default();
        let set = if users.remove(user) {
            false
        } else {
            users.insert(user.clone());
            true
        };
        if users.is_empty() {
            record.reactions.remove(emoji);
        }

        Ok(set)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let mut inner = self.inner.write().await;
        let expired: Vec<u64> = inner
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &expired {
            inner.remove(*seq);
        }
        Ok(expired.len())
    }
}
