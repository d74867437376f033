use crate::config::Config;
use crate::group::GroupSessionCoordinator;
use crate::realtime::auth::Authenticator;
use crate::realtime::events::{
    DeliveredMessage, ErrorNotice, InboundEvent, MarkRead, MessageAck, MessageFailed, MessageRead,
    NewDirectMessage, NewGroupMessage, OutboundEvent, PresenceStatus, SendDirect, SendGroup,
    StatusChange, TypingNotice, TypingTarget, UNDECRYPTABLE_PLACEHOLDER,
};
use crate::realtime::registry::{ChannelHandle, ConnectionRegistry};
use crate::session::{EncryptedPayload, SessionCoordinator};
use crate::storage::{
    MessageMetadata, MessageRecord, MessageStatus, MessageStore, MessageType,
};
use crate::{ConnectionId, Error, GroupId, MessageId, UserId};
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Last known presence of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Presence {
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Routes client events between connections, sessions and the message store.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RealtimeDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Arc<SessionCoordinator>,
    groups: Arc<GroupSessionCoordinator>,
    store: Arc<dyn MessageStore>,
    authenticator: Arc<dyn Authenticator>,
    registry: ConnectionRegistry,
    config: Config,
    presence: RwLock<HashMap<UserId, Presence>>,
    /// Opened messages whose push failed; the ratchet has already moved past
    /// them, so a later fetch hands these out instead of decrypting again.
    parked: Mutex<HashMap<(MessageId, UserId), DeliveredMessage>>,
}

/// What a send event asks for, regardless of direct or group addressing.
struct Outgoing {
    content: String,
    message_type: MessageType,
    client_message_id: String,
    reply_to: Option<MessageId>,
    expires_in_secs: Option<u64>,
}

impl From<&SendDirect> for Outgoing {
    fn from(value: &SendDirect) -> Self {
        Self {
            content: value.content.clone(),
            message_type: value.message_type,
            client_message_id: value.client_message_id.clone(),
            reply_to: value.reply_to,
            expires_in_secs: value.expires_in_secs,
        }
    }
}

impl From<&SendGroup> for Outgoing {
    fn from(value: &SendGroup) -> Self {
        Self {
            content: value.content.clone(),
            message_type: value.message_type,
            client_message_id: value.client_message_id.clone(),
            reply_to: value.reply_to,
            expires_in_secs: value.expires_in_secs,
        }
    }
}

impl RealtimeDispatcher {
    pub fn new(
        sessions: Arc<SessionCoordinator>,
        groups: Arc<GroupSessionCoordinator>,
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions,
                groups,
                store,
                authenticator,
                registry: ConnectionRegistry::new(),
                config,
                presence: RwLock::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Authenticates `bearer` and opens a connection for its user.
    ///
    /// A rejected credential leaves no trace in the registry. On success the
    /// user replaces any previous connection, is marked online, and a worker
    /// task starts processing the connection's events in submission order.
    pub async fn connect(&self, bearer: &str) -> Result<Connection, Error> {
        let user_id = self.inner.authenticator.authenticate(bearer).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(outbound_tx);
        let connection_id = handle.id();
        self.inner.registry.register(&user_id, handle).await;
        self.set_presence(&user_id, PresenceStatus::Online).await;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inner.config.inbound_queue_capacity.max(1));
        let worker = tokio::spawn(self.clone().run(user_id.clone(), connection_id, inbound_rx));

        info!(user_id = %user_id, connection_id = ?connection_id, "connection opened");
        Ok(Connection {
            user_id,
            connection_id,
            inbound: inbound_tx,
            outbound: outbound_rx,
            worker,
        })
    }

    /// Processes one inbound event for `user` on `connection_id`.
    ///
    /// Events from a connection that was replaced by a newer one are dropped,
    /// except for its own disconnect.
    pub async fn handle_event(&self, user: &UserId, connection_id: ConnectionId, event: InboundEvent) {
        if !matches!(event, InboundEvent::Disconnect)
            && !self.inner.registry.is_current(user, connection_id).await
        {
            debug!(user_id = %user, connection_id = ?connection_id, "event from replaced connection dropped");
            return;
        }

        match event {
            InboundEvent::SendDirect(request) => {
                let client_message_id = request.client_message_id.clone();
                if let Err(err) = self.send_direct(user, request).await {
                    self.report_send_failure(user, client_message_id, err).await;
                }
            }
            InboundEvent::SendGroup(request) => {
                let client_message_id = request.client_message_id.clone();
                if let Err(err) = self.send_group(user, request).await {
                    self.report_send_failure(user, client_message_id, err).await;
                }
            }
            InboundEvent::MarkRead(request) => {
                if let Err(err) = self.mark_read(user, request).await {
                    self.report_error(user, err).await;
                }
            }
            InboundEvent::TypingStart(target) => {
                if let Err(err) = self.typing(user, target, true).await {
                    self.report_error(user, err).await;
                }
            }
            InboundEvent::TypingStop(target) => {
                if let Err(err) = self.typing(user, target, false).await {
                    self.report_error(user, err).await;
                }
            }
            InboundEvent::SetStatus(request) => {
                self.set_presence(user, request.status).await;
            }
            InboundEvent::Disconnect => {
                self.disconnect(user, connection_id).await;
            }
        }
    }

    /// Decrypts every undelivered, unexpired message for `user` in send order
    /// and marks them delivered.
    ///
    /// A message that fails to decrypt is returned with placeholder content
    /// instead of failing the batch.
    pub async fn fetch_undelivered(&self, user: &UserId) -> Result<Vec<DeliveredMessage>, Error> {
        let pending = self.inner.store.undelivered_for(user, Utc::now()).await?;

        let mut delivered = Vec::with_capacity(pending.len());
        for record in pending {
            // Claiming first keeps a concurrent live delivery from decrypting twice
            if !self.inner.store.mark_delivered(record.id, user).await? {
                continue;
            }
            let parked = self.inner.parked.lock().await.remove(&(record.id, user.clone()));
            match parked {
                Some(message) => delivered.push(message),
                None => delivered.push(self.open_record(&record).await),
            }
        }

        debug!(user_id = %user, count = delivered.len(), "fetched undelivered messages");
        Ok(delivered)
    }

    pub async fn presence(&self, user: &UserId) -> Option<Presence> {
        self.inner.presence.read().await.get(user).copied()
    }

    async fn run(self, user: UserId, connection_id: ConnectionId, mut inbound: Receiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            if !self.inner.registry.is_current(&user, connection_id).await {
                // Dropping the queue makes further sends on the old connection fail
                debug!(user_id = %user, connection_id = ?connection_id, "connection replaced, worker stopping");
                return;
            }
            let disconnect = matches!(event, InboundEvent::Disconnect);

            let handled = AssertUnwindSafe(self.handle_event(&user, connection_id, event))
                .catch_unwind()
                .await;
            if handled.is_err() {
                error!(user_id = %user, connection_id = ?connection_id, "event handler panicked");
            }

            if disconnect {
                return;
            }
        }

        // Dropped without an explicit disconnect
        self.disconnect(&user, connection_id).await;
    }

    async fn send_direct(&self, sender: &UserId, request: SendDirect) -> Result<(), Error> {
        let outgoing = Outgoing::from(&request);
        self.validate(&outgoing)?;
        if &request.recipient_id == sender {
            return Err(Error::Validation("cannot send a message to yourself".to_string()));
        }
        if self.acknowledge_duplicate(sender, &outgoing).await? {
            return Ok(());
        }

        let payload = self
            .inner
            .sessions
            .encrypt(sender, &request.recipient_id, outgoing.content.as_bytes())
            .await?;

        let id = MessageId::new();
        let record = self.build_record(id, sender, &request.recipient_id, None, &outgoing, &payload)?;
        let stored = self.inner.store.insert(vec![record]).await?;

        self.acknowledge(sender, id, &outgoing.client_message_id).await;
        for record in &stored {
            self.deliver(record).await;
        }

        debug!(sender = %sender, recipient = %request.recipient_id, message_id = %id, "direct message sent");
        Ok(())
    }

    async fn send_group(&self, sender: &UserId, request: SendGroup) -> Result<(), Error> {
        let outgoing = Outgoing::from(&request);
        self.validate(&outgoing)?;

        let members = self
            .inner
            .groups
            .members(&request.group_id)
            .await
            .ok_or_else(|| Error::Authorization(format!("unknown group {}", request.group_id)))?;
        if !members.contains(sender) {
            return Err(Error::Authorization(format!(
                "{sender} is not a member of {}",
                request.group_id
            )));
        }
        if members.iter().all(|member| member == sender) {
            return Err(Error::Validation(format!(
                "group {} has no other members",
                request.group_id
            )));
        }
        if self.acknowledge_duplicate(sender, &outgoing).await? {
            return Ok(());
        }

        let payloads: BTreeMap<UserId, EncryptedPayload> = self
            .inner
            .groups
            .encrypt_group_message(&request.group_id, sender, outgoing.content.as_bytes(), &members)
            .await?;

        let id = MessageId::new();
        let records = payloads
            .iter()
            .map(|(recipient, payload)| {
                self.build_record(id, sender, recipient, Some(&request.group_id), &outgoing, payload)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let stored = self.inner.store.insert(records).await?;

        self.acknowledge(sender, id, &outgoing.client_message_id).await;
        for record in &stored {
            self.deliver(record).await;
        }

        debug!(
            sender = %sender,
            group_id = %request.group_id,
            recipients = stored.len(),
            message_id = %id,
            "group message sent"
        );
        Ok(())
    }

    async fn mark_read(&self, reader: &UserId, request: MarkRead) -> Result<(), Error> {
        let at = Utc::now();
        let record = self
            .inner
            .store
            .mark_read(request.message_id, reader, at)
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown message {}", request.message_id)))?;

        self.inner
            .registry
            .send(
                &record.sender_id,
                OutboundEvent::MessageRead(MessageRead {
                    message_id: record.id,
                    read_by: reader.clone(),
                    read_at: record.read_at.unwrap_or(at),
                }),
            )
            .await;
        Ok(())
    }

    async fn typing(&self, user: &UserId, target: TypingTarget, started: bool) -> Result<(), Error> {
        let notice = |group_id: Option<GroupId>| {
            let notice = TypingNotice {
                user_id: user.clone(),
                group_id,
            };
            if started {
                OutboundEvent::UserTyping(notice)
            } else {
                OutboundEvent::UserStoppedTyping(notice)
            }
        };

        match (target.recipient_id, target.group_id) {
            (Some(recipient), None) => {
                self.inner.registry.send(&recipient, notice(None)).await;
            }
            (None, Some(group_id)) => {
                let members = self.inner.groups.members(&group_id).await.unwrap_or_default();
                if !members.contains(user) {
                    return Err(Error::Authorization(format!(
                        "{user} is not a member of {group_id}"
                    )));
                }
                for member in members.iter().filter(|member| *member != user) {
                    self.inner
                        .registry
                        .send(member, notice(Some(group_id.clone())))
                        .await;
                }
            }
            _ => {
                return Err(Error::Validation(
                    "typing target needs exactly one of recipientId or groupId".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, user: &UserId, connection_id: ConnectionId) {
        if self
            .inner
            .registry
            .deregister_connection(user, connection_id)
            .await
        {
            self.set_presence(user, PresenceStatus::Offline).await;
            info!(user_id = %user, connection_id = ?connection_id, "connection closed");
        } else {
            debug!(user_id = %user, connection_id = ?connection_id, "stale connection closed");
        }
    }

    async fn set_presence(&self, user: &UserId, status: PresenceStatus) {
        let presence = Presence {
            status,
            last_seen: Utc::now(),
        };
        self.inner
            .presence
            .write()
            .await
            .insert(user.clone(), presence);

        let event = OutboundEvent::UserStatusChanged(StatusChange {
            user_id: user.clone(),
            status,
            last_seen: presence.last_seen,
        });
        self.inner.registry.broadcast_except(user, &event).await;
    }

    fn validate(&self, outgoing: &Outgoing) -> Result<(), Error> {
        if outgoing.client_message_id.trim().is_empty() {
            return Err(Error::Validation("clientMessageId is required".to_string()));
        }
        if outgoing.content.trim().is_empty() {
            return Err(Error::Validation("content must not be empty".to_string()));
        }
        if outgoing.content.len() > self.inner.config.max_content_length {
            return Err(Error::Validation(format!(
                "content exceeds {} bytes",
                self.inner.config.max_content_length
            )));
        }
        Ok(())
    }

    /// Re-acknowledges a retried send. Returns whether it was a duplicate.
    async fn acknowledge_duplicate(&self, sender: &UserId, outgoing: &Outgoing) -> Result<bool, Error> {
        let existing = self
            .inner
            .store
            .find_by_client_id(sender, &outgoing.client_message_id)
            .await?;

        match existing.first() {
            Some(original) => {
                debug!(
                    sender = %sender,
                    client_message_id = %outgoing.client_message_id,
                    "duplicate send acknowledged without resending"
                );
                self.acknowledge(sender, original.id, &outgoing.client_message_id)
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acknowledge(&self, sender: &UserId, message_id: MessageId, client_message_id: &str) {
        self.inner
            .registry
            .send(
                sender,
                OutboundEvent::MessageAck(MessageAck {
                    message_id,
                    client_message_id: client_message_id.to_string(),
                    status: MessageStatus::Sent,
                }),
            )
            .await;
    }

    fn build_record(
        &self,
        id: MessageId,
        sender: &UserId,
        recipient: &UserId,
        group_id: Option<&GroupId>,
        outgoing: &Outgoing,
        payload: &EncryptedPayload,
    ) -> Result<MessageRecord, Error> {
        let created_at = Utc::now();
        let expires_at = outgoing
            .expires_in_secs
            .map(|secs| {
                i64::try_from(secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|ttl| created_at.checked_add_signed(ttl))
                    .ok_or_else(|| Error::Validation(format!("expiry of {secs}s is out of range")))
            })
            .transpose()?;

        Ok(MessageRecord {
            id,
            seq: 0,
            sender_id: sender.clone(),
            recipient_id: recipient.clone(),
            group_id: group_id.cloned(),
            content: self
                .inner
                .config
                .persist_plaintext
                .then(|| outgoing.content.clone()),
            encrypted_content: payload.body_base64(),
            encryption_scheme: payload.scheme,
            message_type: outgoing.message_type,
            metadata: MessageMetadata {
                client_message_id: outgoing.client_message_id.clone(),
                device_id: None,
                session_id: payload.session_id.clone(),
            },
            expires_at,
            reply_to: outgoing.reply_to,
            status: MessageStatus::Sent,
            read_at: None,
            read_by: None,
            reactions: BTreeMap::new(),
            created_at,
        })
    }

    /// Pushes a stored record to its recipient if connected. Offline
    /// recipients pick it up through [`RealtimeDispatcher::fetch_undelivered`].
    ///
    /// The message is already stored and acknowledged, so a failure here only
    /// affects this recipient and is logged.
    async fn deliver(&self, record: &MessageRecord) {
        if let Err(err) = self.push(record).await {
            warn!(
                recipient = %record.recipient_id,
                message_id = %record.id,
                error = %err,
                "live delivery failed, message left for fetch"
            );
        }
    }

    async fn push(&self, record: &MessageRecord) -> Result<(), Error> {
        let recipient = &record.recipient_id;
        let connected = self
            .inner
            .registry
            .lookup(recipient)
            .await
            .is_some_and(|handle| handle.is_open());
        if !connected {
            return Ok(());
        }
        if !self.inner.store.mark_delivered(record.id, recipient).await? {
            return Ok(());
        }

        let message = self.open_record(record).await;
        let event = match &record.group_id {
            Some(group_id) => OutboundEvent::NewGroupMessage(NewGroupMessage {
                message: message.clone(),
                group_id: group_id.clone(),
            }),
            None => OutboundEvent::NewDirectMessage(NewDirectMessage {
                message: message.clone(),
            }),
        };
        if self.inner.registry.send(recipient, event).await {
            return Ok(());
        }

        // Recipient went away after the claim: hand the message back to fetch
        self.inner
            .parked
            .lock()
            .await
            .insert((record.id, recipient.clone()), message);
        self.inner.store.mark_undelivered(record.id, recipient).await?;
        warn!(
            recipient = %recipient,
            message_id = %record.id,
            "recipient disconnected during delivery, message returned to undelivered"
        );
        Ok(())
    }

    /// Decrypts a stored record for its recipient.
    async fn open_record(&self, record: &MessageRecord) -> DeliveredMessage {
        let opened = match EncryptedPayload::from_parts(
            record.encryption_scheme,
            record.metadata.session_id.clone(),
            &record.encrypted_content,
        ) {
            Ok(payload) => self
                .inner
                .sessions
                .decrypt(&record.sender_id, &record.recipient_id, &payload)
                .await
                .and_then(|plaintext| {
                    String::from_utf8(plaintext)
                        .map_err(|err| Error::Decryption(format!("content is not UTF-8: {err}")))
                }),
            Err(err) => Err(err),
        };

        let (content, decryption_failed) = match opened {
            Ok(content) => (content, false),
            Err(err) => {
                warn!(
                    message_id = %record.id,
                    sender = %record.sender_id,
                    recipient = %record.recipient_id,
                    error = %err,
                    "failed to decrypt message"
                );
                (UNDECRYPTABLE_PLACEHOLDER.to_string(), true)
            }
        };

        DeliveredMessage {
            id: record.id,
            sender_id: record.sender_id.clone(),
            recipient_id: record.recipient_id.clone(),
            group_id: record.group_id.clone(),
            content,
            decryption_failed,
            message_type: record.message_type,
            client_message_id: record.metadata.client_message_id.clone(),
            reply_to: record.reply_to,
            expires_at: record.expires_at,
            created_at: record.created_at,
        }
    }

    async fn report_send_failure(&self, sender: &UserId, client_message_id: String, err: Error) {
        warn!(sender = %sender, client_message_id = %client_message_id, error = %err, "send failed");
        self.inner
            .registry
            .send(
                sender,
                OutboundEvent::MessageFailed(MessageFailed {
                    client_message_id,
                    code: err.code().to_string(),
                    error: err.to_string(),
                }),
            )
            .await;
    }

    async fn report_error(&self, user: &UserId, err: Error) {
        debug!(user_id = %user, error = %err, "event rejected");
        self.inner
            .registry
            .send(
                user,
                OutboundEvent::Error(ErrorNotice {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            )
            .await;
    }
}

/// Client side of one authenticated connection.
///
/// Events passed to [`Connection::send`] are processed in order by the
/// connection's worker; events for this user arrive through
/// [`Connection::recv`].
pub struct Connection {
    user_id: UserId,
    connection_id: ConnectionId,
    inbound: Sender<InboundEvent>,
    outbound: UnboundedReceiver<OutboundEvent>,
    worker: JoinHandle<()>,
}

impl Connection {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queues `event`, waiting while the inbound queue is full.
    pub async fn send(&self, event: InboundEvent) -> Result<(), Error> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| Error::Validation("connection is closed".to_string()))
    }

    /// Parses a JSON event envelope and queues it.
    pub async fn send_json(&self, text: &str) -> Result<(), Error> {
        let event: InboundEvent = serde_json::from_str(text)?;
        self.send(event).await
    }

    /// Next event pushed to this connection, or `None` once it was closed
    /// or replaced by a newer connection of the same user.
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.outbound.recv().await
    }

    /// Disconnects and waits for already queued events to finish.
    pub async fn close(self) {
        let Connection {
            user_id,
            connection_id,
            inbound,
            worker,
            ..
        } = self;

        // A full or closed queue still ends the worker once the sender drops
        let _ = inbound.send(InboundEvent::Disconnect).await;
        drop(inbound);
        if worker.await.is_err() {
            error!(user_id = %user_id, connection_id = ?connection_id, "connection worker failed");
        }
    }
}
