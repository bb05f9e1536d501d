//! Conversation engine: composes the history index, outgoing queue,
//! persistence contract, and retry driver into the synchronization and
//! send protocol exposed to the application layer.
//!
//! One engine instance owns one conversation. All mutation goes
//! through `&mut self`, so state changes only between well-defined
//! await points — there is no parallel mutation to lock against.
//! Notifications are emitted best-effort on a bounded channel, the
//! application drains them at its own pace.

use std::sync::Arc;

use tokio::sync::mpsc;

use chatsync_proto::command::{Idx, ManualSendReason, RowId, SendOpcode};
use chatsync_proto::message::{KeyId, Message, MessageId, MessageKind, UserId};

use crate::config::EngineConfig;
use crate::history::{HistoryError, HistoryIndex};
use crate::queue::{OutgoingQueue, QueueError, SendState, SendingItem};
use crate::retry::{RetryError, retry};
use crate::service::{ChatService, SendReceipt};
use crate::store::{ChatDbInfo, ChatStore, StoreError};

/// Notifications emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// An outgoing message was confirmed into history.
    MessageConfirmed {
        /// The local handle the application holds.
        provisional: MessageId,
        /// The durable identity the server assigned.
        confirmed: MessageId,
        /// The idx the entry received.
        idx: Idx,
    },
    /// A message from the remote authority entered history.
    MessageReceived {
        /// Identity of the new entry.
        id: MessageId,
        /// The idx the entry received.
        idx: Idx,
    },
    /// The server truncated history; everything older than `at` is gone.
    HistoryTruncated {
        /// The truncation marker's identity.
        at: MessageId,
    },
    /// An outgoing item gave up on automatic delivery and requires
    /// user action (resend or discard).
    ManualSendRequired {
        /// Row id addressing the manual-send item.
        rowid: RowId,
        /// Why automatic delivery gave up.
        reason: ManualSendReason,
    },
}

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The persistence layer failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The ordered index rejected a mutation.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// A network operation failed terminally.
    #[error("delivery failed: {0}")]
    Delivery(RetryError),

    /// The referenced queue or manual-send row does not exist.
    #[error("no queued item with row id {0}")]
    UnknownRow(RowId),

    /// The message an edit targets is not available locally.
    #[error("edit target {0} is not available")]
    EditTargetMissing(MessageId),
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(e) => Self::Store(e),
            QueueError::UnknownRow(rowid) => Self::UnknownRow(rowid),
        }
    }
}

impl EngineError {
    /// Whether this failure indicates corrupted local state. Such
    /// failures are fatal to the conversation and require
    /// resynchronization; they are never retried internally.
    #[must_use]
    pub const fn is_integrity_violation(&self) -> bool {
        match self {
            Self::Store(e) => e.is_integrity_violation(),
            Self::History(e) => matches!(
                e,
                HistoryError::Discontinuity { .. } | HistoryError::DuplicateId(_)
            ),
            _ => false,
        }
    }
}

/// The client-side engine for one conversation.
pub struct ConversationEngine<S, N> {
    store: Arc<S>,
    service: Arc<N>,
    me: UserId,
    config: EngineConfig,
    info: ChatDbInfo,
    history: HistoryIndex,
    queue: OutgoingQueue<S>,
    have_all_history: bool,
    events: mpsc::Sender<EngineEvent>,
}

impl<S, N> ConversationEngine<S, N>
where
    S: ChatStore,
    N: ChatService + 'static,
{
    /// Loads persisted state and builds the engine.
    ///
    /// Seeds the in-memory window with the newest stored messages and
    /// reloads both send queues in row-id order. Returns the engine and
    /// the receiver for [`EngineEvent`] notifications.
    ///
    /// # Errors
    ///
    /// Propagates store failures and any integrity violation detected
    /// while seeding the window.
    pub async fn open(
        store: Arc<S>,
        service: Arc<N>,
        me: UserId,
        config: EngineConfig,
        event_buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), EngineError> {
        let info = store.load_history_info().await?;
        let mut history = HistoryIndex::new();
        let mut rows = store.fetch_history(None, config.history_window).await?;
        rows.reverse();
        history.seed(rows)?;
        let queue = OutgoingQueue::load(Arc::clone(&store)).await?;
        let have_all_history = store.have_all_history().await?;
        let (events, event_rx) = mpsc::channel(event_buffer);
        tracing::debug!(
            newest_idx = ?info.newest_idx,
            window = history.len(),
            pending = queue.len(),
            manual = queue.manual_items().len(),
            "conversation engine opened"
        );
        Ok((
            Self {
                store,
                service,
                me,
                config,
                info,
                history,
                queue,
                have_all_history,
                events,
            },
            event_rx,
        ))
    }

    /// The local user this engine sends as.
    #[must_use]
    pub const fn user(&self) -> UserId {
        self.me
    }

    /// The persisted-extent summary as of the last load or mutation.
    #[must_use]
    pub const fn info(&self) -> &ChatDbInfo {
        &self.info
    }

    /// The loaded history window.
    #[must_use]
    pub const fn history(&self) -> &HistoryIndex {
        &self.history
    }

    /// The outgoing and manual-send queues.
    #[must_use]
    pub const fn outgoing(&self) -> &OutgoingQueue<S> {
        &self.queue
    }

    /// Whether the full history back to the first message is local.
    #[must_use]
    pub const fn have_all_history(&self) -> bool {
        self.have_all_history
    }

    /// Synchronizes with the remote authority, then flushes the
    /// outgoing queue.
    ///
    /// With local history present only the delta past the newest known
    /// identity is requested; an empty store requests a full initial
    /// window. The sync itself runs under the bounded `sync` retry
    /// policy; a terminal failure is returned to the caller.
    ///
    /// # Errors
    ///
    /// [`EngineError::Delivery`] when the sync retries give up, plus
    /// any store or integrity failure while applying the delta.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        let anchor = self.info.newest;
        let window = self.config.history_window;
        let service = Arc::clone(&self.service);
        let op = move || {
            let service = Arc::clone(&service);
            async move { service.sync_history(anchor, window).await }
        };
        let mut handle = retry(op, self.config.sync);
        let delta = handle.outcome().await.map_err(EngineError::Delivery)?;
        tracing::debug!(
            new = delta.messages.len(),
            truncated = delta.truncate.is_some(),
            "history sync applied"
        );
        if let Some(marker) = delta.truncate {
            self.handle_truncate(marker).await?;
        }
        for msg in delta.messages {
            self.handle_incoming(msg).await?;
        }
        self.flush_queue().await
    }

    /// Creates a message, persists it as pending, and transmits the
    /// queue. The returned provisional identity is the caller's local
    /// handle; confirmation arrives as
    /// [`EngineEvent::MessageConfirmed`].
    ///
    /// A delivery that escalates to manual send is not an error here —
    /// it surfaces as [`EngineEvent::ManualSendRequired`].
    ///
    /// # Errors
    ///
    /// Store and integrity failures.
    pub async fn send_message(
        &mut self,
        kind: MessageKind,
        content: Vec<u8>,
    ) -> Result<MessageId, EngineError> {
        let msg = Message::new_local(self.me, kind, content);
        let local = msg.id;
        self.queue.enqueue(SendOpcode::New, msg).await?;
        self.flush_queue().await?;
        Ok(local)
    }

    /// Queues an edit of a message and returns the edit's queue row id.
    ///
    /// Confirmed targets get a plain `Update`. A provisional target
    /// whose `New` row has not been transmitted yet is amended in
    /// place; one already in flight gets an `UpdateProvisional` row
    /// that waits for the original to confirm before it can be
    /// transmitted.
    ///
    /// # Errors
    ///
    /// [`EngineError::EditTargetMissing`] when the target is unknown,
    /// plus store and integrity failures.
    pub async fn edit_message(
        &mut self,
        target: MessageId,
        content: Vec<u8>,
    ) -> Result<RowId, EngineError> {
        if target.is_provisional() {
            let pending = self
                .queue
                .iter()
                .find(|item| item.opcode == SendOpcode::New && item.msg.id == target)
                .map(|item| (item.rowid, item.state, item.msg.clone()));
            let Some((rowid, state, mut msg)) = pending else {
                return Err(EngineError::EditTargetMissing(target));
            };
            msg.content = content;
            msg.bump_updated();
            if state == SendState::Pending {
                self.queue.update_message(rowid, msg).await?;
                Ok(rowid)
            } else {
                let rowid = self.queue.enqueue(SendOpcode::UpdateProvisional, msg).await?;
                Ok(rowid)
            }
        } else {
            let base = if let Some(idx) = self.history.idx_of(target) {
                self.history.get(idx).cloned()
            } else if let Some(idx) = self.store.idx_of(target).await? {
                self.store
                    .fetch_history(Some(idx), 1)
                    .await?
                    .into_iter()
                    .next()
                    .map(|(_, m)| m)
            } else {
                None
            };
            let Some(mut msg) = base else {
                return Err(EngineError::EditTargetMissing(target));
            };
            msg.content = content;
            msg.bump_updated();
            let rowid = self.queue.enqueue(SendOpcode::Update, msg).await?;
            self.flush_queue().await?;
            Ok(rowid)
        }
    }

    /// Attaches encrypted wire blobs produced by the encryption layer
    /// to a queued item.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRow`] or store failures.
    pub async fn attach_encrypted_payload(
        &mut self,
        rowid: RowId,
        wire: Option<Vec<u8>>,
        key_wire: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        Ok(self.queue.attach_wire(rowid, wire, key_wire).await?)
    }

    /// Holds a queued item back until its encryption key id is
    /// confirmed via [`confirm_key`](Self::confirm_key). While the
    /// queue head is held, nothing behind it is transmitted.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRow`] if the row is not queued.
    pub fn hold_for_key(&mut self, rowid: RowId) -> Result<(), EngineError> {
        Ok(self.queue.mark_awaiting_key(rowid)?)
    }

    /// Records a confirmed key id for a queued item and resumes
    /// transmission if the queue head was waiting for it.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRow`] or store failures.
    pub async fn confirm_key(&mut self, rowid: RowId, key_id: KeyId) -> Result<(), EngineError> {
        self.queue.confirm_key(rowid, key_id).await?;
        self.flush_queue().await
    }

    /// Re-enqueues a manual-send item for automatic delivery and
    /// returns its new queue row id.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownRow`] when no such manual item exists,
    /// plus store failures.
    pub async fn resend_manual(&mut self, rowid: RowId) -> Result<RowId, EngineError> {
        let item = self.queue.take_manual(rowid).await?;
        tracing::info!(rowid, "manual-send item re-enqueued");
        let new_rowid = self.queue.enqueue(item.opcode, item.msg).await?;
        self.flush_queue().await?;
        Ok(new_rowid)
    }

    /// Discards a manual-send item. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn discard_manual(&mut self, rowid: RowId) -> Result<bool, EngineError> {
        Ok(self.queue.discard_manual(rowid).await?)
    }

    /// Loads up to `count` older messages, from local storage below the
    /// loaded window first, then from the remote authority. Returns
    /// them newest-first.
    ///
    /// A server batch shorter than requested marks the full history as
    /// locally available.
    ///
    /// # Errors
    ///
    /// [`EngineError::Delivery`] when the fetch retries give up, plus
    /// store and integrity failures.
    pub async fn request_older_history(
        &mut self,
        count: usize,
    ) -> Result<Vec<Message>, EngineError> {
        let mut out = Vec::new();
        if count == 0 {
            return Ok(out);
        }
        if let Some(window_oldest) = self.history.oldest_idx() {
            let stored_oldest = self.store.oldest_stored_idx().await?;
            if stored_oldest.is_some_and(|s| s < window_oldest) {
                let rows = self
                    .store
                    .fetch_history(Some(window_oldest - 1), count)
                    .await?;
                self.history.extend_oldest(rows.clone())?;
                out.extend(rows.into_iter().map(|(_, m)| m));
            }
        }
        if out.len() >= count || self.have_all_history {
            return Ok(out);
        }
        let Some(oldest_id) = self.info.oldest else {
            // No local history at all; the initial window comes from
            // connect().
            return Ok(out);
        };
        let need = count - out.len();
        let service = Arc::clone(&self.service);
        let op = move || {
            let service = Arc::clone(&service);
            async move { service.fetch_older(oldest_id, need).await }
        };
        let mut handle = retry(op, self.config.sync);
        let batch = handle.outcome().await.map_err(EngineError::Delivery)?;
        if batch.len() < need {
            self.store.mark_have_all_history().await?;
            self.have_all_history = true;
            tracing::debug!("short batch from server; full history is now local");
        }
        if batch.is_empty() {
            return Ok(out);
        }
        let mut next_idx = self
            .store
            .oldest_stored_idx()
            .await?
            .map_or(-1, |oldest| oldest - 1);
        let mut fetched = Vec::with_capacity(batch.len());
        for msg in batch {
            self.store.append_history(next_idx, &msg).await?;
            fetched.push((next_idx, msg));
            next_idx -= 1;
        }
        self.history.extend_oldest(fetched.clone())?;
        if let Some((_, oldest_msg)) = fetched.last() {
            self.info.oldest = Some(oldest_msg.id);
        }
        out.extend(fetched.into_iter().map(|(_, m)| m));
        Ok(out)
    }

    /// Folds a message pushed by the transport into history.
    ///
    /// Idempotent: an identity that is already stored is skipped, so
    /// replays after a resynchronization are harmless.
    ///
    /// # Errors
    ///
    /// Store and integrity failures.
    pub async fn handle_incoming(&mut self, msg: Message) -> Result<(), EngineError> {
        if self.history.contains(msg.id) || self.store.idx_of(msg.id).await?.is_some() {
            tracing::debug!(id = %msg.id, "message already stored; skipping");
            return Ok(());
        }
        let idx = self.next_new_idx();
        self.store.append_history(idx, &msg).await?;
        let id = msg.id;
        let assigned = self.history.extend_newest(msg)?;
        debug_assert_eq!(assigned, idx);
        self.info.newest = Some(id);
        self.info.newest_idx = Some(idx);
        if self.info.oldest.is_none() {
            self.info.oldest = Some(id);
        }
        self.store.set_last_received(id).await?;
        self.info.last_received = Some(id);
        let _ = self.events.try_send(EngineEvent::MessageReceived { id, idx });
        Ok(())
    }

    /// Applies a server-initiated history truncation: the marker
    /// replaces its entry and everything older is deleted, durably and
    /// in the loaded window.
    ///
    /// # Errors
    ///
    /// Store and integrity failures. A marker whose entry cannot be
    /// rewritten surfaces as an integrity violation.
    pub async fn handle_truncate(&mut self, marker: Message) -> Result<(), EngineError> {
        let at = marker.id;
        if self.store.idx_of(at).await?.is_none() {
            // Truncation point is newer than anything stored locally;
            // fold the marker in first so there is an entry to cut at.
            self.handle_incoming(marker.clone()).await?;
        }
        self.store.update_history(at, &marker).await?;
        self.store.truncate_history(at).await?;
        if self.history.contains(at) {
            self.history.replace(at, marker)?;
            self.history.truncate_before(at)?;
        } else {
            // The marker is older than the loaded window; rebuild the
            // window from what storage retained.
            let mut rows = self
                .store
                .fetch_history(None, self.config.history_window)
                .await?;
            rows.reverse();
            self.history.seed(rows)?;
        }
        self.info = self.store.load_history_info().await?;
        tracing::info!(%at, "history truncated");
        let _ = self.events.try_send(EngineEvent::HistoryTruncated { at });
        Ok(())
    }

    /// Marks history as read up to the given message.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn set_seen(&mut self, id: MessageId) -> Result<(), EngineError> {
        self.store.set_last_seen(id).await?;
        self.info.last_seen = Some(id);
        Ok(())
    }

    /// Number of stored messages from other participants newer than
    /// the read watermark.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn unread_count(&self) -> Result<usize, EngineError> {
        let after = match self.info.last_seen {
            Some(id) => self.store.idx_of(id).await?,
            None => None,
        };
        Ok(self.store.count_peer_messages_after(self.me, after).await?)
    }

    /// The newest message carrying visible text at or before `before`,
    /// from the loaded window first and storage as fallback.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn last_text_message(
        &self,
        before: Idx,
    ) -> Result<Option<(Idx, Message)>, EngineError> {
        if let Some((idx, msg)) = self.history.last_text_message(before) {
            return Ok(Some((idx, msg.clone())));
        }
        Ok(self.store.last_text_message(before).await?)
    }

    // Transmits queued items strictly in enqueue order until the queue
    // is empty or its head cannot be sent yet.
    async fn flush_queue(&mut self) -> Result<(), EngineError> {
        loop {
            let Some(head) = self.queue.iter().next().cloned() else {
                return Ok(());
            };
            match head.state {
                // Strict ordering: a blocked head blocks the queue.
                SendState::AwaitingKey | SendState::Sent => return Ok(()),
                SendState::Pending => {}
            }
            if head.opcode == SendOpcode::UpdateProvisional && head.msg.id.is_provisional() {
                // Orphaned edit: the original it targets is no longer
                // ahead of it in the queue (its confirmation never
                // rewrote this row). Automatic recovery is impossible.
                self.demote_item(&head, ManualSendReason::GeneralFailure)
                    .await?;
                continue;
            }
            self.transmit(head).await?;
        }
    }

    async fn transmit(&mut self, item: SendingItem) -> Result<(), EngineError> {
        self.queue.mark_sent(item.rowid)?;
        tracing::debug!(
            rowid = item.rowid,
            opcode = ?item.opcode,
            id = %item.msg.id,
            "transmitting outgoing item"
        );
        let service = Arc::clone(&self.service);
        let msg = item.msg.clone();
        let wire = item.wire.clone();
        let opcode = item.opcode;
        let op = move || {
            let service = Arc::clone(&service);
            let msg = msg.clone();
            let wire = wire.clone();
            async move {
                match opcode {
                    SendOpcode::New => service.send_new(&msg, wire.as_deref()).await,
                    SendOpcode::Update | SendOpcode::UpdateProvisional => {
                        service.send_update(&msg).await
                    }
                }
            }
        };
        let mut handle = retry(op, self.config.transmit);
        match handle.outcome().await {
            Ok(receipt) => self.confirm(&item, receipt).await,
            Err(RetryError::Rejected(err)) => {
                tracing::warn!(rowid = item.rowid, error = %err, "server rejected outgoing item");
                self.demote_item(&item, ManualSendReason::GeneralFailure).await
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::warn!(
                    rowid = item.rowid,
                    attempts,
                    error = %last,
                    "delivery retries exhausted"
                );
                self.demote_item(&item, ManualSendReason::RetriesExhausted)
                    .await
            }
            Err(err @ RetryError::Aborted) => Err(EngineError::Delivery(err)),
        }
    }

    async fn confirm(&mut self, item: &SendingItem, receipt: SendReceipt) -> Result<(), EngineError> {
        match item.opcode {
            SendOpcode::New => {
                let provisional = item.msg.id;
                let mut confirmed = item.msg.clone();
                confirmed.id = receipt.id;
                confirmed.ts = receipt.ts;
                if self.history.contains(receipt.id) {
                    return Err(EngineError::History(HistoryError::DuplicateId(receipt.id)));
                }
                let idx = self.next_new_idx();
                // One durable transaction: history append + queue delete.
                self.store.confirm_to_history(item.rowid, idx, &confirmed).await?;
                self.queue.take(item.rowid);
                let assigned = self.history.extend_newest(confirmed)?;
                debug_assert_eq!(assigned, idx);
                self.info.newest = Some(receipt.id);
                self.info.newest_idx = Some(idx);
                if self.info.oldest.is_none() {
                    self.info.oldest = Some(receipt.id);
                }
                self.queue.rewrite_provisional(provisional, receipt.id).await?;
                tracing::info!(
                    %provisional,
                    confirmed = %receipt.id,
                    idx,
                    "message confirmed into history"
                );
                let _ = self.events.try_send(EngineEvent::MessageConfirmed {
                    provisional,
                    confirmed: receipt.id,
                    idx,
                });
                Ok(())
            }
            SendOpcode::Update | SendOpcode::UpdateProvisional => {
                let confirmed = item.msg.clone();
                self.store.update_history(confirmed.id, &confirmed).await?;
                if self.history.contains(confirmed.id) {
                    self.history.replace(confirmed.id, confirmed.clone())?;
                }
                self.queue.remove(item.rowid).await?;
                tracing::info!(
                    id = %confirmed.id,
                    revision = confirmed.updated,
                    "edit confirmed"
                );
                Ok(())
            }
        }
    }

    async fn demote_item(
        &mut self,
        item: &SendingItem,
        reason: ManualSendReason,
    ) -> Result<(), EngineError> {
        self.queue.demote(item.rowid, reason).await?;
        let _ = self.events.try_send(EngineEvent::ManualSendRequired {
            rowid: item.rowid,
            reason,
        });
        // Edits queued against this item's provisional identity can
        // never be rewritten now; they go with it.
        if item.opcode == SendOpcode::New && item.msg.id.is_provisional() {
            let dependents: Vec<RowId> = self
                .queue
                .iter()
                .filter(|i| {
                    i.opcode == SendOpcode::UpdateProvisional && i.msg.id == item.msg.id
                })
                .map(|i| i.rowid)
                .collect();
            for rowid in dependents {
                self.queue.demote(rowid, reason).await?;
                let _ = self
                    .events
                    .try_send(EngineEvent::ManualSendRequired { rowid, reason });
            }
        }
        Ok(())
    }

    fn next_new_idx(&self) -> Idx {
        self.history
            .newest_idx()
            .or(self.info.newest_idx)
            .map_or(0, |newest| newest + 1)
    }
}
