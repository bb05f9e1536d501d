//! Outgoing message queue: the pending-send state machine.
//!
//! Items are held in strict enqueue order (FIFO by durable row id) and
//! persisted through the [`ChatStore`] before any network attempt, so
//! a message the user believes was sent survives a restart as at least
//! pending. Items leave the queue on confirmation, cancellation, or by
//! demotion to the manual-send queue when automatic delivery gives up.

use std::collections::VecDeque;
use std::sync::Arc;

use chatsync_proto::command::{ManualSendReason, RowId, SendOpcode};
use chatsync_proto::message::{KeyId, Message, MessageId};
use serde::{Deserialize, Serialize};

use crate::store::{ChatStore, StoreError};

/// Delivery progress of a queued item.
///
/// Not persisted: after a reload every surviving item is pending again
/// and is retransmitted (the server deduplicates by provisional
/// identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    /// Waiting to be transmitted.
    #[default]
    Pending,
    /// Held back until an encryption key id is confirmed.
    AwaitingKey,
    /// Transmitted; awaiting the server receipt.
    Sent,
}

/// An entry in the outgoing queue.
///
/// Exclusively owned by the queue while pending; removed on
/// confirmation or explicit cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingItem {
    /// Durable queue-row identifier.
    pub rowid: RowId,
    /// What this row asks the server to do.
    pub opcode: SendOpcode,
    /// The message payload.
    pub msg: Message,
    /// Serialized wire blob, once the encryption layer has produced it.
    pub wire: Option<Vec<u8>>,
    /// Serialized key-delivery blob for the recipients, if any.
    pub key_wire: Option<Vec<u8>>,
    /// Delivery progress; transient.
    pub state: SendState,
}

/// An outgoing item demoted after automatic delivery gave up.
///
/// Terminal until the user acts: resend re-enqueues it, discard drops
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualSendItem {
    /// Row id the item had in the outgoing queue (kept for addressing).
    pub rowid: RowId,
    /// The opcode the item carried.
    pub opcode: SendOpcode,
    /// The message payload.
    pub msg: Message,
    /// Why automatic delivery gave up.
    pub reason: ManualSendReason,
}

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No queued item carries the given row id. Deleted row ids are
    /// terminal, so this also fires on use-after-remove.
    #[error("no queued item with row id {0}")]
    UnknownRow(RowId),
}

/// The outgoing queue of one conversation, mirrored in memory and
/// durable in the store.
pub struct OutgoingQueue<S> {
    store: Arc<S>,
    items: VecDeque<SendingItem>,
    manual: Vec<ManualSendItem>,
}

impl<S: ChatStore> OutgoingQueue<S> {
    /// Reloads both queues from storage in ascending row-id order.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the load.
    pub async fn load(store: Arc<S>) -> Result<Self, StoreError> {
        let items = store.load_outgoing_queue().await?.into();
        let manual = store.load_manual_queue().await?;
        Ok(Self {
            store,
            items,
            manual,
        })
    }

    /// Number of items awaiting transmission or confirmation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the outgoing queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in enqueue order.
    pub fn iter(&self) -> impl Iterator<Item = &SendingItem> {
        self.items.iter()
    }

    /// The queued item with the given row id, if any.
    #[must_use]
    pub fn get(&self, rowid: RowId) -> Option<&SendingItem> {
        self.items.iter().find(|item| item.rowid == rowid)
    }

    /// The manual-send queue in demotion order.
    #[must_use]
    pub fn manual_items(&self) -> &[ManualSendItem] {
        &self.manual
    }

    /// The manual-send item with the given row id, if any.
    #[must_use]
    pub fn get_manual(&self, rowid: RowId) -> Option<&ManualSendItem> {
        self.manual.iter().find(|item| item.rowid == rowid)
    }

    /// Persists and enqueues a new outgoing item, returning its row id.
    ///
    /// The store write happens before the item becomes visible, so a
    /// crash after this call leaves the message recoverable.
    ///
    /// # Errors
    ///
    /// Propagates the store failure; nothing is enqueued on error.
    pub async fn enqueue(
        &mut self,
        opcode: SendOpcode,
        msg: Message,
    ) -> Result<RowId, QueueError> {
        let rowid = self.store.enqueue_outgoing(opcode, &msg).await?;
        tracing::debug!(rowid, ?opcode, id = %msg.id, "enqueued outgoing item");
        self.items.push_back(SendingItem {
            rowid,
            opcode,
            msg,
            wire: None,
            key_wire: None,
            state: SendState::Pending,
        });
        Ok(rowid)
    }

    /// Rewrites the payload of a still-queued item (local edit of a
    /// message that has not been transmitted yet).
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] or the underlying store failure.
    pub async fn update_message(&mut self, rowid: RowId, msg: Message) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        self.store.update_outgoing_message(rowid, &msg).await?;
        self.items[pos].msg = msg;
        Ok(())
    }

    /// Attaches encrypted wire blobs without changing queue position.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] or the underlying store failure.
    pub async fn attach_wire(
        &mut self,
        rowid: RowId,
        wire: Option<Vec<u8>>,
        key_wire: Option<Vec<u8>>,
    ) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        self.store
            .update_outgoing_wire(rowid, wire.as_deref(), key_wire.as_deref())
            .await?;
        let item = &mut self.items[pos];
        item.wire = wire;
        item.key_wire = key_wire;
        Ok(())
    }

    /// Records a confirmed key id for the item and releases it from
    /// [`SendState::AwaitingKey`] if it was held there.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] or the underlying store failure.
    pub async fn confirm_key(&mut self, rowid: RowId, key_id: KeyId) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        self.store.update_outgoing_key(rowid, key_id).await?;
        let item = &mut self.items[pos];
        item.msg.key_id = Some(key_id);
        if item.state == SendState::AwaitingKey {
            item.state = SendState::Pending;
        }
        Ok(())
    }

    /// Marks an item as transmitted (in-memory bookkeeping only).
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] if the row is not queued.
    pub fn mark_sent(&mut self, rowid: RowId) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        self.items[pos].state = SendState::Sent;
        Ok(())
    }

    /// Holds an item back until its encryption key is confirmed.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] if the row is not queued.
    pub fn mark_awaiting_key(&mut self, rowid: RowId) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        self.items[pos].state = SendState::AwaitingKey;
        Ok(())
    }

    /// Removes the item from the in-memory queue only.
    ///
    /// Used by the confirmation path, where the durable removal happens
    /// atomically with the history append via
    /// [`ChatStore::confirm_to_history`].
    pub fn take(&mut self, rowid: RowId) -> Option<SendingItem> {
        let pos = self.items.iter().position(|item| item.rowid == rowid)?;
        self.items.remove(pos)
    }

    /// Cancels an item: durable delete plus in-memory removal. The row
    /// id is terminal afterwards.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] or the underlying store failure.
    pub async fn remove(&mut self, rowid: RowId) -> Result<SendingItem, QueueError> {
        let pos = self.position(rowid)?;
        self.store.delete_outgoing(rowid).await?;
        self.items
            .remove(pos)
            .ok_or(QueueError::UnknownRow(rowid))
    }

    /// Rewrites every `UpdateProvisional` item that edits `provisional`
    /// into a plain `Update` carrying the confirmed identity. Storage
    /// and memory are updated row by row, each row atomically.
    ///
    /// Returns how many rows were rewritten.
    ///
    /// # Errors
    ///
    /// Propagates the first store failure.
    pub async fn rewrite_provisional(
        &mut self,
        provisional: MessageId,
        confirmed: MessageId,
    ) -> Result<usize, QueueError> {
        let rowids: Vec<RowId> = self
            .items
            .iter()
            .filter(|item| {
                item.opcode == SendOpcode::UpdateProvisional && item.msg.id == provisional
            })
            .map(|item| item.rowid)
            .collect();
        for rowid in &rowids {
            self.store.rewrite_provisional(*rowid, confirmed).await?;
            let pos = self.position(*rowid)?;
            let item = &mut self.items[pos];
            item.opcode = SendOpcode::Update;
            item.msg.id = confirmed;
            tracing::debug!(
                rowid,
                %provisional,
                %confirmed,
                "rewrote provisional edit to confirmed target"
            );
        }
        Ok(rowids.len())
    }

    /// Demotes an item to the manual-send queue with the given reason.
    ///
    /// The durable move is atomic; the item keeps its row id for
    /// addressing by the application.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] or the underlying store failure.
    pub async fn demote(
        &mut self,
        rowid: RowId,
        reason: ManualSendReason,
    ) -> Result<(), QueueError> {
        let pos = self.position(rowid)?;
        let snapshot = self.items[pos].clone();
        self.store.demote_to_manual(&snapshot, reason).await?;
        if let Some(item) = self.items.remove(pos) {
            tracing::warn!(rowid, %reason, "outgoing item demoted to manual send");
            self.manual.push(ManualSendItem {
                rowid: item.rowid,
                opcode: item.opcode,
                msg: item.msg,
                reason,
            });
        }
        Ok(())
    }

    /// Discards a manual-send item. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Propagates the underlying store failure.
    pub async fn discard_manual(&mut self, rowid: RowId) -> Result<bool, QueueError> {
        let existed = self.store.delete_manual(rowid).await?;
        self.manual.retain(|item| item.rowid != rowid);
        Ok(existed)
    }

    /// Removes a manual-send item for re-enqueueing by the caller.
    ///
    /// # Errors
    ///
    /// [`QueueError::UnknownRow`] if no such manual item exists, or the
    /// underlying store failure.
    pub async fn take_manual(&mut self, rowid: RowId) -> Result<ManualSendItem, QueueError> {
        let pos = self
            .manual
            .iter()
            .position(|item| item.rowid == rowid)
            .ok_or(QueueError::UnknownRow(rowid))?;
        if !self.store.delete_manual(rowid).await? {
            return Err(QueueError::UnknownRow(rowid));
        }
        Ok(self.manual.remove(pos))
    }

    fn position(&self, rowid: RowId) -> Result<usize, QueueError> {
        self.items
            .iter()
            .position(|item| item.rowid == rowid)
            .ok_or(QueueError::UnknownRow(rowid))
    }
}
