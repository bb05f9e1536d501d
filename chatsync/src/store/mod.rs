//! Persistence contract between the conversation engine and a durable
//! storage collaborator.
//!
//! [`ChatStore`] is the full capability the engine requires: the
//! history table (idx-ordered message records), the outgoing send
//! queue, the manual-send queue, and per-conversation watermarks.
//! Every mutating call commits as an atomic unit before returning.
//! A mismatch between the expected and actual number of affected rows
//! is a programmer-error-class failure and must surface as
//! [`StoreError::RowCountMismatch`], never be silently ignored.
//!
//! Concrete engines (an embedded SQL store, the in-memory
//! [`memory::MemoryStore`] used by tests) implement this trait.

pub mod memory;

use std::future::Future;

use chatsync_proto::command::{Idx, ManualSendReason, RowId, SendOpcode};
use chatsync_proto::message::{KeyId, Message, MessageId, UserId};

use crate::queue::{ManualSendItem, SendingItem};

/// Summary of the persisted extent of one conversation, computed at
/// load time from storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatDbInfo {
    /// Identity of the oldest stored history entry.
    pub oldest: Option<MessageId>,
    /// Identity of the newest stored history entry.
    pub newest: Option<MessageId>,
    /// Idx of the newest stored history entry.
    pub newest_idx: Option<Idx>,
    /// Read watermark: the last entry the user has seen.
    pub last_seen: Option<MessageId>,
    /// Delivery watermark: the last entry received by this client.
    pub last_received: Option<MessageId>,
}

impl ChatDbInfo {
    /// Whether any history is stored at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.newest.is_none()
    }
}

/// Errors surfaced by a store implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write could not be committed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The addressed row does not exist.
    #[error("row not found: {0}")]
    NotFound(String),

    /// An operation touched an unexpected number of rows.
    #[error("{op}: expected {expected} affected rows, got {actual}")]
    RowCountMismatch {
        /// The operation that detected the mismatch.
        op: &'static str,
        /// Rows the operation must have touched.
        expected: usize,
        /// Rows it actually touched.
        actual: usize,
    },

    /// A gap was detected in the idx sequence.
    #[error("history discontinuity: {0}")]
    Discontinuity(String),

    /// A stored record failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Failures that indicate corrupted local state rather than an
    /// environmental problem. These are fatal to the conversation's
    /// local state and require resynchronization; they must never be
    /// retried or swallowed.
    #[must_use]
    pub const fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::RowCountMismatch { .. } | Self::Discontinuity(_) | Self::Corrupt(_)
        )
    }
}

/// Durable storage capability consumed by the conversation engine.
///
/// History invariant: for one conversation the stored idx values form
/// one contiguous range. [`append_history`](Self::append_history) must
/// verify the new idx abuts the stored range and fail with
/// [`StoreError::Discontinuity`] *before* writing anything; a
/// violation means storage corruption or a protocol bug and is never
/// repaired silently.
pub trait ChatStore: Send + Sync {
    /// Computes the [`ChatDbInfo`] summary for the conversation.
    fn load_history_info(&self) -> impl Future<Output = Result<ChatDbInfo, StoreError>> + Send;

    /// Appends one message at either end of the stored idx range.
    fn append_history(
        &self,
        idx: Idx,
        msg: &Message,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Rewrites the stored record of an existing entry (edits).
    fn update_history(
        &self,
        id: MessageId,
        msg: &Message,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes every entry strictly older than the given entry, which
    /// must be a truncation marker.
    fn truncate_history(
        &self,
        before: MessageId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetches up to `count` entries in descending idx order, starting
    /// at `from` inclusive (or at the newest entry when `None`).
    fn fetch_history(
        &self,
        from: Option<Idx>,
        count: usize,
    ) -> impl Future<Output = Result<Vec<(Idx, Message)>, StoreError>> + Send;

    /// The lowest stored idx, if any history is stored.
    fn oldest_stored_idx(&self) -> impl Future<Output = Result<Option<Idx>, StoreError>> + Send;

    /// Looks up the idx assigned to a message identity.
    fn idx_of(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<Option<Idx>, StoreError>> + Send;

    /// Counts stored entries from authors other than `me` with idx
    /// strictly greater than `after` (all of them when `None`).
    fn count_peer_messages_after(
        &self,
        me: UserId,
        after: Option<Idx>,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// The newest entry at or below `from` whose kind carries visible
    /// text and whose content is non-empty.
    fn last_text_message(
        &self,
        from: Idx,
    ) -> impl Future<Output = Result<Option<(Idx, Message)>, StoreError>> + Send;

    /// Persists a new outgoing item and assigns its durable row id.
    ///
    /// Called before any network attempt, so a crash after enqueue
    /// leaves the message recoverable as pending.
    fn enqueue_outgoing(
        &self,
        opcode: SendOpcode,
        msg: &Message,
    ) -> impl Future<Output = Result<RowId, StoreError>> + Send;

    /// Rewrites the message payload of a queued item (local edits of a
    /// still-pending message).
    fn update_outgoing_message(
        &self,
        rowid: RowId,
        msg: &Message,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Attaches serialized wire blobs produced by the encryption layer
    /// without changing the item's queue position.
    fn update_outgoing_wire(
        &self,
        rowid: RowId,
        wire: Option<&[u8]>,
        key_wire: Option<&[u8]>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Records the confirmed encryption key id for a queued item.
    fn update_outgoing_key(
        &self,
        rowid: RowId,
        key_id: KeyId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically rewrites an `UpdateProvisional` row to a plain
    /// `Update` carrying the server-confirmed identity.
    fn rewrite_provisional(
        &self,
        rowid: RowId,
        confirmed: MessageId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes a queue row. The row id is terminal afterwards; no
    /// further mutation of it is legal.
    fn delete_outgoing(
        &self,
        rowid: RowId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Loads the outgoing queue in ascending row-id order.
    fn load_outgoing_queue(
        &self,
    ) -> impl Future<Output = Result<Vec<SendingItem>, StoreError>> + Send;

    /// Atomically appends a confirmed message to history and removes
    /// its queue row: the commit boundary of one logical confirmation
    /// step. A crash can never leave the pair half-applied.
    fn confirm_to_history(
        &self,
        rowid: RowId,
        idx: Idx,
        msg: &Message,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically moves an outgoing item to the manual-send queue.
    fn demote_to_manual(
        &self,
        item: &SendingItem,
        reason: ManualSendReason,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Loads the manual-send queue in ascending row-id order.
    fn load_manual_queue(
        &self,
    ) -> impl Future<Output = Result<Vec<ManualSendItem>, StoreError>> + Send;

    /// Removes a manual-send row; reports whether it existed.
    fn delete_manual(
        &self,
        rowid: RowId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Updates the read watermark.
    fn set_last_seen(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Updates the delivery watermark.
    fn set_last_received(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Records that the full history back to the first message is
    /// stored locally.
    fn mark_have_all_history(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether the full history is stored locally.
    fn have_all_history(&self) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
