//! Contiguous ordered index over one conversation's history.
//!
//! [`HistoryIndex`] owns the in-memory window of confirmed messages
//! and the idx bookkeeping for it. Idx values are dense and monotonic:
//! entries are only ever appended at the high end (new confirmations)
//! or the low end (older history fetched from storage or the server).
//! Any operation that would create a gap fails with
//! [`HistoryError::Discontinuity`] and leaves the index untouched —
//! a gap means storage corruption or a protocol bug and must surface,
//! not be repaired silently.

use std::collections::{HashMap, VecDeque};

use chatsync_proto::command::Idx;
use chatsync_proto::message::{Message, MessageId};

/// Errors raised by index mutations and queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The message identity is already present in the index.
    #[error("duplicate message identity {0}")]
    DuplicateId(MessageId),

    /// A mutation would break the contiguous idx sequence.
    #[error("history discontinuity: expected idx {expected}, got {actual}")]
    Discontinuity {
        /// The idx the sequence requires next.
        expected: Idx,
        /// The idx that was supplied.
        actual: Idx,
    },

    /// The referenced message is not in the loaded window.
    #[error("message {0} not present in history")]
    UnknownMessage(MessageId),
}

/// In-memory window of one conversation's history, contiguous in idx
/// space, with identity lookup.
#[derive(Debug, Default)]
pub struct HistoryIndex {
    /// Messages ordered oldest-first; `window[i]` has idx
    /// `oldest_idx + i`.
    window: VecDeque<Message>,
    /// Idx of the front of the window; meaningless while empty.
    oldest_idx: Idx,
    by_id: HashMap<MessageId, Idx>,
}

impl HistoryIndex {
    /// Creates an empty index. The first appended entry gets idx 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the window from storage with entries in ascending idx
    /// order.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Discontinuity`] if the entries are not dense and
    /// ascending, [`HistoryError::DuplicateId`] on a repeated identity.
    /// The index is left empty on failure.
    pub fn seed(&mut self, entries: Vec<(Idx, Message)>) -> Result<(), HistoryError> {
        self.window.clear();
        self.by_id.clear();
        let Some((first_idx, _)) = entries.first() else {
            return Ok(());
        };
        let mut expected = *first_idx;
        for (idx, msg) in &entries {
            if *idx != expected {
                let err = HistoryError::Discontinuity {
                    expected,
                    actual: *idx,
                };
                self.window.clear();
                self.by_id.clear();
                return Err(err);
            }
            if self.by_id.insert(msg.id, *idx).is_some() {
                let err = HistoryError::DuplicateId(msg.id);
                self.window.clear();
                self.by_id.clear();
                return Err(err);
            }
            expected += 1;
        }
        self.oldest_idx = *first_idx;
        self.window = entries.into_iter().map(|(_, m)| m).collect();
        self.assert_consistent();
        Ok(())
    }

    /// Number of messages in the loaded window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether the loaded window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Idx of the oldest loaded entry.
    #[must_use]
    pub fn oldest_idx(&self) -> Option<Idx> {
        (!self.window.is_empty()).then_some(self.oldest_idx)
    }

    /// Idx of the newest loaded entry.
    #[must_use]
    pub fn newest_idx(&self) -> Option<Idx> {
        let len = Idx::try_from(self.window.len()).ok()?;
        (!self.window.is_empty()).then(|| self.oldest_idx + len - 1)
    }

    /// The message at `idx`, if loaded.
    #[must_use]
    pub fn get(&self, idx: Idx) -> Option<&Message> {
        let offset = usize::try_from(idx.checked_sub(self.oldest_idx)?).ok()?;
        self.window.get(offset)
    }

    /// The idx assigned to a message identity, if loaded.
    #[must_use]
    pub fn idx_of(&self, id: MessageId) -> Option<Idx> {
        self.by_id.get(&id).copied()
    }

    /// Whether the identity is present in the loaded window.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Appends a newly confirmed message at the high end and returns
    /// the idx it was assigned.
    ///
    /// # Errors
    ///
    /// [`HistoryError::DuplicateId`] if the identity is already
    /// indexed; the index is unchanged.
    pub fn extend_newest(&mut self, msg: Message) -> Result<Idx, HistoryError> {
        if self.by_id.contains_key(&msg.id) {
            return Err(HistoryError::DuplicateId(msg.id));
        }
        let idx = self.newest_idx().map_or(0, |n| n + 1);
        if self.window.is_empty() {
            self.oldest_idx = idx;
        }
        self.by_id.insert(msg.id, idx);
        self.window.push_back(msg);
        self.assert_consistent();
        Ok(idx)
    }

    /// Prepends a batch of older history, given newest-first in
    /// strictly decreasing idx order.
    ///
    /// The whole batch is validated before anything is mutated: it must
    /// be dense, must abut the current oldest idx, and must not repeat
    /// an indexed identity.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Discontinuity`] or [`HistoryError::DuplicateId`];
    /// the index is unchanged on failure.
    pub fn extend_oldest(&mut self, batch: Vec<(Idx, Message)>) -> Result<(), HistoryError> {
        let mut expected = self.oldest_idx().map(|o| o - 1);
        for (idx, msg) in &batch {
            if let Some(e) = expected
                && *idx != e
            {
                return Err(HistoryError::Discontinuity {
                    expected: e,
                    actual: *idx,
                });
            }
            if self.by_id.contains_key(&msg.id) {
                return Err(HistoryError::DuplicateId(msg.id));
            }
            expected = Some(*idx - 1);
        }
        // Batch ids must also be unique among themselves.
        let mut seen = HashMap::new();
        for (idx, msg) in &batch {
            if seen.insert(msg.id, *idx).is_some() {
                return Err(HistoryError::DuplicateId(msg.id));
            }
        }
        for (idx, msg) in batch {
            self.by_id.insert(msg.id, idx);
            self.window.push_front(msg);
            self.oldest_idx = idx;
        }
        self.assert_consistent();
        Ok(())
    }

    /// Replaces the stored record of an already indexed message (edit
    /// confirmations). The identity and idx are preserved.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownMessage`] if the identity is not loaded.
    pub fn replace(&mut self, id: MessageId, msg: Message) -> Result<(), HistoryError> {
        let idx = self
            .by_id
            .get(&id)
            .copied()
            .ok_or(HistoryError::UnknownMessage(id))?;
        let offset = usize::try_from(idx - self.oldest_idx)
            .map_err(|_| HistoryError::UnknownMessage(id))?;
        let Some(slot) = self.window.get_mut(offset) else {
            return Err(HistoryError::UnknownMessage(id));
        };
        *slot = msg;
        Ok(())
    }

    /// Drops every loaded entry strictly older than the given message
    /// (the server's truncation point). Returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownMessage`] if the identity is not loaded;
    /// the index is unchanged.
    pub fn truncate_before(&mut self, id: MessageId) -> Result<usize, HistoryError> {
        let cut = self
            .by_id
            .get(&id)
            .copied()
            .ok_or(HistoryError::UnknownMessage(id))?;
        let mut removed = 0;
        while self.oldest_idx < cut {
            if let Some(old) = self.window.pop_front() {
                self.by_id.remove(&old.id);
                removed += 1;
            }
            self.oldest_idx += 1;
        }
        self.assert_consistent();
        Ok(removed)
    }

    /// The newest loaded message at or before `before` whose kind
    /// carries visible text and whose content is non-empty.
    #[must_use]
    pub fn last_text_message(&self, before: Idx) -> Option<(Idx, &Message)> {
        let newest = self.newest_idx()?;
        let mut idx = newest.min(before);
        while idx >= self.oldest_idx {
            if let Some(msg) = self.get(idx)
                && msg.kind.carries_text()
                && !msg.content.is_empty()
            {
                return Some((idx, msg));
            }
            idx -= 1;
        }
        None
    }

    /// Iterates the loaded window oldest-first with assigned idx values.
    pub fn iter(&self) -> impl Iterator<Item = (Idx, &Message)> {
        self.window
            .iter()
            .enumerate()
            .map(|(i, m)| (self.oldest_idx + i as Idx, m))
    }

    // Density invariant re-check after every mutation, debug builds only.
    fn assert_consistent(&self) {
        debug_assert_eq!(self.by_id.len(), self.window.len());
        #[cfg(debug_assertions)]
        for (i, msg) in self.window.iter().enumerate() {
            debug_assert_eq!(self.by_id.get(&msg.id), Some(&(self.oldest_idx + i as Idx)));
        }
    }
}
