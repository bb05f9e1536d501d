//! In-memory [`ChatStore`] implementation.
//!
//! The reference store used by tests and by embedders that do not need
//! durability. Rows are kept as postcard blobs and decoded on load, so
//! reload paths exercise real (de)serialization the way a SQL store
//! would. Handles are cheap clones sharing one backing state; a
//! simulated restart constructs a second engine over a clone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use chatsync_proto::codec;
use chatsync_proto::command::{Idx, ManualSendReason, RowId, SendOpcode};
use chatsync_proto::message::{KeyId, Message, MessageId, MessageKind, UserId};

use super::{ChatDbInfo, ChatStore, StoreError};
use crate::queue::{ManualSendItem, SendState, SendingItem};

#[derive(Debug, Clone)]
struct HistoryRow {
    id: MessageId,
    author: UserId,
    kind: MessageKind,
    content_len: usize,
    blob: Vec<u8>,
}

#[derive(Debug, Clone)]
struct OutgoingRow {
    opcode: SendOpcode,
    msg_id: MessageId,
    blob: Vec<u8>,
    wire: Option<Vec<u8>>,
    key_wire: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct ManualRow {
    opcode: SendOpcode,
    blob: Vec<u8>,
    reason: ManualSendReason,
}

#[derive(Debug, Default)]
struct State {
    history: BTreeMap<Idx, HistoryRow>,
    ids: HashMap<MessageId, Idx>,
    outgoing: BTreeMap<RowId, OutgoingRow>,
    manual: BTreeMap<RowId, ManualRow>,
    next_rowid: RowId,
    last_seen: Option<MessageId>,
    last_received: Option<MessageId>,
    have_all_history: bool,
}

/// Shared-state in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode(msg: &Message) -> Result<Vec<u8>, StoreError> {
    codec::encode_message(msg).map_err(|e| StoreError::WriteFailed(e.to_string()))
}

fn decode(blob: &[u8]) -> Result<Message, StoreError> {
    codec::decode_message(blob).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn history_row(msg: &Message) -> Result<HistoryRow, StoreError> {
    Ok(HistoryRow {
        id: msg.id,
        author: msg.author,
        kind: msg.kind,
        content_len: msg.content.len(),
        blob: encode(msg)?,
    })
}

fn missing_row(op: &'static str) -> StoreError {
    StoreError::RowCountMismatch {
        op,
        expected: 1,
        actual: 0,
    }
}

// Insertion must abut one end of the stored range; anything else is a
// discontinuity and nothing is written.
fn check_adjacent(state: &State, idx: Idx, op: &'static str) -> Result<(), StoreError> {
    if let (Some((&low, _)), Some((&high, _))) =
        (state.history.first_key_value(), state.history.last_key_value())
        && idx != low - 1
        && idx != high + 1
    {
        return Err(StoreError::Discontinuity(format!(
            "{op}: idx {idx} is adjacent to neither end of stored history [{low}, {high}]"
        )));
    }
    Ok(())
}

fn insert_history(state: &mut State, idx: Idx, msg: &Message, op: &'static str) -> Result<(), StoreError> {
    check_adjacent(state, idx, op)?;
    if state.ids.contains_key(&msg.id) {
        return Err(StoreError::WriteFailed(format!(
            "{op}: duplicate message identity {}",
            msg.id
        )));
    }
    let row = history_row(msg)?;
    state.history.insert(idx, row);
    state.ids.insert(msg.id, idx);
    Ok(())
}

impl ChatStore for MemoryStore {
    async fn load_history_info(&self) -> Result<ChatDbInfo, StoreError> {
        let state = self.state.lock();
        let oldest = state.history.first_key_value().map(|(_, row)| row.id);
        let newest_entry = state.history.last_key_value();
        Ok(ChatDbInfo {
            oldest,
            newest: newest_entry.map(|(_, row)| row.id),
            newest_idx: newest_entry.map(|(&idx, _)| idx),
            last_seen: state.last_seen,
            last_received: state.last_received,
        })
    }

    async fn append_history(&self, idx: Idx, msg: &Message) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        insert_history(&mut state, idx, msg, "append_history")
    }

    async fn update_history(&self, id: MessageId, msg: &Message) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let Some(&idx) = state.ids.get(&id) else {
            return Err(missing_row("update_history"));
        };
        let row = history_row(msg)?;
        state.history.insert(idx, row);
        Ok(())
    }

    async fn truncate_history(&self, before: MessageId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let Some(&cut) = state.ids.get(&before) else {
            return Err(StoreError::NotFound(format!(
                "truncate_history: {before} does not exist"
            )));
        };
        let marker = state
            .history
            .get(&cut)
            .ok_or_else(|| missing_row("truncate_history"))?;
        if marker.kind != MessageKind::Truncate {
            return Err(StoreError::Corrupt(format!(
                "truncate_history: {before} is not a truncation marker"
            )));
        }
        let doomed: Vec<Idx> = state.history.range(..cut).map(|(&idx, _)| idx).collect();
        for idx in doomed {
            if let Some(row) = state.history.remove(&idx) {
                state.ids.remove(&row.id);
            }
        }
        Ok(())
    }

    async fn fetch_history(
        &self,
        from: Option<Idx>,
        count: usize,
    ) -> Result<Vec<(Idx, Message)>, StoreError> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let rows: Vec<(Idx, Vec<u8>)> = match from {
            Some(upper) => state
                .history
                .range(..=upper)
                .rev()
                .take(count)
                .map(|(&idx, row)| (idx, row.blob.clone()))
                .collect(),
            None => state
                .history
                .iter()
                .rev()
                .take(count)
                .map(|(&idx, row)| (idx, row.blob.clone()))
                .collect(),
        };
        drop(state);
        for (idx, blob) in rows {
            out.push((idx, decode(&blob)?));
        }
        Ok(out)
    }

    async fn oldest_stored_idx(&self) -> Result<Option<Idx>, StoreError> {
        Ok(self.state.lock().history.first_key_value().map(|(&idx, _)| idx))
    }

    async fn idx_of(&self, id: MessageId) -> Result<Option<Idx>, StoreError> {
        Ok(self.state.lock().ids.get(&id).copied())
    }

    async fn count_peer_messages_after(
        &self,
        me: UserId,
        after: Option<Idx>,
    ) -> Result<usize, StoreError> {
        let state = self.state.lock();
        let count = state
            .history
            .iter()
            .filter(|&(&idx, ref row)| row.author != me && after.is_none_or(|a| idx > a))
            .count();
        Ok(count)
    }

    async fn last_text_message(&self, from: Idx) -> Result<Option<(Idx, Message)>, StoreError> {
        let found = {
            let state = self.state.lock();
            state
                .history
                .range(..=from)
                .rev()
                .find(|(_, row)| row.kind.carries_text() && row.content_len > 0)
                .map(|(&idx, row)| (idx, row.blob.clone()))
        };
        match found {
            Some((idx, blob)) => Ok(Some((idx, decode(&blob)?))),
            None => Ok(None),
        }
    }

    async fn enqueue_outgoing(&self, opcode: SendOpcode, msg: &Message) -> Result<RowId, StoreError> {
        let blob = encode(msg)?;
        let mut state = self.state.lock();
        state.next_rowid += 1;
        let rowid = state.next_rowid;
        state.outgoing.insert(
            rowid,
            OutgoingRow {
                opcode,
                msg_id: msg.id,
                blob,
                wire: None,
                key_wire: None,
            },
        );
        Ok(rowid)
    }

    async fn update_outgoing_message(&self, rowid: RowId, msg: &Message) -> Result<(), StoreError> {
        let blob = encode(msg)?;
        let mut state = self.state.lock();
        let row = state
            .outgoing
            .get_mut(&rowid)
            .ok_or_else(|| missing_row("update_outgoing_message"))?;
        row.blob = blob;
        row.msg_id = msg.id;
        Ok(())
    }

    async fn update_outgoing_wire(
        &self,
        rowid: RowId,
        wire: Option<&[u8]>,
        key_wire: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let row = state
            .outgoing
            .get_mut(&rowid)
            .ok_or_else(|| missing_row("update_outgoing_wire"))?;
        row.wire = wire.map(<[u8]>::to_vec);
        row.key_wire = key_wire.map(<[u8]>::to_vec);
        Ok(())
    }

    async fn update_outgoing_key(&self, rowid: RowId, key_id: KeyId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let row = state
            .outgoing
            .get_mut(&rowid)
            .ok_or_else(|| missing_row("update_outgoing_key"))?;
        let mut msg = decode(&row.blob)?;
        msg.key_id = Some(key_id);
        row.blob = encode(&msg)?;
        Ok(())
    }

    async fn rewrite_provisional(&self, rowid: RowId, confirmed: MessageId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let row = state
            .outgoing
            .get_mut(&rowid)
            .filter(|row| row.opcode == SendOpcode::UpdateProvisional)
            .ok_or_else(|| missing_row("rewrite_provisional"))?;
        let mut msg = decode(&row.blob)?;
        msg.id = confirmed;
        row.blob = encode(&msg)?;
        row.opcode = SendOpcode::Update;
        row.msg_id = confirmed;
        Ok(())
    }

    async fn delete_outgoing(&self, rowid: RowId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .outgoing
            .remove(&rowid)
            .map(|_| ())
            .ok_or_else(|| missing_row("delete_outgoing"))
    }

    async fn load_outgoing_queue(&self) -> Result<Vec<SendingItem>, StoreError> {
        let rows: Vec<(RowId, OutgoingRow)> = {
            let state = self.state.lock();
            state
                .outgoing
                .iter()
                .map(|(&rowid, row)| (rowid, row.clone()))
                .collect()
        };
        let mut items = Vec::with_capacity(rows.len());
        for (rowid, row) in rows {
            items.push(SendingItem {
                rowid,
                opcode: row.opcode,
                msg: decode(&row.blob)?,
                wire: row.wire,
                key_wire: row.key_wire,
                state: SendState::Pending,
            });
        }
        Ok(items)
    }

    async fn confirm_to_history(&self, rowid: RowId, idx: Idx, msg: &Message) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.outgoing.contains_key(&rowid) {
            return Err(missing_row("confirm_to_history"));
        }
        insert_history(&mut state, idx, msg, "confirm_to_history")?;
        state.outgoing.remove(&rowid);
        Ok(())
    }

    async fn demote_to_manual(
        &self,
        item: &SendingItem,
        reason: ManualSendReason,
    ) -> Result<(), StoreError> {
        let blob = encode(&item.msg)?;
        let mut state = self.state.lock();
        if state.outgoing.remove(&item.rowid).is_none() {
            return Err(missing_row("demote_to_manual"));
        }
        state.manual.insert(
            item.rowid,
            ManualRow {
                opcode: item.opcode,
                blob,
                reason,
            },
        );
        Ok(())
    }

    async fn load_manual_queue(&self) -> Result<Vec<ManualSendItem>, StoreError> {
        let rows: Vec<(RowId, ManualRow)> = {
            let state = self.state.lock();
            state
                .manual
                .iter()
                .map(|(&rowid, row)| (rowid, row.clone()))
                .collect()
        };
        let mut items = Vec::with_capacity(rows.len());
        for (rowid, row) in rows {
            items.push(ManualSendItem {
                rowid,
                opcode: row.opcode,
                msg: decode(&row.blob)?,
                reason: row.reason,
            });
        }
        Ok(items)
    }

    async fn delete_manual(&self, rowid: RowId) -> Result<bool, StoreError> {
        Ok(self.state.lock().manual.remove(&rowid).is_some())
    }

    async fn set_last_seen(&self, id: MessageId) -> Result<(), StoreError> {
        self.state.lock().last_seen = Some(id);
        Ok(())
    }

    async fn set_last_received(&self, id: MessageId) -> Result<(), StoreError> {
        self.state.lock().last_received = Some(id);
        Ok(())
    }

    async fn mark_have_all_history(&self) -> Result<(), StoreError> {
        self.state.lock().have_all_history = true;
        Ok(())
    }

    async fn have_all_history(&self) -> Result<bool, StoreError> {
        Ok(self.state.lock().have_all_history)
    }
}
