//! Scripted in-process chat service for tests.
//!
//! Stands in for the real transport-backed service: outcomes are
//! scripted per operation, transmissions are recorded for inspection,
//! and unscripted sends auto-confirm with a fresh server identity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use chatsync_proto::message::{Message, MessageId, Timestamp};

use super::{ChatService, SendReceipt, ServiceError, SyncDelta};

/// In-process [`ChatService`] with scripted outcomes.
#[derive(Debug, Default)]
pub struct ScriptedService {
    next_id: AtomicU64,
    send_attempts: AtomicU64,
    send_failures: Mutex<VecDeque<ServiceError>>,
    sync_outcomes: Mutex<VecDeque<Result<SyncDelta, ServiceError>>>,
    older_outcomes: Mutex<VecDeque<Result<Vec<Message>, ServiceError>>>,
    sync_requests: Mutex<Vec<(Option<MessageId>, usize)>>,
    sent_new: Mutex<Vec<Message>>,
    sent_updates: Mutex<Vec<Message>>,
}

impl ScriptedService {
    /// Creates a service whose auto-assigned confirmed ids start at
    /// `first_id`.
    #[must_use]
    pub fn new(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            ..Self::default()
        }
    }

    /// Queues a failure for the next transmission (new or update).
    pub fn queue_send_failure(&self, err: ServiceError) {
        self.send_failures.lock().push_back(err);
    }

    /// Queues `n` identical transmission failures.
    pub fn queue_send_failures(&self, n: usize, err: &ServiceError) {
        let mut failures = self.send_failures.lock();
        for _ in 0..n {
            failures.push_back(err.clone());
        }
    }

    /// Queues the outcome of the next `sync_history` call. Unscripted
    /// calls return an empty delta.
    pub fn queue_sync(&self, outcome: Result<SyncDelta, ServiceError>) {
        self.sync_outcomes.lock().push_back(outcome);
    }

    /// Queues the outcome of the next `fetch_older` call. Unscripted
    /// calls return an empty batch.
    pub fn queue_older(&self, outcome: Result<Vec<Message>, ServiceError>) {
        self.older_outcomes.lock().push_back(outcome);
    }

    /// Messages transmitted as new posts, in order.
    #[must_use]
    pub fn sent_new(&self) -> Vec<Message> {
        self.sent_new.lock().clone()
    }

    /// Messages transmitted as edits, in order.
    #[must_use]
    pub fn sent_updates(&self) -> Vec<Message> {
        self.sent_updates.lock().clone()
    }

    /// Total transmission attempts observed, failures included.
    #[must_use]
    pub fn send_attempts(&self) -> u64 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// The `(anchor, window)` arguments of each sync request received.
    #[must_use]
    pub fn sync_requests(&self) -> Vec<(Option<MessageId>, usize)> {
        self.sync_requests.lock().clone()
    }
}

impl ChatService for ScriptedService {
    async fn sync_history(
        &self,
        newest: Option<MessageId>,
        window: usize,
    ) -> Result<SyncDelta, ServiceError> {
        self.sync_requests.lock().push((newest, window));
        self.sync_outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(SyncDelta::default()))
    }

    async fn fetch_older(
        &self,
        _oldest: MessageId,
        _count: usize,
    ) -> Result<Vec<Message>, ServiceError> {
        self.older_outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_new(
        &self,
        msg: &Message,
        _wire: Option<&[u8]>,
    ) -> Result<SendReceipt, ServiceError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        self.sent_new.lock().push(msg.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt {
            id: MessageId::Confirmed(id),
            ts: Timestamp::now(),
        })
    }

    async fn send_update(&self, msg: &Message) -> Result<SendReceipt, ServiceError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_failures.lock().pop_front() {
            return Err(err);
        }
        self.sent_updates.lock().push(msg.clone());
        Ok(SendReceipt {
            id: msg.id,
            ts: Timestamp::now(),
        })
    }
}
