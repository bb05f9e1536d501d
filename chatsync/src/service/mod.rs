//! Remote-authority seam for the conversation engine.
//!
//! Defines the [`ChatService`] trait the engine drives for every
//! network round trip. Implementations wrap the transport/session
//! layer (socket, TLS, authentication); the engine never talks to a
//! socket directly and never assumes a call succeeds on the first
//! attempt — every call goes through a retry controller.
//!
//! [`scripted::ScriptedService`] is the in-process implementation used
//! by unit and integration tests.

pub mod scripted;

use std::future::Future;

use chatsync_proto::message::{Message, MessageId, Timestamp};

/// Errors surfaced by the remote chat service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The connection dropped before the operation completed.
    #[error("connection lost")]
    ConnectionLost,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The service could not be reached.
    #[error("service unreachable: {0}")]
    Unreachable(String),

    /// The server authoritatively rejected the operation.
    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Whether retrying can help.
    ///
    /// Authoritative rejections cannot be retried away; everything else
    /// is a network-shaped failure worth another attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Server acknowledgement of a posted or edited message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// The durable identity the server assigned (or re-confirmed).
    pub id: MessageId,
    /// Server-side timestamp of the acknowledgement.
    pub ts: Timestamp,
}

/// Result of a history synchronization request.
#[derive(Debug, Clone, Default)]
pub struct SyncDelta {
    /// Messages newer than the client's anchor, oldest first.
    pub messages: Vec<Message>,
    /// Set when the server truncated history; the marker message
    /// becomes the new oldest retained entry.
    pub truncate: Option<Message>,
}

/// Async interface to the remote chat authority.
pub trait ChatService: Send + Sync {
    /// Fetch history newer than `newest`, or an initial window of up to
    /// `window` messages when the client has no local history.
    fn sync_history(
        &self,
        newest: Option<MessageId>,
        window: usize,
    ) -> impl Future<Output = Result<SyncDelta, ServiceError>> + Send;

    /// Fetch up to `count` messages older than `oldest`, newest first.
    ///
    /// A batch shorter than `count` means the server has no history
    /// older than the last returned message.
    fn fetch_older(
        &self,
        oldest: MessageId,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Message>, ServiceError>> + Send;

    /// Post a new message, with its encrypted wire blob when the
    /// encryption layer has produced one.
    fn send_new(
        &self,
        msg: &Message,
        wire: Option<&[u8]>,
    ) -> impl Future<Output = Result<SendReceipt, ServiceError>> + Send;

    /// Transmit an edit of an already confirmed message.
    fn send_update(
        &self,
        msg: &Message,
    ) -> impl Future<Output = Result<SendReceipt, ServiceError>> + Send;
}
