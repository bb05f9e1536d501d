//! Outgoing-queue opcodes and manual-send classification.

use serde::{Deserialize, Serialize};

/// Durable row identifier in the outgoing or manual-send queue.
///
/// Assigned by the store at enqueue time, strictly increasing, never
/// reused. Queue order is ascending row id.
pub type RowId = u64;

/// Position in the contiguous history sequence of one conversation.
///
/// Newer entries get larger values; fetching older history extends the
/// range downward. Signed so the low end can grow below zero once the
/// initial window is older than the first locally stored entry.
pub type Idx = i64;

/// What an outgoing queue row asks the remote authority to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendOpcode {
    /// Post a new message.
    New,
    /// Edit a message the server already confirmed.
    Update,
    /// Edit a message whose confirmed identity is not yet known.
    ///
    /// Rewritten in place to [`Update`](Self::Update) once the original
    /// post confirms and the durable identity is learned.
    UpdateProvisional,
}

/// Why an outgoing item was demoted to manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualSendReason {
    /// No encryption key id could be attached for the recipients.
    NoKey,
    /// The edit window for the target message has passed.
    TooOld,
    /// The server rejected the operation outright.
    GeneralFailure,
    /// The automatic retry budget was exhausted.
    RetriesExhausted,
}

impl std::fmt::Display for ManualSendReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoKey => "no encryption key",
            Self::TooOld => "edit window passed",
            Self::GeneralFailure => "rejected by server",
            Self::RetriesExhausted => "retries exhausted",
        };
        f.write_str(s)
    }
}
