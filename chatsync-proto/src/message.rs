//! Message records and identities for the `ChatSync` engine.
//!
//! These are storage and engine types, not a wire format: the byte
//! encoding of protocol frames belongs to the transport layer. Every
//! type is serde-derived so stores can persist records as postcard
//! blobs (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a message within one conversation.
///
/// A message starts life with a locally minted provisional identity and
/// is rewritten to the server-assigned confirmed identity once the
/// remote authority acknowledges it. The two forms never compare equal,
/// so a lookup by a superseded provisional id cannot alias a confirmed
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Durable identity assigned by the remote authority.
    Confirmed(u64),
    /// Locally generated placeholder, not yet acknowledged.
    Provisional(u64),
}

impl MessageId {
    /// Mints a fresh provisional identity.
    ///
    /// Seeded from a UUIDv7 so provisional ids are time-ordered and do
    /// not collide across process restarts.
    #[must_use]
    pub fn new_provisional() -> Self {
        let (hi, _) = Uuid::now_v7().as_u64_pair();
        Self::Provisional(hi)
    }

    /// Whether this identity is still awaiting server confirmation.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    /// The raw 64-bit value, regardless of confirmation state.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        match self {
            Self::Confirmed(v) | Self::Provisional(v) => *v,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed(v) => write!(f, "msg:{v:016x}"),
            Self::Provisional(v) => write!(f, "xid:{v:016x}"),
        }
    }
}

/// Identifies a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(u64);

impl UserId {
    /// Creates a user identity from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{:x}", self.0)
    }
}

/// Reference to an encryption key held by the key-management layer.
///
/// The engine only tracks that a key id is pending or confirmed for an
/// outgoing item; it never sees key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(u32);

impl KeyId {
    /// Creates a key reference from its raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key:{:x}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Type tag of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ordinary user-authored text content.
    Text,
    /// User content carrying an attachment reference.
    Attachment,
    /// Membership change or other system-generated event.
    Membership,
    /// Marker left at the new oldest entry when the server truncates
    /// older history.
    Truncate,
}

impl MessageKind {
    /// Whether entries of this kind carry user-visible text content.
    #[must_use]
    pub const fn carries_text(self) -> bool {
        matches!(self, Self::Text | Self::Attachment)
    }
}

/// Back-references linking a message to earlier ones.
///
/// Opaque continuity hashes used by an upstream tamper-detection layer;
/// the engine stores and forwards them without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackRefs {
    /// Hash seed identifying this message to later back-references.
    pub seed: u64,
    /// Hashes of prior messages this one vouches for.
    pub refs: Vec<u64>,
}

/// A single chat message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity; provisional until the server confirms the message.
    pub id: MessageId,
    /// Author of the message.
    pub author: UserId,
    /// Creation time.
    pub ts: Timestamp,
    /// Revision counter, bumped on every accepted edit.
    pub updated: u16,
    /// Type tag.
    pub kind: MessageKind,
    /// Content blob; opaque to the engine.
    pub content: Vec<u8>,
    /// Encryption key reference, when one has been assigned.
    pub key_id: Option<KeyId>,
    /// Continuity back-references, when present.
    pub backrefs: Option<BackRefs>,
}

impl Message {
    /// Creates a new locally authored message with a provisional id.
    #[must_use]
    pub fn new_local(author: UserId, kind: MessageKind, content: Vec<u8>) -> Self {
        Self {
            id: MessageId::new_provisional(),
            author,
            ts: Timestamp::now(),
            updated: 0,
            kind,
            content,
            key_id: None,
            backrefs: None,
        }
    }

    /// Whether this message still carries a provisional identity.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    /// Bumps the revision counter for an edit, saturating at the top.
    pub fn bump_updated(&mut self) {
        self.updated = self.updated.saturating_add(1);
    }

    /// The content interpreted as UTF-8 text, if it is valid.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}
