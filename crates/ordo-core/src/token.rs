//! Ordering tokens.
//!
//! A [`Token`] is the unit of ordering handed out by a partition's sequencer.
//! `concurrentno` distinguishes three shapes:
//!
//! - `None` — a fully ordered token, delivered exactly at its `seqno`;
//! - `Some(-1)` — a member of the current concurrent batch, sharing `seqno`
//!   with the batch opener and deliverable once the opener has passed;
//! - `Some(k), k >= 0` — the token closing a batch of `k` members, accepted
//!   only after all `k` members have been observed.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel `concurrentno` marking a concurrent-batch member.
pub const BATCH_MEMBER: i32 = -1;

/// Identifier of a conflict domain (partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub i32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved partition id for the session-scoped conflict domain.
pub const SESSION_PARTITION: PartitionId = PartitionId(-1);

/// Identifier of a replica node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session key used by session-scoped partitions.
pub type SessionId = String;

/// Outcome of classifying two tokens of the same partition for gap
/// reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Succession {
    /// `next` immediately follows `prev` in the delivery order
    DirectSuccessor,
    /// `next` is a concurrent sibling of `prev` at the same seqno
    SameBatch,
    /// at least one token between `prev` and `next` is missing
    Gap,
}

/// The ordering unit assigned to one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    /// Position in the partition's total order
    pub seqno: i32,
    /// Batch shape marker, see module docs
    pub concurrentno: Option<i32>,
    /// Partition this token belongs to, when it needs routing
    pub partition: Option<PartitionId>,
    /// Session key for tokens of a session-scoped partition
    pub session: Option<SessionId>,
}

impl Token {
    /// Create a token with an explicit batch marker.
    pub fn new(seqno: i32, concurrentno: Option<i32>) -> Self {
        Self {
            seqno,
            concurrentno,
            partition: None,
            session: None,
        }
    }

    /// A fully ordered token.
    pub fn unbatched(seqno: i32) -> Self {
        Self::new(seqno, None)
    }

    /// A concurrent-batch member.
    pub fn member(seqno: i32) -> Self {
        Self::new(seqno, Some(BATCH_MEMBER))
    }

    /// The token closing a batch of `count` members.
    pub fn closing(seqno: i32, count: i32) -> Self {
        Self::new(seqno, Some(count))
    }

    /// Attach a partition id.
    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Attach a session key.
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Whether this token is a concurrent-batch member.
    pub fn is_batch_member(&self) -> bool {
        self.concurrentno == Some(BATCH_MEMBER)
    }

    /// The member count carried by a batch-closing token.
    pub fn closing_count(&self) -> Option<i32> {
        match self.concurrentno {
            Some(count) if count >= 0 => Some(count),
            _ => None,
        }
    }

    /// Equality in the ordering domain: seqno, session, and batch marker.
    ///
    /// The partition id is deliberately ignored; tokens are only ever
    /// compared within one partition's caches.
    pub fn is_equivalent(&self, other: &Token) -> bool {
        self.seqno == other.seqno
            && self.same_session(other)
            && self.concurrentno == other.concurrentno
    }

    /// Whether two tokens belong to the same session (both absent counts as
    /// the same).
    pub fn same_session(&self, other: &Token) -> bool {
        self.session == other.session
    }

    /// Ordering used by the merge and reconstruction logic: primary key
    /// `seqno`, ties broken by ranking a batch member after an unbatched or
    /// closing token at the same seqno (a member's batch is not yet closed).
    pub fn order_cmp(&self, other: &Token) -> Ordering {
        match self.seqno.cmp(&other.seqno) {
            Ordering::Equal => self.is_batch_member().cmp(&other.is_batch_member()),
            unequal => unequal,
        }
    }

    /// Classify `next` against `self` for gap reconstruction.
    ///
    /// `expected_batch` is the number of batch members observed since the
    /// last closed batch; a closing token is a direct successor only when
    /// its count matches it.
    pub fn succession(&self, next: &Token, expected_batch: i32) -> Succession {
        match next.concurrentno {
            None if self.seqno == next.seqno - 1 => Succession::DirectSuccessor,
            Some(count) if count == expected_batch && self.seqno == next.seqno - 1 => {
                Succession::DirectSuccessor
            }
            _ if self.seqno == next.seqno => Succession::SameBatch,
            _ => Succession::Gap,
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_cmp(other)
            .then_with(|| self.concurrentno.cmp(&other.concurrentno))
            .then_with(|| self.session.cmp(&other.session))
            .then_with(|| self.partition.cmp(&other.partition))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.concurrentno {
            Some(count) => write!(f, "(seqno {}, concurrentno {count})", self.seqno),
            None => write!(f, "(seqno {}, unbatched)", self.seqno),
        }
    }
}
