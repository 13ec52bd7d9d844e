//! Protocol messages.
//!
//! Every message travels inside an [`Envelope`] carrying the sender and the
//! request correlation id. The ordering protocol consumes
//! [`Payload::Coordinate`], [`Payload::CoordinateReply`] and
//! [`Payload::Deliver`]; the fault-tolerance engine consumes the consensus
//! and agreement payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ordo_core::token::{NodeId, PartitionId, SessionId, Token};

/// Correlation id of one request, minted at the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Mint a fresh correlation id.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A membership snapshot agreed by the external membership layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Monotonic view number
    pub id: u64,
    /// Members of the view
    pub members: Vec<NodeId>,
}

impl View {
    /// Create a view.
    pub fn new(id: u64, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }
}

/// Header describing the invoked operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Operation name
    pub operation: String,
    /// Session key for session-scoped operations
    pub session: Option<SessionId>,
    /// Node that originated the request
    pub requester: NodeId,
    /// Whether the request bypasses ordering entirely
    pub unordered: bool,
}

/// A token paired with the composite slot it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedToken {
    /// Index of the leaf operation within the composite plan
    pub index: usize,
    /// The assigned token
    pub token: Token,
}

/// Tokens assigned to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenAssignment {
    /// A simple operation's token
    Single(Token),
    /// Per-slot tokens of a composite operation
    Vector(Vec<IndexedToken>),
}

impl TokenAssignment {
    /// Iterate over the contained tokens.
    pub fn tokens(&self) -> Box<dyn Iterator<Item = &Token> + '_> {
        match self {
            TokenAssignment::Single(token) => Box::new(std::iter::once(token)),
            TokenAssignment::Vector(tokens) => Box::new(tokens.iter().map(|entry| &entry.token)),
        }
    }
}

/// Ask the sequencer to order a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateRequest {
    /// The request being ordered
    pub header: RequestHeader,
    /// For retransmission of a composite: only these slot indices
    pub retransmit_indices: Option<Vec<usize>>,
}

/// The sequencer's answer to a coordinate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateReply {
    /// Tokens assigned by the sequencer
    Assigned(TokenAssignment),
    /// The receiving node does not (or no longer) hold the sequencer role;
    /// the requester must re-resolve and retry
    NotSequencer,
}

/// Disseminate a fully tokened request for gated execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverMessage {
    /// The request being delivered
    pub header: RequestHeader,
    /// Assigned tokens; absent for unordered requests
    pub assignment: Option<TokenAssignment>,
    /// Operation payload
    pub args: Vec<u8>,
    /// Recorded result of a side-effecting operation, installed by replicas
    /// instead of re-executing
    pub result: Option<Vec<u8>>,
}

/// A candidate sequencer's request for executed-token state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    /// Partitions the candidate is collecting for
    pub partitions: Vec<PartitionId>,
}

/// One partition's worth of executed-token state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    /// The partition reported on
    pub partition: PartitionId,
    /// The reporter's expected token
    pub latest: Token,
    /// Executed tokens not previously proposed for consensus
    pub reported: Vec<Token>,
}

/// One session's worth of executed-token state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    /// The session reported on
    pub session: SessionId,
    /// The reporter's expected token for this session
    pub latest: Token,
    /// Executed tokens not previously proposed for consensus
    pub reported: Vec<Token>,
}

/// The session-scoped domain's worth of executed-token state.
///
/// Sent even when no session has anything to report, so the candidate can
/// still account for the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDomainReport {
    /// The session-scoped partition reported on
    pub partition: PartitionId,
    /// Per-session state
    pub sessions: Vec<SessionReport>,
}

/// A survivor's answer to a consensus request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusReport {
    /// Per-partition state
    pub partitions: Vec<PartitionReport>,
    /// State of the session-scoped domain, when one was requested
    pub session_domain: Option<SessionDomainReport>,
}

/// The agreed outcome of crash recovery, broadcast to every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementMessage {
    /// Partitions covered by the agreement; a receiver re-opens them even
    /// when the skip list is empty, and even when its own crash
    /// notification has not been processed yet
    pub partitions: Vec<PartitionId>,
    /// Tokens proven never globally assigned, to be skipped
    pub skips: Vec<Token>,
    /// Whether receivers must retransmit indeterminate requests to the
    /// agreement's sender (the new sequencer)
    pub triggers_retransmission: bool,
    /// View the agreement belongs to, for membership-layer synchrony
    pub view_id: Option<u64>,
}

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Requester → sequencer
    Coordinate(CoordinateRequest),
    /// Sequencer → requester
    CoordinateReply(CoordinateReply),
    /// Requester → everyone
    Deliver(DeliverMessage),
    /// Candidate sequencer → survivors
    ConsensusRequest(ConsensusRequest),
    /// Survivor → candidate sequencer
    ConsensusReport(ConsensusReport),
    /// Sequencer (old or newly agreed) → everyone
    Agreement(AgreementMessage),
}

/// The transported unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node
    pub sender: NodeId,
    /// Request correlation id
    pub request_id: RequestId,
    /// Message body
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload from `sender` under a fresh correlation id.
    pub fn new(sender: NodeId, payload: Payload) -> Self {
        Self {
            sender,
            request_id: RequestId::fresh(),
            payload,
        }
    }

    /// Wrap a payload continuing an existing correlation.
    pub fn correlated(sender: NodeId, request_id: RequestId, payload: Payload) -> Self {
        Self {
            sender,
            request_id,
            payload,
        }
    }
}
