//! # ordo-protocol — request lifecycle and wire model
//!
//! The coordinate → acquire → deliver lifecycle of the ordo replication
//! middleware, the protocol message model and its codec, the token collector
//! for composite requests, the outstanding-request cache, and the narrow
//! contracts consumed from the transport, membership and election
//! collaborators.

pub mod collector;
pub mod messages;
pub mod observer;
pub mod ordering;
pub mod outstanding;
pub mod transport;
pub mod wire;

pub use collector::TokenCollector;
pub use messages::{
    AgreementMessage, ConsensusReport, ConsensusRequest, CoordinateReply, CoordinateRequest,
    DeliverMessage, Envelope, IndexedToken, Payload, PartitionReport, RequestHeader, RequestId,
    SessionDomainReport, SessionReport, TokenAssignment, View,
};
pub use observer::{FaultObserver, NoopObserver};
pub use ordering::{OperationHandler, OrderingProtocol};
pub use outstanding::{OutstandingRequests, PendingRequest};
pub use transport::{MembershipListener, SequencerDirectory, Transport};
pub use wire::{decode_envelope, encode_envelope};
