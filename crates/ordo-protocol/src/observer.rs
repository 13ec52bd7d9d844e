//! Seam between the ordering protocol and the fault-tolerance engine.
//!
//! The engine tracks every in-flight token: assigned ones on the sequencer,
//! executed ones on the requester. The protocol reports the lifecycle events
//! through this trait instead of depending on the engine crate.

use ordo_core::token::{NodeId, Token};

use crate::messages::TokenAssignment;

/// Lifecycle callbacks the fault-tolerance engine hooks into.
pub trait FaultObserver: Send + Sync {
    /// The local sequencer assigned tokens to `requester`.
    fn on_tokens_assigned(&self, requester: NodeId, assignment: &TokenAssignment);

    /// The requester received `token` from `sequencer`. Returns false when
    /// the issuing node is no longer the partition's sequencer, in which
    /// case the token must be rejected back into the waiting set.
    fn on_token_acquired(&self, sequencer: NodeId, operation: &str, token: &Token) -> bool;

    /// A dissemination for `requester` passed through this node; the
    /// sequencer among the receivers releases its assigned-token record.
    fn on_broadcast_observed(&self, requester: NodeId, assignment: &TokenAssignment);

    /// The requester finished executing its own request; its executed-token
    /// record is released.
    fn on_executed(&self, operation: &str, token: &Token);
}

/// Observer used when no fault-tolerance engine is wired in.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl FaultObserver for NoopObserver {
    fn on_tokens_assigned(&self, _requester: NodeId, _assignment: &TokenAssignment) {}

    fn on_token_acquired(&self, _sequencer: NodeId, _operation: &str, _token: &Token) -> bool {
        true
    }

    fn on_broadcast_observed(&self, _requester: NodeId, _assignment: &TokenAssignment) {}

    fn on_executed(&self, _operation: &str, _token: &Token) {}
}
