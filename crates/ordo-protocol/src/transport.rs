//! Contracts consumed from the transport and membership collaborators.
//!
//! The transport must preserve FIFO order from any single sender to any
//! single receiver; no ordering across senders is assumed. Multicast must
//! loop back to the sender. View changes are agreed and ordered by the
//! external membership layer before they reach [`MembershipListener`].

use async_trait::async_trait;

use ordo_core::errors::Result;
use ordo_core::registry::OrderingContext;
use ordo_core::token::{NodeId, PartitionId};

use crate::messages::{Envelope, View};

/// Reliable FIFO point-to-point and group transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to one node.
    async fn unicast(&self, target: NodeId, envelope: Envelope) -> Result<()>;

    /// Send to every node in the current view, including the sender.
    async fn multicast(&self, envelope: Envelope) -> Result<()>;
}

/// Membership callbacks driven by the external view service.
pub trait MembershipListener: Send + Sync {
    /// A node joined the group.
    fn on_node_join(&self, node: NodeId);

    /// A node crashed; `surviving` is the agreed view without it.
    fn on_node_crash(&self, node: NodeId, surviving: &View);
}

/// Sequencer lookup, consumed from the election layer.
pub trait SequencerDirectory: Send + Sync {
    /// The node currently authoritative for `partition`, if known.
    fn current_sequencer(&self, partition: PartitionId) -> Option<NodeId>;

    /// Whether `node` is the sequencer of `partition`.
    fn is_sequencer(&self, node: NodeId, partition: PartitionId) -> bool;
}

impl SequencerDirectory for OrderingContext {
    fn current_sequencer(&self, partition: PartitionId) -> Option<NodeId> {
        self.partition(partition).ok().map(|handle| handle.sequencer())
    }

    fn is_sequencer(&self, node: NodeId, partition: PartitionId) -> bool {
        self.partition(partition)
            .map(|handle| handle.is_sequencer(node))
            .unwrap_or(false)
    }
}
