//! Replicated operation model.
//!
//! Operations are a tagged variant rather than a class hierarchy: a
//! [`Simple`](OperationKind::Simple) operation is an independently replicable
//! unit bound to one partition; a [`Composite`](OperationKind::Composite)
//! operation is a program-ordered workflow over other operations, flattened
//! to its leaves once at registry-build time; a
//! [`SideEffecting`](OperationKind::SideEffecting) operation cannot be
//! re-executed deterministically on replicas, so only its recorded result is
//! replicated.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::partition::{GateOutcome, Partition};
use crate::session::SessionPartition;
use crate::token::{NodeId, PartitionId, Token};

/// Declarative shape of an operation, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Independently replicable operation
    Simple,
    /// Program-ordered workflow over named child operations
    Composite {
        /// Child operation names in program order
        children: Vec<String>,
    },
    /// Non-deterministic or externally visible operation; replicas install
    /// its recorded result instead of re-executing
    SideEffecting,
}

/// Configured description of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Unique operation name
    pub name: String,
    /// Operation shape
    pub kind: OperationKind,
    /// Partition binding; required for leaf operations, absent for composites
    pub partition: Option<PartitionId>,
    /// Whether invocations must flow through the ordering protocol
    pub requires_ordering: bool,
    /// Whether re-execution is harmless
    pub is_idempotent: bool,
}

impl OperationSpec {
    /// A simple ordered operation bound to `partition`.
    pub fn simple(name: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Simple,
            partition: Some(partition),
            requires_ordering: true,
            is_idempotent: false,
        }
    }

    /// A simple unordered operation bound to `partition`.
    pub fn unordered(name: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Simple,
            partition: Some(partition),
            requires_ordering: false,
            is_idempotent: true,
        }
    }

    /// A side-effecting operation bound to `partition`.
    pub fn side_effecting(name: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::SideEffecting,
            partition: Some(partition),
            requires_ordering: true,
            is_idempotent: false,
        }
    }

    /// A composite operation over `children`, in program order.
    pub fn composite(
        name: impl Into<String>,
        children: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Composite {
                children: children.into_iter().map(Into::into).collect(),
            },
            partition: None,
            requires_ordering: true,
            is_idempotent: false,
        }
    }
}

/// The ordering domain a leaf operation is bound to.
#[derive(Debug, Clone)]
pub enum OperationTarget {
    /// A global conflict domain
    Global(Arc<Partition>),
    /// The session-scoped conflict domain
    Session(Arc<SessionPartition>),
}

impl OperationTarget {
    /// The partition id of the bound domain.
    pub fn partition_id(&self) -> PartitionId {
        match self {
            OperationTarget::Global(partition) => partition.id(),
            OperationTarget::Session(partition) => partition.id(),
        }
    }
}

/// One flattened leaf of a composite plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeLeaf {
    /// Leaf operation name
    pub name: String,
    /// Whether the leaf flows through the ordering protocol
    pub ordered: bool,
    /// Partition the leaf is bound to
    pub partition: PartitionId,
}

/// The one-time flattening of a composite operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositePlan {
    /// Leaf operations in program order
    pub leaves: Vec<CompositeLeaf>,
    /// Number of leaves that require a token
    pub ordered_count: usize,
    /// Distinct partitions the leaves touch
    pub involved: Vec<PartitionId>,
    /// Whether any leaf is session-scoped
    pub needs_session: bool,
}

/// Resolved shape of an operation.
#[derive(Debug)]
pub enum ResolvedKind {
    /// Leaf operation, replicated by re-execution
    Simple,
    /// Leaf operation whose result, not execution, is replicated
    SideEffecting,
    /// Flattened composite workflow
    Composite(CompositePlan),
}

/// A fully resolved operation, bound to its ordering domain.
pub struct Operation {
    name: String,
    kind: ResolvedKind,
    target: Option<OperationTarget>,
    requires_ordering: bool,
    is_idempotent: bool,
}

impl Operation {
    pub(crate) fn new(
        name: String,
        kind: ResolvedKind,
        target: Option<OperationTarget>,
        requires_ordering: bool,
        is_idempotent: bool,
    ) -> Self {
        Self {
            name,
            kind,
            target,
            requires_ordering,
            is_idempotent,
        }
    }

    /// The operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved shape.
    pub fn kind(&self) -> &ResolvedKind {
        &self.kind
    }

    /// The flattened plan, for composites.
    pub fn composite(&self) -> Option<&CompositePlan> {
        match &self.kind {
            ResolvedKind::Composite(plan) => Some(plan),
            _ => None,
        }
    }

    /// Whether replicas install the recorded result instead of re-executing.
    pub fn is_side_effecting(&self) -> bool {
        matches!(self.kind, ResolvedKind::SideEffecting)
    }

    /// Whether invocations flow through the ordering protocol.
    pub fn requires_ordering(&self) -> bool {
        match &self.kind {
            ResolvedKind::Composite(plan) => plan.ordered_count > 0,
            _ => self.requires_ordering,
        }
    }

    /// Whether re-execution is harmless.
    pub fn is_idempotent(&self) -> bool {
        self.is_idempotent
    }

    /// Whether the operation is bound to the session-scoped domain.
    pub fn is_sessional(&self) -> bool {
        match &self.kind {
            ResolvedKind::Composite(plan) => plan.needs_session,
            _ => matches!(self.target, Some(OperationTarget::Session(_))),
        }
    }

    /// The ordering domain of a leaf operation.
    pub fn target(&self) -> Option<&OperationTarget> {
        self.target.as_ref()
    }

    /// The partition id of a leaf operation.
    pub fn partition_id(&self) -> Option<PartitionId> {
        self.target.as_ref().map(OperationTarget::partition_id)
    }

    /// Resolve the sequencer for an outgoing request, or `None` while the
    /// bound partition is suspended for recovery.
    pub fn sequencer_for_request(&self) -> Option<NodeId> {
        match self.target.as_ref()? {
            OperationTarget::Global(partition) => partition.sequencer_for_request(),
            OperationTarget::Session(partition) => partition.sequencer_for_request(),
        }
    }

    /// Whether `node` is the sequencer of the bound partition.
    pub fn is_sequencer(&self, node: NodeId) -> bool {
        match self.target.as_ref() {
            Some(OperationTarget::Global(partition)) => partition.is_sequencer(node),
            Some(OperationTarget::Session(partition)) => partition.is_sequencer(node),
            None => false,
        }
    }

    /// Assign the next token for this leaf operation.
    pub fn next_token(&self, session: Option<&str>, caller: NodeId) -> Option<Token> {
        match self.target.as_ref()? {
            OperationTarget::Global(partition) => partition.next_token(&self.name, caller),
            OperationTarget::Session(partition) => {
                partition.next_token(session?, &self.name, caller)
            }
        }
    }

    /// Gate `token` and run `execute` at its slot in the bound domain.
    pub fn deliver_gated<R>(
        &self,
        session: Option<&str>,
        token: &Token,
        execute: impl FnOnce() -> R,
    ) -> GateOutcome<R> {
        match self.target.as_ref() {
            Some(OperationTarget::Global(partition)) => partition.deliver_gated(token, execute),
            Some(OperationTarget::Session(partition)) => match session {
                Some(session) => partition.deliver_gated(session, token, execute),
                None => {
                    tracing::warn!(
                        operation = %self.name,
                        "session-scoped delivery without session key, discarding"
                    );
                    GateOutcome::Discarded
                }
            },
            None => GateOutcome::Delivered(execute()),
        }
    }

    /// Whether gating `token` right now would have to wait.
    pub fn would_block(&self, session: Option<&str>, token: &Token) -> bool {
        match self.target.as_ref() {
            Some(OperationTarget::Global(partition)) => partition.would_block(token),
            Some(OperationTarget::Session(partition)) => match session {
                Some(session) => partition.would_block(session, token),
                None => false,
            },
            None => false,
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("partition", &self.partition_id())
            .field("requires_ordering", &self.requires_ordering())
            .field("is_idempotent", &self.is_idempotent)
            .finish()
    }
}
