//! The ordering context: every partition and resolved operation of one node,
//! constructed once at startup and passed to the components that need
//! lookup. There is no global registry; whoever needs resolution holds an
//! `Arc<OrderingContext>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::{OrdoError, Result};
use crate::partition::{Partition, PartitionScope};
use crate::policy::CommutabilityPolicy;
use crate::service::{
    CompositeLeaf, CompositePlan, Operation, OperationKind, OperationSpec, OperationTarget,
    ResolvedKind,
};
use crate::session::SessionPartition;
use crate::token::{NodeId, PartitionId, Token};

/// A declared conflict domain, global or session-scoped.
#[derive(Debug, Clone)]
pub enum PartitionHandle {
    /// A global conflict domain
    Plain(Arc<Partition>),
    /// The session-scoped conflict domain
    Session(Arc<SessionPartition>),
}

impl PartitionHandle {
    /// The partition id.
    pub fn id(&self) -> PartitionId {
        match self {
            PartitionHandle::Plain(partition) => partition.id(),
            PartitionHandle::Session(partition) => partition.id(),
        }
    }

    /// The node currently authoritative for assignments.
    pub fn sequencer(&self) -> NodeId {
        match self {
            PartitionHandle::Plain(partition) => partition.sequencer(),
            PartitionHandle::Session(partition) => partition.sequencer(),
        }
    }

    /// Install a new sequencer.
    pub fn set_sequencer(&self, sequencer: NodeId) {
        match self {
            PartitionHandle::Plain(partition) => partition.set_sequencer(sequencer),
            PartitionHandle::Session(partition) => partition.set_sequencer(sequencer),
        }
    }

    /// Whether `node` currently holds the sequencer role.
    pub fn is_sequencer(&self, node: NodeId) -> bool {
        match self {
            PartitionHandle::Plain(partition) => partition.is_sequencer(node),
            PartitionHandle::Session(partition) => partition.is_sequencer(node),
        }
    }

    /// Install `new_sequencer` and refuse assignments until the skip
    /// agreement arrives. Returns the previous sequencer.
    pub fn suspend_requests(&self, new_sequencer: NodeId) -> NodeId {
        match self {
            PartitionHandle::Plain(partition) => partition.suspend_requests(new_sequencer),
            PartitionHandle::Session(partition) => partition.suspend_requests(new_sequencer),
        }
    }

    /// Accept assignment requests again.
    pub fn allow_requests(&self) {
        match self {
            PartitionHandle::Plain(partition) => partition.allow_requests(),
            PartitionHandle::Session(partition) => partition.allow_requests(),
        }
    }

    /// Whether assignment requests are currently accepted.
    pub fn is_accepting_requests(&self) -> bool {
        match self {
            PartitionHandle::Plain(partition) => partition.is_accepting_requests(),
            PartitionHandle::Session(partition) => partition.is_accepting_requests(),
        }
    }

    /// Queue a skip token, routed by its session key where relevant.
    pub fn add_skip(&self, token: Token) {
        match self {
            PartitionHandle::Plain(partition) => partition.add_skip(token),
            PartitionHandle::Session(partition) => partition.add_skip(token),
        }
    }

    /// Wake every delivery suspended on this domain.
    pub fn trigger_all(&self) {
        match self {
            PartitionHandle::Plain(partition) => partition.trigger(),
            PartitionHandle::Session(partition) => partition.trigger_all(),
        }
    }

    /// Open a consensus collection expecting reports from `reporters`.
    pub fn begin_collection(&self, reporters: impl IntoIterator<Item = NodeId>) {
        match self {
            PartitionHandle::Plain(partition) => partition.begin_collection(reporters),
            PartitionHandle::Session(partition) => partition.begin_collection(reporters),
        }
    }

    /// Record that `reporter` has answered (or crashed).
    pub fn note_reporter(&self, reporter: NodeId) -> bool {
        match self {
            PartitionHandle::Plain(partition) => partition.note_reporter(reporter),
            PartitionHandle::Session(partition) => partition.note_reporter(reporter),
        }
    }

    /// Whether every expected survivor has reported.
    pub fn collection_finished(&self) -> bool {
        match self {
            PartitionHandle::Plain(partition) => partition.collection_finished(),
            PartitionHandle::Session(partition) => partition.collection_finished(),
        }
    }

    /// Reconstruct the skip list from collected reports.
    pub fn extract_skips(&self) -> Vec<Token> {
        match self {
            PartitionHandle::Plain(partition) => partition.extract_skips(),
            PartitionHandle::Session(partition) => partition.extract_skips(),
        }
    }
}

/// Constructed-once lookup context for one node.
#[derive(Debug)]
pub struct OrderingContext {
    policy: Arc<CommutabilityPolicy>,
    partitions: HashMap<PartitionId, PartitionHandle>,
    operations: HashMap<String, Arc<Operation>>,
}

impl OrderingContext {
    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The commutability policy shared by every partition.
    pub fn policy(&self) -> &Arc<CommutabilityPolicy> {
        &self.policy
    }

    /// Resolve an operation by name.
    pub fn operation(&self, name: &str) -> Result<Arc<Operation>> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| OrdoError::UnknownOperation {
                name: name.to_owned(),
            })
    }

    /// Resolve a partition by id.
    pub fn partition(&self, id: PartitionId) -> Result<PartitionHandle> {
        self.partitions
            .get(&id)
            .cloned()
            .ok_or(OrdoError::UnknownPartition { partition: id })
    }

    /// Iterate over every declared partition.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionHandle> {
        self.partitions.values()
    }

    /// Iterate over every resolved operation.
    pub fn operations(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.operations.values()
    }

    /// The partitions a given node is currently sequencer for.
    pub fn partitions_sequenced_by(&self, node: NodeId) -> Vec<PartitionId> {
        self.partitions
            .values()
            .filter(|handle| handle.is_sequencer(node))
            .map(PartitionHandle::id)
            .collect()
    }
}

/// Builder validating the deployment description into an [`OrderingContext`].
#[derive(Default)]
pub struct ContextBuilder {
    default_tolerance: u32,
    partitions: Vec<(PartitionId, PartitionScope, NodeId)>,
    operations: Vec<OperationSpec>,
    pairs: Vec<(String, String, u32)>,
}

impl ContextBuilder {
    /// Default tolerance for commutable pairs declared without one.
    pub fn default_tolerance(mut self, tolerance: u32) -> Self {
        self.default_tolerance = tolerance;
        self
    }

    /// Declare a conflict domain.
    pub fn partition(mut self, id: PartitionId, scope: PartitionScope, sequencer: NodeId) -> Self {
        self.partitions.push((id, scope, sequencer));
        self
    }

    /// Declare an operation.
    pub fn operation(mut self, spec: OperationSpec) -> Self {
        self.operations.push(spec);
        self
    }

    /// Declare an interfering operation pair with a tolerance window.
    pub fn interfering_pair(
        mut self,
        a: impl Into<String>,
        b: impl Into<String>,
        tolerance: u32,
    ) -> Self {
        self.pairs.push((a.into(), b.into(), tolerance));
        self
    }

    /// Validate and construct the context.
    pub fn build(self) -> Result<OrderingContext> {
        let policy = Arc::new(CommutabilityPolicy::new(self.default_tolerance));
        for (a, b, tolerance) in &self.pairs {
            policy.declare_pair_with_tolerance(a, b, *tolerance);
        }

        let mut partitions: HashMap<PartitionId, PartitionHandle> = HashMap::new();
        for (id, scope, sequencer) in self.partitions {
            let handle = match scope {
                PartitionScope::SessionOrdered => PartitionHandle::Session(Arc::new(
                    SessionPartition::new(id, sequencer, policy.clone()),
                )),
                scope => PartitionHandle::Plain(Arc::new(Partition::new(
                    id,
                    scope,
                    sequencer,
                    policy.clone(),
                ))),
            };
            if partitions.insert(id, handle).is_some() {
                return Err(OrdoError::configuration(format!(
                    "partition {id} declared twice"
                )));
            }
        }

        let specs: HashMap<String, OperationSpec> = {
            let mut map = HashMap::new();
            for spec in self.operations {
                if map.insert(spec.name.clone(), spec.clone()).is_some() {
                    return Err(OrdoError::configuration(format!(
                        "operation {} declared twice",
                        spec.name
                    )));
                }
            }
            map
        };

        let mut operations: HashMap<String, Arc<Operation>> = HashMap::new();

        // leaves first, then composites flattened over them
        for spec in specs.values() {
            if matches!(spec.kind, OperationKind::Composite { .. }) {
                continue;
            }
            let partition_id = spec.partition.ok_or_else(|| {
                OrdoError::configuration(format!("operation {} has no partition", spec.name))
            })?;
            let handle =
                partitions
                    .get(&partition_id)
                    .ok_or_else(|| OrdoError::UnknownPartition {
                        partition: partition_id,
                    })?;

            let target = match handle {
                PartitionHandle::Plain(partition) => {
                    if spec.requires_ordering && !partition.requires_gating() {
                        return Err(OrdoError::configuration(format!(
                            "operation {} requires ordering but partition {partition_id} is unordered",
                            spec.name
                        )));
                    }
                    OperationTarget::Global(partition.clone())
                }
                PartitionHandle::Session(partition) => OperationTarget::Session(partition.clone()),
            };
            let kind = match spec.kind {
                OperationKind::SideEffecting => ResolvedKind::SideEffecting,
                _ => ResolvedKind::Simple,
            };
            operations.insert(
                spec.name.clone(),
                Arc::new(Operation::new(
                    spec.name.clone(),
                    kind,
                    Some(target),
                    spec.requires_ordering,
                    spec.is_idempotent,
                )),
            );
        }

        for spec in specs.values() {
            let OperationKind::Composite { .. } = &spec.kind else {
                continue;
            };
            let mut visited = HashSet::new();
            let mut leaves = Vec::new();
            flatten_composite(&spec.name, &specs, &mut visited, &mut leaves)?;

            let mut involved = Vec::new();
            let mut needs_session = false;
            let mut ordered_count = 0;
            for leaf in &leaves {
                if leaf.ordered {
                    ordered_count += 1;
                }
                if !involved.contains(&leaf.partition) {
                    involved.push(leaf.partition);
                }
                if let Some(PartitionHandle::Session(_)) = partitions.get(&leaf.partition) {
                    needs_session = true;
                }
            }
            tracing::debug!(
                operation = %spec.name,
                leaves = leaves.len(),
                ordered = ordered_count,
                "flattened composite operation"
            );
            operations.insert(
                spec.name.clone(),
                Arc::new(Operation::new(
                    spec.name.clone(),
                    ResolvedKind::Composite(CompositePlan {
                        leaves,
                        ordered_count,
                        involved,
                        needs_session,
                    }),
                    None,
                    spec.requires_ordering,
                    spec.is_idempotent,
                )),
            );
        }

        Ok(OrderingContext {
            policy,
            partitions,
            operations,
        })
    }
}

/// Depth-first flattening of a composite into leaf operations, rejecting
/// cyclic references.
fn flatten_composite(
    name: &str,
    specs: &HashMap<String, OperationSpec>,
    visited: &mut HashSet<String>,
    leaves: &mut Vec<CompositeLeaf>,
) -> Result<()> {
    if !visited.insert(name.to_owned()) {
        return Err(OrdoError::configuration(format!(
            "cyclic composite reference through {name}"
        )));
    }
    let spec = specs.get(name).ok_or_else(|| OrdoError::UnknownOperation {
        name: name.to_owned(),
    })?;
    match &spec.kind {
        OperationKind::Composite { children } => {
            for child in children {
                flatten_composite(child, specs, visited, leaves)?;
            }
        }
        _ => {
            let partition = spec.partition.ok_or_else(|| {
                OrdoError::configuration(format!("operation {name} has no partition"))
            })?;
            leaves.push(CompositeLeaf {
                name: name.to_owned(),
                ordered: spec.requires_ordering,
                partition,
            });
        }
    }
    visited.remove(name);
    Ok(())
}
