//! Node configuration.
//!
//! The deployment description — partitions, operations, interfering pairs —
//! is plain data loaded from TOML and turned into an
//! [`OrderingContext`](crate::registry::OrderingContext) by the composition
//! root.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{OrdoError, Result};
use crate::partition::PartitionScope;
use crate::registry::{ContextBuilder, OrderingContext};
use crate::service::{OperationKind, OperationSpec};
use crate::token::{NodeId, PartitionId};

/// Commutability defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommutabilityConfig {
    /// Tolerance applied to pairs declared without an explicit one
    pub default_tolerance: u32,
}

impl Default for CommutabilityConfig {
    fn default() -> Self {
        Self {
            default_tolerance: 3,
        }
    }
}

/// Session sub-partition lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle seconds after which a session sub-partition may be evicted
    pub max_idle_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 3600,
        }
    }
}

impl SessionConfig {
    /// The idle window as a [`Duration`].
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// One declared conflict domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Unique partition id
    pub id: i32,
    /// Consistency scope
    pub scope: PartitionScope,
    /// Initial sequencer node
    pub sequencer: u32,
}

/// One declared operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Unique operation name
    pub name: String,
    /// Operation shape
    #[serde(default = "OperationConfig::default_kind")]
    pub kind: OperationShape,
    /// Partition binding for leaf operations
    #[serde(default)]
    pub partition: Option<i32>,
    /// Child operations for composites, in program order
    #[serde(default)]
    pub children: Vec<String>,
    /// Whether invocations flow through the ordering protocol
    #[serde(default = "OperationConfig::default_ordered")]
    pub ordered: bool,
    /// Whether re-execution is harmless
    #[serde(default)]
    pub idempotent: bool,
}

/// Serializable operation shape tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationShape {
    /// Independently replicable operation
    Simple,
    /// Program-ordered workflow over child operations
    Composite,
    /// Result-replicated operation
    SideEffecting,
}

impl OperationConfig {
    fn default_kind() -> OperationShape {
        OperationShape::Simple
    }

    fn default_ordered() -> bool {
        true
    }
}

/// One interfering operation pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// First operation
    pub a: String,
    /// Second operation
    pub b: String,
    /// Explicit tolerance; falls back to the commutability default
    #[serde(default)]
    pub tolerance: Option<u32>,
}

/// Complete configuration of one replica node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id
    pub node: u32,
    /// Commutability defaults
    #[serde(default)]
    pub commutability: CommutabilityConfig,
    /// Session lifecycle policy
    #[serde(default)]
    pub session: SessionConfig,
    /// Declared conflict domains
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionConfig>,
    /// Declared operations
    #[serde(default, rename = "operation")]
    pub operations: Vec<OperationConfig>,
    /// Declared interfering pairs
    #[serde(default, rename = "pair")]
    pub pairs: Vec<PairConfig>,
}

impl NodeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|err| OrdoError::configuration(err.to_string()))
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node)
    }

    /// Validate and build the ordering context this configuration describes.
    pub fn build_context(&self) -> Result<OrderingContext> {
        let mut builder = ContextBuilder::default()
            .default_tolerance(self.commutability.default_tolerance);

        for partition in &self.partitions {
            builder = builder.partition(
                PartitionId(partition.id),
                partition.scope,
                NodeId(partition.sequencer),
            );
        }
        for operation in &self.operations {
            let kind = match operation.kind {
                OperationShape::Simple => OperationKind::Simple,
                OperationShape::SideEffecting => OperationKind::SideEffecting,
                OperationShape::Composite => OperationKind::Composite {
                    children: operation.children.clone(),
                },
            };
            builder = builder.operation(OperationSpec {
                name: operation.name.clone(),
                kind,
                partition: operation.partition.map(PartitionId),
                requires_ordering: operation.ordered,
                is_idempotent: operation.idempotent,
            });
        }
        for pair in &self.pairs {
            builder = builder.interfering_pair(
                pair.a.clone(),
                pair.b.clone(),
                pair.tolerance
                    .unwrap_or(self.commutability.default_tolerance),
            );
        }
        builder.build()
    }
}
