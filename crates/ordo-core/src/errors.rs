//! Unified error type for the ordering engine.

use serde::{Deserialize, Serialize};

use crate::token::PartitionId;

/// Unified error type for ordo operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum OrdoError {
    /// Invalid configuration detected while building the ordering context
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration
        message: String,
    },

    /// An assignment was requested from a node that does not hold the
    /// sequencer role for the partition
    #[error("Node is not the sequencer for partition {partition}")]
    NotSequencer {
        /// The partition the assignment was requested for
        partition: PartitionId,
    },

    /// A coordination reply arrived for a request this node no longer tracks
    #[error("Stale correlation: {message}")]
    StaleCorrelation {
        /// Description of the discarded correlation
        message: String,
    },

    /// An operation name could not be resolved
    #[error("Unknown operation: {name}")]
    UnknownOperation {
        /// The unresolved operation name
        name: String,
    },

    /// A partition id could not be resolved
    #[error("Unknown partition: {partition}")]
    UnknownPartition {
        /// The unresolved partition id
        partition: PartitionId,
    },

    /// Encoding or decoding of a wire message failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the codec failure
        message: String,
    },

    /// The transport layer rejected a send
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
    },

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal failure
        message: String,
    },
}

impl OrdoError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a stale-correlation error
    pub fn stale_correlation(message: impl Into<String>) -> Self {
        Self::StaleCorrelation {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Standard result type for ordo operations.
pub type Result<T> = std::result::Result<T, OrdoError>;
