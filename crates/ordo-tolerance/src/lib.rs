//! # ordo-tolerance — sequencer-crash recovery
//!
//! The fault-tolerance engine of the ordo replication middleware: in-flight
//! token caches, the decentralized consensus collection run by a candidate
//! sequencer after a crash, skip-list agreement, and retransmission of
//! requests whose coordination became indeterminate.

pub mod caches;
pub mod engine;

pub use caches::{AssignedCache, ExecutedCache};
pub use engine::{
    FaultToleranceEngine, LowestSurvivorElector, RecoveryPhase, SequencerElector,
};
