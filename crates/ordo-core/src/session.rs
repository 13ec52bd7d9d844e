//! Session-scoped partitions.
//!
//! A [`SessionPartition`] multiplexes one sub-partition per session key, so
//! ordering is enforced per client session rather than globally. Sequencer
//! control and the crash-consensus reporter view live on the root; the
//! per-session counters, skip sets and collected reports live on the lazily
//! created sub-partitions, so unrelated sessions gate and block
//! independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::partition::{GateOutcome, Partition, PartitionScope};
use crate::policy::CommutabilityPolicy;
use crate::token::{NodeId, PartitionId, SessionId, Token};

#[derive(Debug)]
struct SessionEntry {
    partition: Arc<Partition>,
    last_touch: Instant,
}

/// A partition multiplexing one ordering domain per session key.
#[derive(Debug)]
pub struct SessionPartition {
    root: Partition,
    policy: Arc<CommutabilityPolicy>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionPartition {
    /// Create a session-scoped partition with an initial sequencer.
    pub fn new(id: PartitionId, sequencer: NodeId, policy: Arc<CommutabilityPolicy>) -> Self {
        Self {
            root: Partition::new(id, PartitionScope::SessionOrdered, sequencer, policy.clone()),
            policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The partition id shared by every session sub-partition.
    pub fn id(&self) -> PartitionId {
        self.root.id()
    }

    /// Number of live session sub-partitions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn sub_partition(&self, session: &str) -> Arc<Partition> {
        if let Some(entry) = self.sessions.write().get_mut(session) {
            entry.last_touch = Instant::now();
            return entry.partition.clone();
        }
        let mut sessions = self.sessions.write();
        sessions
            .entry(session.to_owned())
            .or_insert_with(|| {
                tracing::debug!(partition = %self.root.id(), session, "creating session sub-partition");
                SessionEntry {
                    partition: Arc::new(Partition::new(
                        self.root.id(),
                        PartitionScope::FullyOrdered,
                        self.root.sequencer(),
                        self.policy.clone(),
                    )),
                    last_touch: Instant::now(),
                }
            })
            .partition
            .clone()
    }

    // ---- sequencer control (root-level) -----------------------------------

    /// The node currently authoritative for assignments.
    pub fn sequencer(&self) -> NodeId {
        self.root.sequencer()
    }

    /// Install a new sequencer.
    pub fn set_sequencer(&self, sequencer: NodeId) {
        self.root.set_sequencer(sequencer);
    }

    /// Whether `node` currently holds the sequencer role.
    pub fn is_sequencer(&self, node: NodeId) -> bool {
        self.root.is_sequencer(node)
    }

    /// Resolve the sequencer for an outgoing request, or `None` while
    /// suspended for recovery.
    pub fn sequencer_for_request(&self) -> Option<NodeId> {
        self.root.sequencer_for_request()
    }

    /// Install `new_sequencer` and refuse assignments until the skip
    /// agreement arrives. Returns the previous sequencer.
    pub fn suspend_requests(&self, new_sequencer: NodeId) -> NodeId {
        self.root.suspend_requests(new_sequencer)
    }

    /// Accept assignment requests again.
    pub fn allow_requests(&self) {
        self.root.allow_requests();
    }

    /// Whether assignment requests are currently accepted.
    pub fn is_accepting_requests(&self) -> bool {
        self.root.is_accepting_requests()
    }

    // ---- assignment and delivery ------------------------------------------

    /// Assign the next token within `session`, or `None` when `caller` is
    /// not the sequencer or the partition is suspended.
    pub fn next_token(&self, session: &str, operation: &str, caller: NodeId) -> Option<Token> {
        if !self.root.is_sequencer(caller) || !self.root.is_accepting_requests() {
            return None;
        }
        Some(
            self.sub_partition(session)
                .assign_unchecked(operation)
                .with_session(session),
        )
    }

    /// Gate `token` within `session` and run `execute` at its slot.
    pub fn deliver_gated<R>(
        &self,
        session: &str,
        token: &Token,
        execute: impl FnOnce() -> R,
    ) -> GateOutcome<R> {
        self.sub_partition(session).deliver_gated(token, execute)
    }

    /// Whether gating `token` within `session` would have to wait.
    pub fn would_block(&self, session: &str, token: &Token) -> bool {
        self.sub_partition(session).would_block(token)
    }

    /// Queue a skip token onto the sub-partition its session names.
    pub fn add_skip(&self, token: Token) {
        let Some(session) = token.session.clone() else {
            tracing::warn!(
                partition = %self.root.id(),
                token = %token,
                "session-scoped skip token without session key, dropping"
            );
            return;
        };
        self.sub_partition(&session).add_skip(token);
    }

    /// Wake deliveries suspended on one session.
    pub fn trigger(&self, session: &str) {
        if let Some(entry) = self.sessions.read().get(session) {
            entry.partition.trigger();
        }
    }

    /// Wake deliveries suspended on every session.
    pub fn trigger_all(&self) {
        for entry in self.sessions.read().values() {
            entry.partition.trigger();
        }
    }

    // ---- crash-consensus collection ---------------------------------------

    /// Open a consensus collection expecting a report from every node in
    /// `reporters`.
    pub fn begin_collection(&self, reporters: impl IntoIterator<Item = NodeId>) {
        self.root.begin_collection(reporters);
    }

    /// Record that `reporter` has answered (or crashed). Returns whether the
    /// node was still expected.
    pub fn note_reporter(&self, reporter: NodeId) -> bool {
        self.root.note_reporter(reporter)
    }

    /// Whether every expected survivor has reported.
    pub fn collection_finished(&self) -> bool {
        self.root.collection_finished()
    }

    /// Merge one survivor's report for `session` into the collected state.
    pub fn add_collected(&self, session: &str, tokens: Vec<Token>, latest: Token) {
        self.sub_partition(session).add_collected(tokens, latest);
    }

    /// Reconstruct skip lists for every session with collected reports and
    /// reset their assignment counters. Root collection state is cleared.
    pub fn extract_skips(&self) -> Vec<Token> {
        // drop the root reporter view
        let _ = self.root.extract_skips();
        let sessions = self.sessions.read();
        let mut skips = Vec::new();
        for (session, entry) in sessions.iter() {
            for token in entry.partition.extract_skips() {
                skips.push(token.with_session(session.clone()));
            }
        }
        skips
    }

    /// The expected token of every live session, for consensus reports.
    pub fn expected_states(&self) -> Vec<(SessionId, Token)> {
        self.sessions
            .read()
            .iter()
            .map(|(session, entry)| (session.clone(), entry.partition.expected_token()))
            .collect()
    }

    // ---- session lifecycle ------------------------------------------------

    /// Drop the sub-partition of a session the host has declared dead.
    pub fn remove(&self, session: &str) {
        self.sessions.write().remove(session);
    }

    /// Drop sub-partitions untouched for at least `max_idle`. Returns how
    /// many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|session, entry| {
            let keep = entry.last_touch.elapsed() < max_idle;
            if !keep {
                tracing::debug!(session, "evicting idle session sub-partition");
            }
            keep
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_partition() -> SessionPartition {
        SessionPartition::new(PartitionId(-1), NodeId(1), Arc::new(CommutabilityPolicy::new(0)))
    }

    #[test]
    fn sessions_are_sequenced_independently() {
        let part = session_partition();
        let a0 = part.next_token("alice", "svc.a", NodeId(1)).expect("token");
        let b0 = part.next_token("bob", "svc.a", NodeId(1)).expect("token");
        assert_eq!(a0.seqno, 0);
        assert_eq!(b0.seqno, 0);
        assert_eq!(a0.session.as_deref(), Some("alice"));
        assert_eq!(b0.session.as_deref(), Some("bob"));
        assert_eq!(part.session_count(), 2);
    }

    #[test]
    fn non_sequencer_gets_no_session_token() {
        let part = session_partition();
        assert!(part.next_token("alice", "svc.a", NodeId(9)).is_none());
    }

    #[test]
    fn delivery_gates_per_session() {
        let part = session_partition();
        // bob's stream is unaffected by alice's pending slot 0
        assert!(part.would_block("alice", &Token::unbatched(1).with_session("alice")));
        assert!(matches!(
            part.deliver_gated("bob", &Token::unbatched(0).with_session("bob"), || ()),
            GateOutcome::Delivered(())
        ));
    }

    #[test]
    fn skips_route_by_session() {
        let part = session_partition();
        part.add_skip(Token::unbatched(0).with_session("alice"));
        assert!(matches!(
            part.deliver_gated("alice", &Token::unbatched(1).with_session("alice"), || ()),
            GateOutcome::Delivered(())
        ));
        // bob still waits at slot 0
        assert!(part.would_block("bob", &Token::unbatched(1).with_session("bob")));
    }

    #[test]
    fn collected_session_reports_reconstruct_per_session() {
        let part = session_partition();
        part.begin_collection([NodeId(2)]);
        assert!(part.note_reporter(NodeId(2)));
        part.add_collected(
            "alice",
            vec![Token::unbatched(2).with_session("alice")],
            Token::unbatched(0).with_session("alice"),
        );
        assert!(part.collection_finished());

        let skips = part.extract_skips();
        assert_eq!(skips.len(), 2);
        assert!(skips.iter().all(|t| t.session.as_deref() == Some("alice")));
        assert_eq!(
            skips.iter().map(|t| t.seqno).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn idle_sessions_are_evicted_explicitly() {
        let part = session_partition();
        let _ = part.next_token("alice", "svc.a", NodeId(1));
        assert_eq!(part.session_count(), 1);
        assert_eq!(part.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(part.evict_idle(Duration::ZERO), 1);
        assert_eq!(part.session_count(), 0);
    }
}
