//! Partition: the ordering and delivery state machine for one conflict
//! domain.
//!
//! A partition owns two mutual-exclusion domains. The assignment lock guards
//! the sequencer-side counters and the active concurrent batch; it is only
//! taken while this node acts as sequencer. The delivery lock guards the
//! expected counters and the pending skip set; it is held while gating and
//! executing a single delivery, and blocked deliveries suspend on its
//! condition variable until another delivery or a skip application advances
//! the expectation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Condvar, Mutex};

use crate::policy::CommutabilityPolicy;
use crate::token::{NodeId, PartitionId, Succession, Token};

/// Consistency scope of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScope {
    /// No ordering, no gating
    Unordered,
    /// Total order per session key
    SessionOrdered,
    /// Total order across the whole partition
    FullyOrdered,
}

/// Result of gating one token, visible to callers.
#[derive(Debug)]
pub enum GateOutcome<R> {
    /// The token matched the expectation and the payload ran in order
    Delivered(R),
    /// The token was a batch member whose seqno has passed; the payload ran
    /// concurrently with its siblings
    Concurrent(R),
    /// The token is behind the expectation and not a batch member; nothing ran
    Discarded,
}

impl<R> GateOutcome<R> {
    /// The payload result, if anything was executed.
    pub fn into_result(self) -> Option<R> {
        match self {
            GateOutcome::Delivered(result) | GateOutcome::Concurrent(result) => Some(result),
            GateOutcome::Discarded => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Deliver { closes_batch: bool },
    Concurrent,
    Wait,
}

#[derive(Debug)]
struct ControlState {
    sequencer: NodeId,
    allow_requests: bool,
}

#[derive(Debug)]
struct AssignState {
    seqno: i32,
    concurrentno: i32,
    active_batch: IndexSet<String>,
}

#[derive(Debug)]
struct DeliverState {
    expect_seqno: i32,
    expect_concurrentno: i32,
    pending_skip: BinaryHeap<Reverse<Token>>,
}

#[derive(Debug, Default)]
struct ConsensusState {
    /// Survivors still expected to report; `None` means the collection was
    /// opened implicitly by the first report.
    pending_reporters: Option<HashSet<NodeId>>,
    /// Greatest expected token reported so far.
    latest: Option<Token>,
    /// Reported executed tokens, merged under `latest`.
    accumulated: BinaryHeap<Reverse<Token>>,
}

/// The ordering/delivery state machine for one conflict domain.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    scope: PartitionScope,
    policy: Arc<CommutabilityPolicy>,
    control: Mutex<ControlState>,
    assign: Mutex<AssignState>,
    deliver: Mutex<DeliverState>,
    delivery_cond: Condvar,
    consensus: Mutex<Option<ConsensusState>>,
}

impl Partition {
    /// Create a partition with an initial sequencer.
    pub fn new(
        id: PartitionId,
        scope: PartitionScope,
        sequencer: NodeId,
        policy: Arc<CommutabilityPolicy>,
    ) -> Self {
        Self {
            id,
            scope,
            policy,
            control: Mutex::new(ControlState {
                sequencer,
                allow_requests: true,
            }),
            assign: Mutex::new(AssignState {
                seqno: -1,
                concurrentno: 0,
                active_batch: IndexSet::new(),
            }),
            deliver: Mutex::new(DeliverState {
                expect_seqno: 0,
                expect_concurrentno: 0,
                pending_skip: BinaryHeap::new(),
            }),
            delivery_cond: Condvar::new(),
            consensus: Mutex::new(None),
        }
    }

    /// The partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The partition scope.
    pub fn scope(&self) -> PartitionScope {
        self.scope
    }

    /// Unordered partitions never gate.
    pub fn requires_gating(&self) -> bool {
        self.scope != PartitionScope::Unordered
    }

    // ---- sequencer control ------------------------------------------------

    /// The node currently authoritative for assignments.
    pub fn sequencer(&self) -> NodeId {
        self.control.lock().sequencer
    }

    /// Install a new sequencer.
    pub fn set_sequencer(&self, sequencer: NodeId) {
        self.control.lock().sequencer = sequencer;
    }

    /// Whether `node` currently holds the sequencer role.
    pub fn is_sequencer(&self, node: NodeId) -> bool {
        self.control.lock().sequencer == node
    }

    /// Resolve the sequencer for an outgoing request, or `None` while the
    /// partition is suspended for recovery.
    pub fn sequencer_for_request(&self) -> Option<NodeId> {
        let control = self.control.lock();
        if !control.allow_requests {
            tracing::warn!(
                partition = %self.id,
                "request suspended, sequencer crashed and not yet re-agreed"
            );
            return None;
        }
        Some(control.sequencer)
    }

    /// Install `new_sequencer` and stop accepting assignment requests until
    /// the skip agreement arrives. Returns the previous sequencer.
    pub fn suspend_requests(&self, new_sequencer: NodeId) -> NodeId {
        let mut control = self.control.lock();
        let old = control.sequencer;
        control.sequencer = new_sequencer;
        control.allow_requests = false;
        old
    }

    /// Accept assignment requests again.
    pub fn allow_requests(&self) {
        tracing::debug!(partition = %self.id, "unblocking requests");
        self.control.lock().allow_requests = true;
    }

    /// Whether assignment requests are currently accepted.
    pub fn is_accepting_requests(&self) -> bool {
        self.control.lock().allow_requests
    }

    // ---- sequencer-side assignment ----------------------------------------

    /// Assign the next token for `operation`, or `None` when `caller` is not
    /// the sequencer or the partition is suspended for recovery.
    pub fn next_token(&self, operation: &str, caller: NodeId) -> Option<Token> {
        if !self.requires_gating() {
            return Some(Token::unbatched(0).with_partition(self.id));
        }
        {
            let control = self.control.lock();
            if control.sequencer != caller || !control.allow_requests {
                return None;
            }
        }
        Some(self.assign_unchecked(operation))
    }

    /// Assign the next token without checking the sequencer role. The caller
    /// is responsible for having validated control state.
    pub(crate) fn assign_unchecked(&self, operation: &str) -> Token {
        let mut assign = self.assign.lock();
        let concurrent = !assign.active_batch.is_empty()
            && self
                .policy
                .is_concurrent_deliverable(operation, assign.active_batch.iter().map(String::as_str));

        let token = if concurrent {
            assign.concurrentno += 1;
            Token::member(assign.seqno)
        } else {
            let closed = assign.concurrentno;
            assign.seqno += 1;
            assign.concurrentno = 0;
            assign.active_batch.clear();
            Token::new(assign.seqno, if closed == 0 { None } else { Some(closed) })
        };
        assign.active_batch.insert(operation.to_owned());

        tracing::debug!(
            partition = %self.id,
            operation,
            token = %token,
            "assigned token"
        );
        token.with_partition(self.id)
    }

    // ---- delivery gating --------------------------------------------------

    /// Gate `token` and run `execute` at its slot in the delivery order.
    ///
    /// Blocks on the delivery condition variable while the token is ahead of
    /// the expectation. Ordered deliveries run while the delivery lock is
    /// held; batch members run outside it so siblings proceed concurrently.
    pub fn deliver_gated<R>(&self, token: &Token, execute: impl FnOnce() -> R) -> GateOutcome<R> {
        if !self.requires_gating() {
            return GateOutcome::Delivered(execute());
        }

        let mut state = self.deliver.lock();
        loop {
            match Self::classify_with_skips(self.id, &mut state, token) {
                Decision::Deliver { closes_batch } => {
                    if closes_batch {
                        state.expect_concurrentno = 0;
                    }
                    tracing::debug!(partition = %self.id, token = %token, "delivering in order");
                    let result = execute();
                    state.expect_seqno += 1;
                    drop(state);
                    self.delivery_cond.notify_all();
                    return GateOutcome::Delivered(result);
                }
                Decision::Concurrent => {
                    if !token.is_batch_member() {
                        tracing::debug!(
                            partition = %self.id,
                            token = %token,
                            "expectation already past this token, discarding"
                        );
                        return GateOutcome::Discarded;
                    }
                    drop(state);
                    tracing::debug!(partition = %self.id, token = %token, "delivering batch member");
                    let result = execute();
                    let mut state = self.deliver.lock();
                    state.expect_concurrentno += 1;
                    drop(state);
                    self.delivery_cond.notify_all();
                    return GateOutcome::Concurrent(result);
                }
                Decision::Wait => {
                    tracing::debug!(partition = %self.id, token = %token, "delivery suspended");
                    self.delivery_cond.wait(&mut state);
                }
            }
        }
    }

    /// Whether gating `token` right now would have to wait. Applies any
    /// matching pending skips as a side effect.
    pub fn would_block(&self, token: &Token) -> bool {
        if !self.requires_gating() {
            return false;
        }
        let mut state = self.deliver.lock();
        Self::classify_with_skips(self.id, &mut state, token) == Decision::Wait
    }

    /// The token this partition expects to deliver next.
    pub fn expected_token(&self) -> Token {
        let state = self.deliver.lock();
        Token::new(state.expect_seqno, Some(state.expect_concurrentno))
    }

    /// Queue a skip token agreed to have never been globally assigned.
    pub fn add_skip(&self, token: Token) {
        tracing::debug!(partition = %self.id, token = %token, "queueing skip token");
        self.deliver.lock().pending_skip.push(Reverse(token));
    }

    /// Wake every delivery suspended on this partition.
    pub fn trigger(&self) {
        self.delivery_cond.notify_all();
    }

    fn classify(state: &DeliverState, token: &Token) -> Decision {
        match token.concurrentno {
            None if state.expect_seqno == token.seqno => Decision::Deliver {
                closes_batch: false,
            },
            Some(count)
                if count == state.expect_concurrentno && state.expect_seqno == token.seqno =>
            {
                Decision::Deliver { closes_batch: true }
            }
            _ if state.expect_seqno > token.seqno => Decision::Concurrent,
            _ => Decision::Wait,
        }
    }

    /// Classify `token`, advancing the expectation over any pending skip that
    /// matches it before settling on `Wait`.
    fn classify_with_skips(id: PartitionId, state: &mut DeliverState, token: &Token) -> Decision {
        loop {
            let decision = Self::classify(state, token);
            if decision != Decision::Wait {
                return decision;
            }
            let Some(Reverse(head)) = state.pending_skip.peek() else {
                return Decision::Wait;
            };

            let advanced = if head.concurrentno.is_none() && state.expect_seqno == head.seqno {
                state.expect_concurrentno = 0;
                state.expect_seqno += 1;
                true
            } else if head.closing_count() == Some(state.expect_concurrentno)
                && state.expect_seqno == head.seqno
            {
                state.expect_concurrentno = 0;
                state.expect_seqno += 1;
                true
            } else if head.is_batch_member() {
                state.expect_concurrentno += 1;
                true
            } else {
                false
            };

            if !advanced {
                return Decision::Wait;
            }
            let skipped = state.pending_skip.pop();
            tracing::debug!(
                partition = %id,
                skipped = ?skipped,
                "skipped token proven never assigned"
            );
        }
    }

    // ---- crash-consensus collection ---------------------------------------

    /// Open a consensus collection expecting a report from every node in
    /// `reporters`.
    pub fn begin_collection(&self, reporters: impl IntoIterator<Item = NodeId>) {
        let mut consensus = self.consensus.lock();
        *consensus = Some(ConsensusState {
            pending_reporters: Some(reporters.into_iter().collect()),
            latest: None,
            accumulated: BinaryHeap::new(),
        });
    }

    /// Record that `reporter` has answered (or crashed). Returns whether the
    /// node was still expected.
    pub fn note_reporter(&self, reporter: NodeId) -> bool {
        let mut consensus = self.consensus.lock();
        match consensus.as_mut().and_then(|c| c.pending_reporters.as_mut()) {
            Some(pending) => pending.remove(&reporter),
            None => false,
        }
    }

    /// Merge one survivor's report into the collected state.
    ///
    /// The greatest reported expected token wins as `latest`; any token
    /// strictly below it is already known delivered and dropped.
    pub fn add_collected(&self, tokens: Vec<Token>, latest: Token) {
        let mut guard = self.consensus.lock();
        let state = guard.get_or_insert_with(ConsensusState::default);

        let Some(current_latest) = state.latest.clone() else {
            state.latest = Some(latest);
            state.accumulated.extend(tokens.into_iter().map(Reverse));
            return;
        };

        match current_latest.order_cmp(&latest) {
            std::cmp::Ordering::Greater => {
                tracing::debug!(
                    partition = %self.id,
                    kept = %current_latest,
                    reported = %latest,
                    "previous latest token is later"
                );
                state.accumulated.extend(
                    tokens
                        .into_iter()
                        .filter(|token| current_latest.order_cmp(token) != std::cmp::Ordering::Greater)
                        .map(Reverse),
                );
            }
            std::cmp::Ordering::Less => {
                tracing::debug!(
                    partition = %self.id,
                    kept = %latest,
                    previous = %current_latest,
                    "reported latest token is later"
                );
                let survivors: Vec<Reverse<Token>> = state
                    .accumulated
                    .drain()
                    .filter(|Reverse(token)| latest.order_cmp(token) != std::cmp::Ordering::Greater)
                    .collect();
                state.accumulated.extend(survivors);
                state.accumulated.extend(tokens.into_iter().map(Reverse));
                state.latest = Some(latest);
            }
            std::cmp::Ordering::Equal => {
                state.accumulated.extend(tokens.into_iter().map(Reverse));
            }
        }
    }

    /// Whether every expected survivor has reported.
    pub fn collection_finished(&self) -> bool {
        let consensus = self.consensus.lock();
        match consensus.as_ref().and_then(|c| c.pending_reporters.as_ref()) {
            Some(pending) => pending.is_empty(),
            None => true,
        }
    }

    /// Reconstruct the skip list from the collected reports and reset the
    /// assignment counters to the post-recovery state.
    ///
    /// Walks the sorted reports, synthesizing every token that must exist
    /// between consecutive survivors; the synthesized tokens are exactly the
    /// assignments proven lost with the crashed sequencer.
    pub fn extract_skips(&self) -> Vec<Token> {
        let Some(state) = self.consensus.lock().take() else {
            return Vec::new();
        };
        let Some(latest) = state.latest else {
            return Vec::new();
        };

        let mut skips = Vec::new();
        let mut heap = state.accumulated;
        let mut previous = Token::unbatched(latest.seqno - 1);
        let mut batch_count: i32 = 0;
        let mut current = heap.pop().map(|Reverse(token)| token);

        while let Some(token) = current {
            tracing::debug!(
                partition = %self.id,
                previous = %previous,
                current = %token,
                "classifying collected token"
            );
            match previous.succession(&token, batch_count) {
                Succession::DirectSuccessor => {
                    batch_count = 0;
                    previous = token;
                    current = heap.pop().map(|Reverse(t)| t);
                }
                Succession::SameBatch => {
                    batch_count += 1;
                    previous = token;
                    current = heap.pop().map(|Reverse(t)| t);
                }
                Succession::Gap => {
                    previous = Self::synthesize_missing(&previous, &token, &mut batch_count);
                    tracing::debug!(
                        partition = %self.id,
                        missing = %previous,
                        "synthesized missing token"
                    );
                    skips.push(previous.clone().with_partition(self.id));
                    current = Some(token);
                }
            }
        }

        {
            let mut assign = self.assign.lock();
            assign.seqno = previous.seqno;
            assign.concurrentno = match previous.concurrentno {
                None => 0,
                Some(count) if count < 0 => 0,
                Some(count) => count,
            };
            assign.active_batch.clear();
            tracing::info!(
                partition = %self.id,
                seqno = assign.seqno,
                concurrentno = assign.concurrentno,
                skips = skips.len(),
                "post-recovery assignment state installed"
            );
        }
        skips
    }

    /// Synthesize the token immediately following `previous`, preserving
    /// whether `previous` was mid-batch, on the way towards `current`.
    fn synthesize_missing(previous: &Token, current: &Token, batch_count: &mut i32) -> Token {
        match current.concurrentno {
            // the missing token precedes an unbatched one
            None => {
                if previous.is_batch_member() {
                    *batch_count += 1;
                    let closing = Token::closing(previous.seqno + 1, *batch_count);
                    *batch_count = 0;
                    closing
                } else {
                    Token::unbatched(previous.seqno + 1)
                }
            }
            // the missing token precedes a batch member
            Some(count) if count < 0 => {
                if previous.is_batch_member() {
                    let closing = Token::closing(previous.seqno + 1, *batch_count);
                    *batch_count = 0;
                    closing
                } else {
                    Token::unbatched(previous.seqno + 1)
                }
            }
            // the missing token precedes a batch closer
            Some(_) => {
                if previous.seqno == current.seqno - 1 {
                    // a member of the batch the closer counts is missing
                    *batch_count += 1;
                    Token::member(previous.seqno)
                } else if previous.is_batch_member() {
                    let closing = Token::closing(previous.seqno + 1, *batch_count);
                    *batch_count = 0;
                    closing
                } else {
                    Token::unbatched(previous.seqno + 1)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Arc<CommutabilityPolicy> {
        Arc::new(CommutabilityPolicy::new(0))
    }

    fn partition() -> Partition {
        Partition::new(PartitionId(1), PartitionScope::FullyOrdered, NodeId(1), policy())
    }

    #[test]
    fn first_assignment_is_unbatched_zero() {
        let part = partition();
        let token = part.next_token("svc.a", NodeId(1)).expect("is sequencer");
        assert_eq!(token.seqno, 0);
        assert_eq!(token.concurrentno, None);
        assert_eq!(token.partition, Some(PartitionId(1)));
    }

    #[test]
    fn non_sequencer_gets_no_token() {
        let part = partition();
        assert!(part.next_token("svc.a", NodeId(9)).is_none());
    }

    #[test]
    fn suspended_partition_refuses_assignment() {
        let part = partition();
        part.suspend_requests(NodeId(1));
        assert!(part.next_token("svc.a", NodeId(1)).is_none());
        assert!(part.sequencer_for_request().is_none());
        part.allow_requests();
        assert!(part.next_token("svc.a", NodeId(1)).is_some());
    }

    #[test]
    fn batch_assignment_produces_member_and_closer() {
        let policy = policy();
        policy.declare_pair_with_tolerance("svc.b", "svc.a", 8);
        policy.declare_pair_with_tolerance("svc.c", "svc.a", 8);
        policy.declare_pair_with_tolerance("svc.c", "svc.b", 8);
        let part = Partition::new(PartitionId(1), PartitionScope::FullyOrdered, NodeId(1), policy);

        let opener = part.next_token("svc.a", NodeId(1)).expect("token");
        assert_eq!((opener.seqno, opener.concurrentno), (0, None));

        let member = part.next_token("svc.b", NodeId(1)).expect("token");
        assert_eq!((member.seqno, member.concurrentno), (0, Some(-1)));

        let member2 = part.next_token("svc.c", NodeId(1)).expect("token");
        assert_eq!((member2.seqno, member2.concurrentno), (0, Some(-1)));

        // an undeclared pair forces the batch closed with the member count
        let closer = part.next_token("svc.d", NodeId(1)).expect("token");
        assert_eq!((closer.seqno, closer.concurrentno), (1, Some(2)));

        // the new batch holds only svc.d, which refuses concurrency too
        let next = part.next_token("svc.e", NodeId(1)).expect("token");
        assert_eq!((next.seqno, next.concurrentno), (2, None));
    }

    #[test]
    fn gating_delivers_in_seqno_order() {
        let part = partition();
        let mut delivered = Vec::new();

        for seqno in 0..3 {
            let token = Token::unbatched(seqno);
            let outcome = part.deliver_gated(&token, || delivered.push(seqno));
            assert!(matches!(outcome, GateOutcome::Delivered(())));
        }
        assert_eq!(delivered, vec![0, 1, 2]);
        assert_eq!(part.expected_token(), Token::new(3, Some(0)));
    }

    #[test]
    fn batch_members_deliver_after_opener_and_closer_waits_for_count() {
        let part = partition();

        // the opener passes at seqno 0
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(0), || ()),
            GateOutcome::Delivered(())
        ));
        // members deliver concurrently once the opener passed
        assert!(matches!(
            part.deliver_gated(&Token::member(0), || ()),
            GateOutcome::Concurrent(())
        ));
        // a closer with the wrong count would wait; with the right count it
        // delivers and resets the batch counter
        assert!(part.would_block(&Token::closing(1, 2)));
        assert!(matches!(
            part.deliver_gated(&Token::member(0), || ()),
            GateOutcome::Concurrent(())
        ));
        assert!(matches!(
            part.deliver_gated(&Token::closing(1, 2), || ()),
            GateOutcome::Delivered(())
        ));
        assert_eq!(part.expected_token(), Token::new(2, Some(0)));
    }

    #[test]
    fn stale_unbatched_token_is_discarded() {
        let part = partition();
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(0), || ()),
            GateOutcome::Delivered(())
        ));
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(0), || ()),
            GateOutcome::Discarded
        ));
    }

    #[test]
    fn unordered_partition_never_gates() {
        let part = Partition::new(
            PartitionId(2),
            PartitionScope::Unordered,
            NodeId(1),
            policy(),
        );
        // far-future token executes immediately
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(10), || ()),
            GateOutcome::Delivered(())
        ));
    }

    #[test]
    fn matching_skip_unblocks_next_token() {
        let part = partition();
        // (0, unbatched) was proven never assigned
        part.add_skip(Token::unbatched(0));
        // the true next token delivers with no external input
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(1), || ()),
            GateOutcome::Delivered(())
        ));
        // and the skip entry is consumed
        assert!(part.would_block(&Token::unbatched(3)));
        assert_eq!(part.expected_token(), Token::new(2, Some(0)));
    }

    #[test]
    fn member_skip_advances_batch_expectation() {
        let part = partition();
        assert!(matches!(
            part.deliver_gated(&Token::unbatched(0), || ()),
            GateOutcome::Delivered(())
        ));
        // two members of the batch at 0 are lost; the closer reports 2
        part.add_skip(Token::member(0));
        part.add_skip(Token::member(0));
        assert!(matches!(
            part.deliver_gated(&Token::closing(1, 2), || ()),
            GateOutcome::Delivered(())
        ));
    }

    #[test]
    fn collection_tracks_pending_reporters() {
        let part = partition();
        part.begin_collection([NodeId(2), NodeId(3)]);
        assert!(!part.collection_finished());
        assert!(part.note_reporter(NodeId(2)));
        assert!(!part.note_reporter(NodeId(2)));
        assert!(!part.collection_finished());
        assert!(part.note_reporter(NodeId(3)));
        assert!(part.collection_finished());
    }

    #[test]
    fn extract_skips_reconstructs_reference_gap() {
        let part = partition();
        part.begin_collection([NodeId(1111), NodeId(2222)]);

        assert!(part.note_reporter(NodeId(1111)));
        part.add_collected(
            vec![Token::unbatched(10), Token::member(14), Token::member(14)],
            Token::unbatched(10),
        );
        assert!(part.note_reporter(NodeId(2222)));
        part.add_collected(
            vec![Token::closing(14, 4), Token::member(17)],
            Token::unbatched(12),
        );

        assert!(part.collection_finished());
        let skips: Vec<(i32, Option<i32>)> = part
            .extract_skips()
            .into_iter()
            .map(|token| (token.seqno, token.concurrentno))
            .collect();

        assert_eq!(
            skips,
            vec![
                (12, None),
                (13, None),
                (13, Some(-1)),
                (13, Some(-1)),
                (13, Some(-1)),
                (13, Some(-1)),
                (15, Some(2)),
                (16, None),
                (17, None),
            ]
        );

        // post-recovery state continues from the highest reconstructed token
        let next = part.next_token("svc.a", NodeId(1)).expect("token");
        assert_eq!((next.seqno, next.concurrentno), (18, None));
    }

    #[test]
    fn extract_skips_with_no_gaps_is_empty() {
        let part = partition();
        part.begin_collection([NodeId(2)]);
        assert!(part.note_reporter(NodeId(2)));
        part.add_collected(
            vec![Token::unbatched(5), Token::unbatched(6)],
            Token::unbatched(5),
        );
        assert!(part.extract_skips().is_empty());
        // assignment resumes right after the last reported token
        let next = part.next_token("svc.a", NodeId(1)).expect("token");
        assert_eq!((next.seqno, next.concurrentno), (7, None));
    }

    #[test]
    fn reports_below_merged_latest_are_dropped() {
        let part = partition();
        part.begin_collection([NodeId(2), NodeId(3)]);
        assert!(part.note_reporter(NodeId(2)));
        part.add_collected(vec![Token::unbatched(3)], Token::unbatched(3));
        assert!(part.note_reporter(NodeId(3)));
        // latest moves to 5, so the report at 3 is already known delivered
        part.add_collected(vec![Token::unbatched(5)], Token::unbatched(5));

        assert!(part.extract_skips().is_empty());
        let next = part.next_token("svc.a", NodeId(1)).expect("token");
        assert_eq!((next.seqno, next.concurrentno), (6, None));
    }
}
