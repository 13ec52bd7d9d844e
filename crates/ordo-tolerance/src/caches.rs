//! In-flight token caches.
//!
//! Two FIFO caches make sequencer crashes recoverable. The sequencer records
//! every token it hands out, per requesting node, until it observes the
//! request's dissemination; if the requester crashes first, those tokens are
//! the ones the group must skip. Every node records every token it has
//! acquired for its own requests, per partition, until the execution
//! completes; after a sequencer crash these are the survivors' votes from
//! which the new sequencer reconstructs the gap.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use ordo_core::token::{NodeId, PartitionId, Token};

#[derive(Debug, Clone)]
struct CachedToken {
    token: Token,
    /// Set once the token has been proposed in a consensus round, so a crash
    /// of the new sequencer before the skip release does not propose it
    /// twice.
    proposed: bool,
}

/// Sequencer-side cache: tokens assigned per requesting node.
#[derive(Debug, Default)]
pub struct AssignedCache {
    inner: Mutex<HashMap<NodeId, VecDeque<Token>>>,
}

impl AssignedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a token handed to `requester`.
    pub fn record(&self, requester: NodeId, token: Token) {
        tracing::trace!(%requester, %token, "caching assigned token");
        self.inner
            .lock()
            .entry(requester)
            .or_default()
            .push_back(token);
    }

    /// Release one assigned token after its dissemination was observed.
    pub fn release(&self, requester: NodeId, token: &Token) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.get_mut(&requester) {
            if let Some(position) = queue.iter().position(|cached| cached.is_equivalent(token)) {
                queue.remove(position);
            }
        }
    }

    /// Drain every token assigned to a crashed requester; these can never
    /// complete and must be skipped by the group.
    pub fn drain_for_node(&self, requester: NodeId) -> Vec<Token> {
        self.inner
            .lock()
            .remove(&requester)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop every cached token of one partition, used when the sequencer
    /// role is handed over to a joining node.
    pub fn release_partition(&self, partition: PartitionId) {
        let mut inner = self.inner.lock();
        for queue in inner.values_mut() {
            queue.retain(|token| token.partition != Some(partition));
        }
    }

    /// Number of tokens cached for `requester`.
    pub fn len_for(&self, requester: NodeId) -> usize {
        self.inner
            .lock()
            .get(&requester)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Node-side cache: tokens acquired for own requests, per partition.
#[derive(Debug, Default)]
pub struct ExecutedCache {
    inner: Mutex<HashMap<PartitionId, VecDeque<CachedToken>>>,
}

impl ExecutedCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquired token. Tokens without a partition id are not
    /// recoverable and are ignored.
    pub fn record(&self, token: Token) {
        let Some(partition) = token.partition else {
            return;
        };
        tracing::trace!(%partition, %token, "caching executed token");
        self.inner
            .lock()
            .entry(partition)
            .or_default()
            .push_back(CachedToken {
                token,
                proposed: false,
            });
    }

    /// Release a token once its execution completed.
    ///
    /// Batch members stay cached until the token closing their batch is
    /// released: the closer is what proves how many members existed.
    pub fn release(&self, token: &Token) {
        if token.is_batch_member() {
            return;
        }
        let Some(partition) = token.partition else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some(queue) = inner.get_mut(&partition) else {
            return;
        };
        if token.closing_count().is_some() {
            // the closer also releases the members of the batch it closes
            queue.retain(|cached| {
                !(cached.token.is_equivalent(token)
                    || (cached.token.is_batch_member()
                        && cached.token.seqno + 1 == token.seqno
                        && cached.token.same_session(token)))
            });
        } else if let Some(position) = queue
            .iter()
            .position(|cached| cached.token.is_equivalent(token))
        {
            queue.remove(position);
        }
    }

    /// The cached tokens of one partition not yet proposed for consensus.
    pub fn unproposed(&self, partition: PartitionId) -> Vec<Token> {
        self.inner
            .lock()
            .get(&partition)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|cached| !cached.proposed)
                    .map(|cached| cached.token.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark every cached token of `partition` as proposed. Called when the
    /// skip agreement arrives; no new tokens are cached while the partition
    /// is suspended, so the mark covers exactly the proposed round.
    pub fn mark_all_proposed(&self, partition: PartitionId) {
        if let Some(queue) = self.inner.lock().get_mut(&partition) {
            for cached in queue.iter_mut() {
                cached.proposed = true;
            }
        }
    }

    /// Drop every cached token of one partition.
    pub fn release_partition(&self, partition: PartitionId) {
        self.inner.lock().remove(&partition);
    }

    /// Number of cached tokens for `partition`.
    pub fn len_for(&self, partition: PartitionId) -> usize {
        self.inner
            .lock()
            .get(&partition)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(seqno: i32, concurrentno: Option<i32>) -> Token {
        Token::new(seqno, concurrentno).with_partition(PartitionId(1))
    }

    #[test]
    fn assigned_release_removes_equivalent_token() {
        let cache = AssignedCache::new();
        cache.record(NodeId(5), tok(3, None));
        cache.record(NodeId(5), tok(4, None));
        cache.release(NodeId(5), &tok(3, None));
        assert_eq!(cache.len_for(NodeId(5)), 1);
        assert_eq!(cache.drain_for_node(NodeId(5)), vec![tok(4, None)]);
        assert_eq!(cache.len_for(NodeId(5)), 0);
    }

    #[test]
    fn assigned_release_partition_drops_only_that_partition() {
        let cache = AssignedCache::new();
        cache.record(NodeId(5), tok(3, None));
        cache.record(NodeId(5), Token::unbatched(9).with_partition(PartitionId(2)));
        cache.release_partition(PartitionId(1));
        assert_eq!(cache.len_for(NodeId(5)), 1);
    }

    #[test]
    fn executed_member_release_is_deferred_to_the_closer() {
        let cache = ExecutedCache::new();
        cache.record(tok(4, None));
        cache.record(tok(4, Some(-1)));
        cache.record(tok(4, Some(-1)));
        cache.record(tok(5, Some(2)));

        // releasing a member is a no-op
        cache.release(&tok(4, Some(-1)));
        assert_eq!(cache.len_for(PartitionId(1)), 4);

        // the opener releases only itself
        cache.release(&tok(4, None));
        assert_eq!(cache.len_for(PartitionId(1)), 3);

        // the closer releases itself and the members it counts
        cache.release(&tok(5, Some(2)));
        assert_eq!(cache.len_for(PartitionId(1)), 0);
    }

    #[test]
    fn unproposed_excludes_marked_tokens() {
        let cache = ExecutedCache::new();
        cache.record(tok(1, None));
        cache.mark_all_proposed(PartitionId(1));
        cache.record(tok(2, None));

        assert_eq!(cache.unproposed(PartitionId(1)), vec![tok(2, None)]);
        // the cache itself still holds both
        assert_eq!(cache.len_for(PartitionId(1)), 2);
    }

    #[test]
    fn tokens_without_partition_are_not_cached() {
        let cache = ExecutedCache::new();
        cache.record(Token::unbatched(1));
        assert_eq!(cache.len_for(PartitionId(1)), 0);
    }
}
