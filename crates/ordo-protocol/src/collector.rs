//! Token collector for composite requests.
//!
//! A composite request spans multiple partitions and receives its tokens
//! piecemeal, possibly from several sequencers. The collector accumulates
//! them per slot and fires once every ordered slot is filled. The waiting
//! set doubles as the retransmission record: after a sequencer crash, only
//! the still-waiting slots of affected partitions are re-requested.

use std::collections::BTreeSet;

use ordo_core::token::Token;

use crate::messages::IndexedToken;

/// Per-request accumulator of composite sub-tokens.
#[derive(Debug)]
pub struct TokenCollector {
    slots: Vec<Option<Token>>,
    waiting: BTreeSet<usize>,
    threshold: usize,
    filled: usize,
}

impl TokenCollector {
    /// Create a collector with `total` slots, of which `ordered_indices`
    /// require a token.
    pub fn new(total: usize, ordered_indices: impl IntoIterator<Item = usize>) -> Self {
        let waiting: BTreeSet<usize> = ordered_indices.into_iter().collect();
        Self {
            slots: vec![None; total],
            threshold: waiting.len(),
            waiting,
            filled: 0,
        }
    }

    /// Fill one slot. Returns true once every ordered slot is filled; a
    /// duplicate fill is ignored.
    pub fn add(&mut self, entry: IndexedToken) -> bool {
        let open = matches!(self.slots.get(entry.index), Some(None));
        if !open {
            return self.is_complete();
        }
        self.slots[entry.index] = Some(entry.token);
        self.waiting.remove(&entry.index);
        self.filled += 1;
        self.is_complete()
    }

    /// Return a slot to the waiting set, because the sequencer that issued
    /// its token is now known dead.
    pub fn remove(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.take().is_some() {
                self.filled -= 1;
                self.waiting.insert(index);
            }
        }
    }

    /// Whether every ordered slot is filled.
    pub fn is_complete(&self) -> bool {
        self.filled == self.threshold
    }

    /// Whether any slot still awaits its token.
    pub fn needs_retransmission(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Indices still awaiting a token.
    pub fn waiting_indices(&self) -> Vec<usize> {
        self.waiting.iter().copied().collect()
    }

    /// The collected tokens, slot by slot.
    pub fn tokens(&self) -> &[Option<Token>] {
        &self.slots
    }

    /// Drain into an indexed assignment vector, in slot order.
    pub fn into_assignment(self) -> Vec<IndexedToken> {
        self.slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|token| IndexedToken { index, token }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, seqno: i32) -> IndexedToken {
        IndexedToken {
            index,
            token: Token::unbatched(seqno),
        }
    }

    #[test]
    fn fires_once_all_ordered_slots_fill() {
        let mut collector = TokenCollector::new(3, [0, 2]);
        assert!(!collector.add(entry(0, 5)));
        assert!(collector.add(entry(2, 9)));
        assert!(collector.is_complete());
        assert!(!collector.needs_retransmission());
    }

    #[test]
    fn unordered_slots_do_not_count() {
        let collector = TokenCollector::new(2, Vec::<usize>::new());
        assert!(collector.is_complete());
    }

    #[test]
    fn duplicate_fill_is_ignored() {
        let mut collector = TokenCollector::new(2, [0, 1]);
        assert!(!collector.add(entry(0, 1)));
        assert!(!collector.add(entry(0, 7)));
        assert_eq!(collector.tokens()[0], Some(Token::unbatched(1)));
    }

    #[test]
    fn removed_slot_returns_to_waiting() {
        let mut collector = TokenCollector::new(2, [0, 1]);
        assert!(!collector.add(entry(0, 1)));
        assert!(collector.add(entry(1, 2)));
        collector.remove(1);
        assert!(!collector.is_complete());
        assert_eq!(collector.waiting_indices(), vec![1]);
        assert!(collector.needs_retransmission());
        assert!(collector.add(entry(1, 3)));
    }

    #[test]
    fn assignment_preserves_slot_order() {
        let mut collector = TokenCollector::new(3, [0, 2]);
        let _ = collector.add(entry(2, 9));
        let _ = collector.add(entry(0, 5));
        let assignment = collector.into_assignment();
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment[0].index, 0);
        assert_eq!(assignment[1].index, 2);
    }
}
