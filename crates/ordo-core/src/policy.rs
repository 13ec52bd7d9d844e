//! Commutability policy.
//!
//! Decides whether two operations may be delivered in either order.
//! Relaxation is opt-in: a pair that was never declared commutable stays
//! strictly ordered. Declared pairs commute within a bounded window: after
//! `tolerance` consecutive concurrent admissions the next attempt is forced
//! back into strict order and the window resets, so relaxed ordering cannot
//! starve strict-order guarantees.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Key for an unordered operation pair.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

#[derive(Debug)]
struct PairWindow {
    /// Consecutive concurrent admissions allowed before strict order is forced.
    tolerance: u32,
    /// Concurrent admissions since the last forced ordering.
    streak: u32,
}

/// Per-operation-pair oracle with bounded staleness.
#[derive(Debug)]
pub struct CommutabilityPolicy {
    default_tolerance: u32,
    pairs: Mutex<HashMap<(String, String), PairWindow>>,
}

impl CommutabilityPolicy {
    /// Create a policy with the given default tolerance for declared pairs.
    pub fn new(default_tolerance: u32) -> Self {
        Self {
            default_tolerance,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Declare `a` and `b` as an interfering pair with the default tolerance.
    pub fn declare_pair(&self, a: &str, b: &str) {
        self.declare_pair_with_tolerance(a, b, self.default_tolerance);
    }

    /// Declare `a` and `b` as an interfering pair with an explicit tolerance.
    ///
    /// Tolerance 0 means the pair is ordered one by one.
    pub fn declare_pair_with_tolerance(&self, a: &str, b: &str, tolerance: u32) {
        self.pairs.lock().insert(
            pair_key(a, b),
            PairWindow {
                tolerance,
                streak: 0,
            },
        );
    }

    /// Adjust the tolerance of an already declared pair.
    pub fn set_tolerance(&self, a: &str, b: &str, tolerance: u32) {
        if let Some(window) = self.pairs.lock().get_mut(&pair_key(a, b)) {
            window.tolerance = tolerance;
        }
    }

    /// Decide whether `candidate` may join the concurrent batch currently
    /// holding `batch_members`.
    ///
    /// Returns false if any member refuses concurrency with the candidate:
    /// an undeclared pair refuses outright, a declared pair refuses once its
    /// tolerance window is exhausted (the window then resets). Windows of
    /// pairs admitted before the refusal keep their advanced streaks, the
    /// same way the source policy consumes its counters while iterating.
    pub fn is_concurrent_deliverable<'a>(
        &self,
        candidate: &str,
        batch_members: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        let mut pairs = self.pairs.lock();
        for member in batch_members {
            let Some(window) = pairs.get_mut(&pair_key(candidate, member)) else {
                return false;
            };
            if window.streak >= window.tolerance {
                window.streak = 0;
                tracing::debug!(
                    candidate,
                    member,
                    tolerance = window.tolerance,
                    "tolerance window exhausted, forcing strict order"
                );
                return false;
            }
            window.streak += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undeclared_pairs_stay_strictly_ordered() {
        let policy = CommutabilityPolicy::new(3);
        assert!(!policy.is_concurrent_deliverable("read", ["write"].into_iter()));
    }

    #[test]
    fn tolerance_window_forces_strict_order_then_resets() {
        let policy = CommutabilityPolicy::new(0);
        policy.declare_pair_with_tolerance("put", "get", 3);

        // exactly `tolerance` consecutive admissions succeed
        for _ in 0..3 {
            assert!(policy.is_concurrent_deliverable("put", ["get"].into_iter()));
        }
        // the next attempt is refused and the counter resets
        assert!(!policy.is_concurrent_deliverable("put", ["get"].into_iter()));
        for _ in 0..3 {
            assert!(policy.is_concurrent_deliverable("put", ["get"].into_iter()));
        }
        assert!(!policy.is_concurrent_deliverable("put", ["get"].into_iter()));
    }

    #[test]
    fn zero_tolerance_orders_one_by_one() {
        let policy = CommutabilityPolicy::new(0);
        policy.declare_pair("a", "b");
        assert!(!policy.is_concurrent_deliverable("a", ["b"].into_iter()));
        assert!(!policy.is_concurrent_deliverable("b", ["a"].into_iter()));
    }

    #[test]
    fn any_refusing_member_blocks_the_batch() {
        let policy = CommutabilityPolicy::new(0);
        policy.declare_pair_with_tolerance("c", "a", 10);
        policy.declare_pair_with_tolerance("c", "b", 0);
        assert!(!policy.is_concurrent_deliverable("c", ["a", "b"].into_iter()));
    }

    #[test]
    fn pair_key_is_symmetric() {
        let policy = CommutabilityPolicy::new(0);
        policy.declare_pair_with_tolerance("x", "y", 1);
        assert!(policy.is_concurrent_deliverable("y", ["x"].into_iter()));
        assert!(!policy.is_concurrent_deliverable("x", ["y"].into_iter()));
    }
}
