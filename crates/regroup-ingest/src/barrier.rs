//! Completion reordering barrier
//!
//! Work units are registered in submission order with
//! [`ReorderingBarrier::add_expected`] and reported with
//! [`ReorderingBarrier::add_completed`] as they finish, in any order. Each
//! completion releases the longest prefix of the submission order whose units
//! have all completed, so callers publish strictly in submission order.
//!
//! Positions are assumed unique among the units in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct BarrierState {
    expected: VecDeque<String>,
    completed: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct ReorderingBarrier {
    state: Mutex<BarrierState>,
}

impl ReorderingBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `position` before its work starts
    pub fn add_expected(&self, position: impl Into<String>) {
        self.lock().expected.push_back(position.into());
    }

    /// Mark `position` done and pass the now-releasable prefix to `on_released`
    ///
    /// `on_released` runs exactly once per call, possibly with an empty slice,
    /// and outside the barrier's lock.
    pub fn add_completed<F>(&self, position: impl Into<String>, on_released: F)
    where
        F: FnOnce(&[String]),
    {
        let released = self.complete(position);
        on_released(&released);
    }

    /// Mark `position` done and return the now-releasable prefix
    pub fn complete(&self, position: impl Into<String>) -> Vec<String> {
        let mut state = self.lock();
        state.completed.insert(position.into());

        let mut released = Vec::new();
        while let Some(head) = state.expected.front() {
            if !state.completed.contains(head) {
                break;
            }
            if let Some(head) = state.expected.pop_front() {
                state.completed.remove(&head);
                released.push(head);
            }
        }
        released
    }

    /// Positions registered but not yet released
    pub fn pending(&self) -> usize {
        self.lock().expected.len()
    }

    /// Completed positions held back by an earlier unfinished one
    pub fn held(&self) -> usize {
        self.lock().completed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BarrierState> {
        // State stays consistent across a panicking holder: each mutation is a
        // single push, insert or pop.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_out_of_order_completion() {
        let barrier = ReorderingBarrier::new();
        for p in ["p1", "p2", "p3"] {
            barrier.add_expected(p);
        }

        let mut calls: Vec<Vec<String>> = Vec::new();
        for p in ["p3", "p1", "p2"] {
            barrier.add_completed(p, |released| calls.push(released.to_vec()));
        }

        assert_eq!(
            calls,
            vec![vec![], vec!["p1".to_string()], vec!["p2".to_string(), "p3".to_string()]]
        );
        assert_eq!(barrier.pending(), 0);
        assert_eq!(barrier.held(), 0);
    }

    #[test]
    fn test_held_until_head_completes() {
        let barrier = ReorderingBarrier::new();
        barrier.add_expected("a");
        barrier.add_expected("b");

        assert!(barrier.complete("b").is_empty());
        assert_eq!(barrier.held(), 1);
        assert_eq!(barrier.pending(), 2);

        barrier.add_expected("c");
        assert_eq!(barrier.complete("a"), vec!["a", "b"]);
        assert_eq!(barrier.pending(), 1);
    }

    #[test]
    fn test_concurrent_completions() {
        let barrier = std::sync::Arc::new(ReorderingBarrier::new());
        let positions: Vec<String> = (0..200).map(|i| format!("{:04}", i)).collect();
        for p in &positions {
            barrier.add_expected(p.clone());
        }

        let released = std::sync::Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = positions
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .chunks(50)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                let barrier = std::sync::Arc::clone(&barrier);
                let released = std::sync::Arc::clone(&released);
                std::thread::spawn(move || {
                    for p in chunk {
                        let batch = barrier.complete(p);
                        released.lock().unwrap().push(batch);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<String> = Vec::new();
        for batch in released.lock().unwrap().iter() {
            all.extend(batch.iter().cloned());
        }
        all.sort();
        assert_eq!(all, positions);
        assert_eq!(barrier.pending(), 0);
    }

    proptest! {
        #[test]
        fn prop_release_order_matches_submission(order in Just((0..40usize).collect::<Vec<_>>()).prop_shuffle()) {
            let barrier = ReorderingBarrier::new();
            for i in 0..40 {
                barrier.add_expected(format!("p{}", i));
            }

            let mut released = Vec::new();
            for i in order {
                barrier.add_completed(format!("p{}", i), |batch| released.extend_from_slice(batch));
            }

            let expected: Vec<String> = (0..40).map(|i| format!("p{}", i)).collect();
            prop_assert_eq!(released, expected);
        }
    }
}
