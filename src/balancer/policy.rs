// src/balancer/policy.rs
use crate::registry::Backend;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A backend paired with the session count observed for this selection round.
#[derive(Clone)]
pub struct ScoredBackend {
    pub backend: Arc<Backend>,
    pub sessions: usize,
}

#[async_trait]
pub trait SelectionPolicy: Send + Sync {
    /// Picks one backend among the eligible candidates. Candidate order is
    /// the registry order established at init.
    async fn select(&self, candidates: &[ScoredBackend]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;

    /// Current tie-break cursor position, for introspection.
    fn cursor(&self) -> usize;
}

/// Minimum session count wins; ties are broken by a process-global
/// round-robin cursor over the tie set.
pub struct LeastLoadedPolicy {
    cursor: AtomicUsize,
}

impl LeastLoadedPolicy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    fn choose(&self, candidates: &[ScoredBackend]) -> Option<Arc<Backend>> {
        let min = candidates.iter().map(|c| c.sessions).min()?;
        let ties: Vec<&ScoredBackend> =
            candidates.iter().filter(|c| c.sessions == min).collect();
        if ties.len() == 1 {
            return Some(ties[0].backend.clone());
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % ties.len();
        Some(ties[index].backend.clone())
    }
}

impl Default for LeastLoadedPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SelectionPolicy for LeastLoadedPolicy {
    async fn select(&self, candidates: &[ScoredBackend]) -> Option<Arc<Backend>> {
        self.choose(candidates)
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scored(counts: &[usize]) -> Vec<ScoredBackend> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &sessions)| ScoredBackend {
                backend: Arc::new(Backend::new(
                    format!("server-{}", i + 1),
                    format!("http://127.0.0.1:{}", 3001 + i).parse().unwrap(),
                )),
                sessions,
            })
            .collect()
    }

    #[test]
    fn unique_minimum_wins_without_moving_the_cursor() {
        let policy = LeastLoadedPolicy::new();
        let candidates = scored(&[4, 1, 9]);
        for _ in 0..3 {
            let picked = policy.choose(&candidates).unwrap();
            assert_eq!(picked.id, "server-2");
        }
        assert_eq!(policy.cursor(), 0);
    }

    #[test]
    fn ties_rotate_round_robin() {
        let policy = LeastLoadedPolicy::new();
        let candidates = scored(&[3, 3]);
        let first = policy.choose(&candidates).unwrap();
        let second = policy.choose(&candidates).unwrap();
        assert_ne!(first.id, second.id);
        let third = policy.choose(&candidates).unwrap();
        assert_eq!(third.id, first.id);
    }

    #[test]
    fn empty_candidate_set_yields_none() {
        let policy = LeastLoadedPolicy::new();
        assert!(policy.choose(&[]).is_none());
    }

    proptest! {
        /// K consecutive selections over K equally-loaded backends visit
        /// each backend exactly once, from any starting cursor offset.
        #[test]
        fn equal_ties_visit_each_backend_once(k in 1usize..8, offset in 0usize..64) {
            let policy = LeastLoadedPolicy::new();
            policy.cursor.store(offset, Ordering::Relaxed);
            let candidates = scored(&vec![2usize; k]);

            let mut seen = std::collections::HashSet::new();
            for _ in 0..k {
                let picked = policy.choose(&candidates).unwrap();
                seen.insert(picked.id.clone());
            }
            prop_assert_eq!(seen.len(), k);
        }

        /// The winner always carries the minimum session count.
        #[test]
        fn winner_is_least_loaded(counts in proptest::collection::vec(0usize..50, 1..8)) {
            let policy = LeastLoadedPolicy::new();
            let candidates = scored(&counts);
            let min = *counts.iter().min().unwrap();
            let picked = policy.choose(&candidates).unwrap();
            let picked_count = candidates
                .iter()
                .find(|c| c.backend.id == picked.id)
                .unwrap()
                .sessions;
            prop_assert_eq!(picked_count, min);
        }
    }
}
