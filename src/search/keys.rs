//! Join key sets and key-addressed score tables.
//!
//! A [`KeySet`] is a growable bitset over join keys with a configured ceiling. Keys above
//! the ceiling are ignored: they never match, and they leave in-range keys untouched.
//! The ceiling itself is capped at [`MAX_JOIN_KEY_LIMIT`], so a set never grows past
//! 512 MiB whatever key it is handed.

use std::fmt;

use fxhash::FxHashMap;
use tantivy::Score;

const WORD_BITS: u64 = 64;

/// Highest ceiling a key set accepts.
pub const MAX_JOIN_KEY_LIMIT: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    words: Vec<u64>,
    max_key: u64,
    ignored: u64,
}

impl KeySet {
    pub fn new(max_key: u64) -> Self {
        Self {
            words: Vec::new(),
            max_key: max_key.min(MAX_JOIN_KEY_LIMIT),
            ignored: 0,
        }
    }

    pub fn max_key(&self) -> u64 {
        self.max_key
    }

    /// Insert a key; returns `false` when the key is above the ceiling and was ignored.
    pub fn insert(&mut self, key: u64) -> bool {
        if key > self.max_key {
            self.ignored += 1;
            return false;
        }
        let word = (key / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (key % WORD_BITS);
        true
    }

    pub fn contains(&self, key: u64) -> bool {
        if key > self.max_key {
            return false;
        }
        let word = (key / WORD_BITS) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (key % WORD_BITS)) != 0)
    }

    pub fn union_with(&mut self, other: &KeySet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
        self.ignored += other.ignored;
    }

    pub fn intersect_with(&mut self, other: &KeySet) {
        self.words.truncate(other.words.len());
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
        self.ignored += other.ignored;
    }

    pub fn len(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Keys dropped for exceeding the ceiling.
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let base = i as u64 * WORD_BITS;
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }
}

/// Best rank score per join key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreMap {
    scores: FxHashMap<u64, Score>,
}

impl ScoreMap {
    pub fn record(&mut self, key: u64, score: Score) {
        self.scores
            .entry(key)
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }

    pub fn get(&self, key: u64) -> Option<Score> {
        self.scores.get(&key).copied()
    }

    pub fn merge(&mut self, other: ScoreMap) {
        for (key, score) in other.scores {
            self.record(key, score);
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Folds a rank-core score into a result document's score.
pub trait ScoreCombiner: Send + Sync + fmt::Debug {
    fn combine(&self, primary: Score, rank: Score) -> Score;
}

/// Default policy: plain sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdditiveCombiner;

impl ScoreCombiner for AdditiveCombiner {
    fn combine(&self, primary: Score, rank: Score) -> Score {
        primary + rank
    }
}

/// Weighted sum, for deployments that want rank cores to count less (or more).
#[derive(Debug, Clone, Copy)]
pub struct WeightedCombiner {
    pub rank_weight: f32,
}

impl ScoreCombiner for WeightedCombiner {
    fn combine(&self, primary: Score, rank: Score) -> Score {
        primary + self.rank_weight * rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn keys_above_ceiling_are_ignored() {
        let mut keys = KeySet::new(64);
        assert!(keys.insert(5));
        assert!(keys.insert(64));
        assert!(!keys.insert(100));
        assert!(keys.contains(5));
        assert!(keys.contains(64));
        assert!(!keys.contains(100));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.ignored(), 1);
    }

    #[test]
    fn unbounded_ceiling_is_capped() {
        let mut keys = KeySet::new(u64::MAX);
        assert_eq!(keys.max_key(), MAX_JOIN_KEY_LIMIT);
        assert!(!keys.insert(1 << 60));
        assert!(!keys.insert(u64::MAX));
        assert!(keys.insert(7));
        assert!(keys.words.len() <= 1);
        assert!(!keys.contains(1 << 60));
        assert_eq!(keys.ignored(), 2);
    }

    #[test]
    fn score_map_keeps_best_score() {
        let mut scores = ScoreMap::default();
        scores.record(1, 0.5);
        scores.record(1, 2.0);
        scores.record(1, 1.0);
        let mut other = ScoreMap::default();
        other.record(2, 3.0);
        scores.merge(other);
        assert_eq!(scores.get(1), Some(2.0));
        assert_eq!(scores.get(2), Some(3.0));
        assert_eq!(scores.get(3), None);
    }

    #[test]
    fn combiners() {
        assert_eq!(AdditiveCombiner.combine(1.0, 2.0), 3.0);
        assert_eq!(WeightedCombiner { rank_weight: 0.5 }.combine(1.0, 2.0), 2.0);
    }

    fn set_of(keys: &[u64]) -> KeySet {
        let mut set = KeySet::new(4096);
        for k in keys {
            set.insert(*k);
        }
        set
    }

    proptest! {
        #[test]
        fn set_algebra_matches_btreeset(
            a in proptest::collection::vec(0u64..4096, 0..64),
            b in proptest::collection::vec(0u64..4096, 0..64),
        ) {
            let ref_a: BTreeSet<u64> = a.iter().copied().collect();
            let ref_b: BTreeSet<u64> = b.iter().copied().collect();

            let mut union = set_of(&a);
            union.union_with(&set_of(&b));
            let expected: Vec<u64> = ref_a.union(&ref_b).copied().collect();
            prop_assert_eq!(union.iter().collect::<Vec<_>>(), expected);

            let mut inter = set_of(&a);
            inter.intersect_with(&set_of(&b));
            let expected: Vec<u64> = ref_a.intersection(&ref_b).copied().collect();
            prop_assert_eq!(inter.len(), expected.len() as u64);
            prop_assert_eq!(inter.iter().collect::<Vec<_>>(), expected);
            prop_assert_eq!(inter.is_empty(), ref_a.is_disjoint(&ref_b));
        }
    }
}
