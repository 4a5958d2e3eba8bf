//! # Sorted Set
//!
//! Member-to-score mapping with rank and score range queries, backed by a
//! hash map for point lookups and the skip index for ordered access.
//!
//! ## Design Principles
//! 1. **Two Views, One Truth**: The map owns membership; the index owns
//!    order. Every mutation updates both or neither.
//! 2. **Validate At The Edge**: Empty members and non-finite scores are
//!    rejected here so the index can assume clean input.
//! 3. **Redis Index Semantics**: Negative range bounds resolve from the
//!    tail; inverted ranges come back empty.

use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use ember_common::{EmberError, EmberResult};

use crate::skiplist::SkipIndex;

/// Collection of unique members, each carrying a finite f64 score.
#[derive(Debug, Default)]
pub struct SortedSet {
    members: HashMap<Arc<[u8]>, f64, RandomState>,
    index: SkipIndex,
}

impl SortedSet {
    pub fn new() -> Self {
        SortedSet {
            members: HashMap::with_hasher(RandomState::new()),
            index: SkipIndex::new(),
        }
    }

    /// Inserts or updates a member. Returns `true` when the member is new.
    pub fn add(&mut self, member: &[u8], score: f64) -> EmberResult<bool> {
        validate_member(member)?;
        validate_score(score)?;

        if let Some(&old) = self.members.get(member) {
            if old != score {
                self.index.remove(member, old);
                self.index.insert(Arc::from(member), score);
                self.members.insert(Arc::from(member), score);
            }
            return Ok(false);
        }

        let shared: Arc<[u8]> = Arc::from(member);
        self.index.insert(Arc::clone(&shared), score);
        self.members.insert(shared, score);
        Ok(true)
    }

    /// Removes a member. Returns `true` when it existed.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.members.remove(member) {
            Some(score) => {
                self.index.remove(member, score);
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.members.get(member).copied()
    }

    /// 0-based position in (score asc, member asc) order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        self.index.rank(member, score)
    }

    /// 0-based position from the highest score downward.
    pub fn rev_rank(&self, member: &[u8]) -> Option<usize> {
        self.rank(member).map(|r| self.len() - 1 - r)
    }

    /// Inclusive slice by rank; negative bounds count from the tail.
    pub fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(Arc<[u8]>, f64)> {
        let Some((start, stop)) = self.resolve_range(start, stop) else {
            return Vec::new();
        };
        self.index.range_by_rank(start, stop)
    }

    /// `range_by_rank` walked from the highest score.
    pub fn rev_range_by_rank(&self, start: i64, stop: i64) -> Vec<(Arc<[u8]>, f64)> {
        let Some((start, stop)) = self.resolve_range(start, stop) else {
            return Vec::new();
        };
        // A reverse slice [a, b] is the forward slice mirrored around the end.
        let len = self.len();
        let fwd_start = len - 1 - stop;
        let fwd_stop = len - 1 - start;
        let mut out = self.index.range_by_rank(fwd_start, fwd_stop);
        out.reverse();
        out
    }

    /// Members with `min <= score <= max` in forward order.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<(Arc<[u8]>, f64)> {
        self.index.range_by_score(min, max)
    }

    /// Adds `delta` to the member's score, seeding an absent member at
    /// `delta`. Returns the new score.
    pub fn incr_by(&mut self, member: &[u8], delta: f64) -> EmberResult<f64> {
        validate_member(member)?;
        validate_score(delta)?;
        let next = match self.members.get(member) {
            Some(&current) => {
                let next = current + delta;
                validate_score(next)?;
                next
            }
            None => delta,
        };
        self.add(member, next)?;
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All pairs in total order, for snapshots and replication dumps.
    pub fn dump(&self) -> Vec<(Vec<u8>, f64)> {
        self.index
            .iter()
            .map(|(member, score)| (member.to_vec(), score))
            .collect()
    }

    /// Maps possibly-negative inclusive bounds onto concrete ranks.
    fn resolve_range(&self, start: i64, stop: i64) -> Option<(usize, usize)> {
        let len = self.len() as i64;
        if len == 0 {
            return None;
        }
        let mut start = if start < 0 { len + start } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop >= len {
            stop = len - 1;
        }
        if start > stop || start >= len || stop < 0 {
            return None;
        }
        Some((start as usize, stop as usize))
    }
}

fn validate_member(member: &[u8]) -> EmberResult<()> {
    if member.is_empty() {
        return Err(EmberError::invalid("empty member"));
    }
    Ok(())
}

fn validate_score(score: f64) -> EmberResult<()> {
    if !score.is_finite() {
        return Err(EmberError::invalid("score is not a finite number"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> SortedSet {
        let mut set = SortedSet::new();
        set.add(b"alice", 10.0).unwrap();
        set.add(b"bob", 20.0).unwrap();
        set.add(b"carol", 15.0).unwrap();
        set
    }

    fn members(pairs: &[(Arc<[u8]>, f64)]) -> Vec<Vec<u8>> {
        pairs.iter().map(|(m, _)| m.to_vec()).collect()
    }

    #[test]
    fn add_reports_new_vs_update() {
        let mut set = SortedSet::new();
        assert!(set.add(b"alice", 1.0).unwrap());
        assert!(!set.add(b"alice", 2.0).unwrap());
        assert_eq!(set.score(b"alice"), Some(2.0));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn full_range_is_score_then_member_order() {
        let set = board();
        let all = set.range_by_rank(0, -1);
        assert_eq!(
            members(&all),
            vec![b"alice".to_vec(), b"carol".to_vec(), b"bob".to_vec()]
        );
        assert_eq!(all.len(), set.len());
    }

    #[test]
    fn negative_indices_resolve_from_tail() {
        let set = board();
        assert_eq!(members(&set.range_by_rank(-2, -1)), vec![b"carol".to_vec(), b"bob".to_vec()]);
        assert!(set.range_by_rank(2, 1).is_empty());
        assert!(set.range_by_rank(5, 9).is_empty());
    }

    #[test]
    fn rev_range_mirrors_forward() {
        let set = board();
        assert_eq!(
            members(&set.rev_range_by_rank(0, -1)),
            vec![b"bob".to_vec(), b"carol".to_vec(), b"alice".to_vec()]
        );
        assert_eq!(members(&set.rev_range_by_rank(0, 0)), vec![b"bob".to_vec()]);
    }

    #[test]
    fn ranks_forward_and_reverse() {
        let set = board();
        assert_eq!(set.rank(b"alice"), Some(0));
        assert_eq!(set.rank(b"bob"), Some(2));
        assert_eq!(set.rev_rank(b"bob"), Some(0));
        assert_eq!(set.rank(b"nobody"), None);
    }

    #[test]
    fn range_by_score_inclusive_bounds() {
        let set = board();
        assert_eq!(
            members(&set.range_by_score(10.0, 15.0)),
            vec![b"alice".to_vec(), b"carol".to_vec()]
        );
        assert!(set.range_by_score(16.0, 11.0).is_empty());
    }

    #[test]
    fn incr_by_seeds_absent_member() {
        let mut set = SortedSet::new();
        assert_eq!(set.incr_by(b"alice", 5.0).unwrap(), 5.0);
        assert_eq!(set.incr_by(b"alice", 2.5).unwrap(), 7.5);
        assert_eq!(set.score(b"alice"), Some(7.5));
    }

    #[test]
    fn rejects_nan_scores_and_empty_members() {
        let mut set = SortedSet::new();
        assert!(set.add(b"", 1.0).is_err());
        assert!(set.add(b"alice", f64::NAN).is_err());
        assert!(set.incr_by(b"alice", f64::INFINITY).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn remove_updates_both_views() {
        let mut set = board();
        assert!(set.remove(b"carol"));
        assert!(!set.remove(b"carol"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.rank(b"bob"), Some(1));
    }
}
