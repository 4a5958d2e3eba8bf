//! # Ordered-Score Index
//!
//! Probabilistic multi-level index over (member, score) pairs, ordered by
//! score ascending with member bytes as the tie-break. Backs the sorted-set
//! rank and range queries.
//!
//! ## Design Principles
//! 1. **Index-Based Arena**: Nodes live in a dense `Vec` and link by index,
//!    which keeps the structure safe (no raw pointers) and cache-friendly.
//! 2. **Rank Spans**: Every forward link carries the number of elements it
//!    jumps, so rank-of-member and member-at-rank stay O(log n).
//! 3. **Externally Locked**: Each index is owned by one sorted set behind
//!    its partition lock; the structure itself is single-writer.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Tower height cap; enough for far more members than a cache key holds.
const MAX_LEVEL: usize = 32;

/// Promotion probability for each additional level.
const PROMOTE_P: f64 = 0.5;

/// One element of the index.
#[derive(Debug)]
struct SkipNode {
    member: Arc<[u8]>,
    score: f64,
    /// Forward link per level (length = node height).
    next: Vec<Option<usize>>,
    /// Elements jumped by `next[i]`, counting the landing node.
    span: Vec<usize>,
}

/// Skip list keyed by (score, member).
///
/// Callers must not insert a member twice; the owning sorted set removes the
/// old (member, score) pair before re-adding on update.
#[derive(Debug)]
pub struct SkipIndex {
    nodes: Vec<Option<SkipNode>>,
    free: Vec<usize>,
    head_next: Vec<Option<usize>>,
    head_span: Vec<usize>,
    level: usize,
    len: usize,
    rng: SmallRng,
}

impl SkipIndex {
    pub fn new() -> Self {
        SkipIndex {
            nodes: Vec::new(),
            free: Vec::new(),
            head_next: vec![None; MAX_LEVEL],
            head_span: vec![0; MAX_LEVEL],
            level: 1,
            len: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a pair; the member must not already be present.
    pub fn insert(&mut self, member: Arc<[u8]>, score: f64) {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let (fwd, span) = self.forward(at, i);
                match fwd {
                    Some(n) if self.precedes(n, score, &member) => {
                        rank[i] += span;
                        at = Some(n);
                    }
                    _ => break,
                }
            }
            update[i] = at;
        }

        let height = self.random_level();
        if height > self.level {
            for i in self.level..height {
                rank[i] = 0;
                update[i] = None;
                self.head_span[i] = self.len;
            }
            self.level = height;
        }

        let idx = self.alloc(member, score, height);
        for i in 0..height {
            let (fwd, span) = self.forward(update[i], i);
            let jumped = rank[0] - rank[i];
            self.node_mut(idx).next[i] = fwd;
            self.node_mut(idx).span[i] = span - jumped;
            self.set_forward(update[i], i, Some(idx));
            self.set_span(update[i], i, jumped + 1);
        }
        for i in height..self.level {
            let (_, span) = self.forward(update[i], i);
            self.set_span(update[i], i, span + 1);
        }
        self.len += 1;
    }

    /// Removes the pair; both member and score must match.
    pub fn remove(&mut self, member: &[u8], score: f64) -> bool {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];

        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let (fwd, _) = self.forward(at, i);
                match fwd {
                    Some(n) if self.precedes(n, score, member) => at = Some(n),
                    _ => break,
                }
            }
            update[i] = at;
        }

        let (target, _) = self.forward(at, 0);
        let Some(idx) = target else { return false };
        {
            let node = self.node(idx);
            if node.score != score || node.member.as_ref() != member {
                return false;
            }
        }

        for i in 0..self.level {
            let (fwd, span) = self.forward(update[i], i);
            if fwd == Some(idx) {
                let node_span = self.node(idx).span[i];
                let node_next = self.node(idx).next[i];
                self.set_span(update[i], i, span + node_span - 1);
                self.set_forward(update[i], i, node_next);
            } else {
                self.set_span(update[i], i, span.saturating_sub(1));
            }
        }
        while self.level > 1 && self.head_next[self.level - 1].is_none() {
            self.level -= 1;
        }

        self.nodes[idx] = None;
        self.free.push(idx);
        self.len -= 1;
        true
    }

    /// Membership test for an exact (member, score) pair.
    pub fn contains(&self, member: &[u8], score: f64) -> bool {
        self.rank(member, score).is_some()
    }

    /// 0-based position of the pair in the total order.
    pub fn rank(&self, member: &[u8], score: f64) -> Option<usize> {
        let mut traversed = 0usize;
        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let (fwd, span) = self.forward(at, i);
                match fwd {
                    Some(n) if self.precedes_or_equal(n, score, member) => {
                        traversed += span;
                        at = Some(n);
                    }
                    _ => break,
                }
            }
        }
        let idx = at?;
        if self.node(idx).member.as_ref() == member {
            Some(traversed - 1)
        } else {
            None
        }
    }

    /// Pair at the 0-based rank.
    pub fn at_rank(&self, rank: usize) -> Option<(Arc<[u8]>, f64)> {
        if rank >= self.len {
            return None;
        }
        let target = rank + 1;
        let mut traversed = 0usize;
        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let (fwd, span) = self.forward(at, i);
                match fwd {
                    Some(n) if traversed + span <= target => {
                        traversed += span;
                        at = Some(n);
                    }
                    _ => break,
                }
            }
            if traversed == target {
                let node = self.node(at?);
                return Some((Arc::clone(&node.member), node.score));
            }
        }
        None
    }

    /// Inclusive rank slice; bounds must already be resolved and in range.
    pub fn range_by_rank(&self, start: usize, stop: usize) -> Vec<(Arc<[u8]>, f64)> {
        if start > stop || start >= self.len {
            return Vec::new();
        }
        let stop = stop.min(self.len - 1);
        let mut out = Vec::with_capacity(stop - start + 1);
        let mut cursor = self.index_at_rank(start);
        while let Some(idx) = cursor {
            let node = self.node(idx);
            out.push((Arc::clone(&node.member), node.score));
            if out.len() == stop - start + 1 {
                break;
            }
            cursor = node.next[0];
        }
        out
    }

    /// Members with `min <= score <= max`, in order.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<(Arc<[u8]>, f64)> {
        if min > max {
            return Vec::new();
        }
        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let (fwd, _) = self.forward(at, i);
                match fwd {
                    Some(n) if self.node(n).score < min => at = Some(n),
                    _ => break,
                }
            }
        }

        let mut out = Vec::new();
        let (mut cursor, _) = self.forward(at, 0);
        while let Some(idx) = cursor {
            let node = self.node(idx);
            if node.score > max {
                break;
            }
            out.push((Arc::clone(&node.member), node.score));
            cursor = node.next[0];
        }
        out
    }

    /// Forward iteration over the full order.
    pub fn iter(&self) -> SkipIter<'_> {
        SkipIter {
            index: self,
            cursor: self.head_next[0],
        }
    }

    fn index_at_rank(&self, rank: usize) -> Option<usize> {
        let target = rank + 1;
        let mut traversed = 0usize;
        let mut at: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let (fwd, span) = self.forward(at, i);
                match fwd {
                    Some(n) if traversed + span <= target => {
                        traversed += span;
                        at = Some(n);
                    }
                    _ => break,
                }
            }
            if traversed == target {
                return at;
            }
        }
        None
    }

    /// True when node `idx` orders strictly before (score, member).
    fn precedes(&self, idx: usize, score: f64, member: &[u8]) -> bool {
        let node = self.node(idx);
        match node.score.total_cmp(&score) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => node.member.as_ref() < member,
        }
    }

    fn precedes_or_equal(&self, idx: usize, score: f64, member: &[u8]) -> bool {
        let node = self.node(idx);
        match node.score.total_cmp(&score) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => node.member.as_ref() <= member,
        }
    }

    fn forward(&self, at: Option<usize>, level: usize) -> (Option<usize>, usize) {
        match at {
            None => (self.head_next[level], self.head_span[level]),
            Some(idx) => {
                let node = self.node(idx);
                (node.next[level], node.span[level])
            }
        }
    }

    fn set_forward(&mut self, at: Option<usize>, level: usize, to: Option<usize>) {
        match at {
            None => self.head_next[level] = to,
            Some(idx) => self.node_mut(idx).next[level] = to,
        }
    }

    fn set_span(&mut self, at: Option<usize>, level: usize, span: usize) {
        match at {
            None => self.head_span[level] = span,
            Some(idx) => self.node_mut(idx).span[level] = span,
        }
    }

    fn node(&self, idx: usize) -> &SkipNode {
        self.nodes[idx].as_ref().expect("node exists")
    }

    fn node_mut(&mut self, idx: usize) -> &mut SkipNode {
        self.nodes[idx].as_mut().expect("node exists")
    }

    fn alloc(&mut self, member: Arc<[u8]>, score: f64, height: usize) -> usize {
        let node = SkipNode {
            member,
            score,
            next: vec![None; height],
            span: vec![0; height],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < PROMOTE_P {
            level += 1;
        }
        level
    }
}

impl Default for SkipIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over (member, score) in total order.
pub struct SkipIter<'a> {
    index: &'a SkipIndex,
    cursor: Option<usize>,
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = (&'a [u8], f64);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.index.node(idx);
        self.cursor = node.next[0];
        Some((node.member.as_ref(), node.score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(member: &[u8]) -> Arc<[u8]> {
        Arc::from(member)
    }

    fn build(pairs: &[(&[u8], f64)]) -> SkipIndex {
        let mut index = SkipIndex::new();
        for (member, score) in pairs {
            index.insert(arc(member), *score);
        }
        index
    }

    #[test]
    fn orders_by_score_then_member() {
        let index = build(&[(b"bob", 20.0), (b"alice", 10.0), (b"carol", 15.0), (b"dave", 15.0)]);
        let order: Vec<Vec<u8>> = index.iter().map(|(m, _)| m.to_vec()).collect();
        assert_eq!(
            order,
            vec![
                b"alice".to_vec(),
                b"carol".to_vec(),
                b"dave".to_vec(),
                b"bob".to_vec()
            ]
        );
    }

    #[test]
    fn rank_matches_iteration_order() {
        let index = build(&[(b"a", 3.0), (b"b", 1.0), (b"c", 2.0)]);
        assert_eq!(index.rank(b"b", 1.0), Some(0));
        assert_eq!(index.rank(b"c", 2.0), Some(1));
        assert_eq!(index.rank(b"a", 3.0), Some(2));
        assert_eq!(index.rank(b"z", 9.0), None);
        assert!(index.contains(b"a", 3.0));
        assert!(!index.contains(b"a", 4.0));
    }

    #[test]
    fn at_rank_and_range_by_rank_agree() {
        let index = build(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0), (b"d", 4.0)]);
        assert_eq!(index.at_rank(2).map(|(m, _)| m.to_vec()), Some(b"c".to_vec()));
        assert_eq!(index.at_rank(4), None);

        let slice = index.range_by_rank(1, 2);
        let members: Vec<Vec<u8>> = slice.iter().map(|(m, _)| m.to_vec()).collect();
        assert_eq!(members, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn range_by_score_is_inclusive() {
        let index = build(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0)]);
        let members: Vec<Vec<u8>> = index
            .range_by_score(2.0, 3.0)
            .iter()
            .map(|(m, _)| m.to_vec())
            .collect();
        assert_eq!(members, vec![b"b".to_vec(), b"c".to_vec()]);
        assert!(index.range_by_score(5.0, 1.0).is_empty());
    }

    #[test]
    fn remove_keeps_ranks_consistent() {
        let mut index = build(&[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0)]);
        assert!(index.remove(b"b", 2.0));
        assert!(!index.remove(b"b", 2.0));
        assert_eq!(index.len(), 2);
        assert_eq!(index.rank(b"c", 3.0), Some(1));
        assert_eq!(index.at_rank(0).map(|(m, _)| m.to_vec()), Some(b"a".to_vec()));
    }

    #[test]
    fn remove_requires_matching_score() {
        let mut index = build(&[(b"a", 1.0)]);
        assert!(!index.remove(b"a", 2.0));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn survives_mixed_churn() {
        let mut index = SkipIndex::new();
        for i in 0..500u32 {
            index.insert(arc(format!("m{i:03}").as_bytes()), (i % 50) as f64);
        }
        for i in (0..500u32).step_by(2) {
            assert!(index.remove(format!("m{i:03}").as_bytes(), (i % 50) as f64));
        }
        assert_eq!(index.len(), 250);

        // Every survivor is observable at its reported rank.
        let mut seen = 0;
        for (member, score) in index.iter() {
            let rank = index.rank(member, score).unwrap();
            let (at, _) = index.at_rank(rank).unwrap();
            assert_eq!(at.as_ref(), member);
            seen += 1;
        }
        assert_eq!(seen, 250);
    }
}
