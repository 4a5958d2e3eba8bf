//! # Eviction Policies
//!
//! Purpose: Decide which entries leave a full partition. The policy family
//! is closed (LRU, LFU, FIFO, Random, TTL-preferring), so it is a tagged
//! enum with direct dispatch rather than trait objects on the hot path.
//!
//! ## How selection composes across partitions
//!
//! Each partition asks its policy state for its own worst `count` entries,
//! tagged with an [`EvictScore`]. The engine merges the per-partition
//! candidates and evicts the globally smallest scores, which equals the
//! global worst set because per-partition top-k is a superset of any global
//! top-k restricted to that partition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::entry::CacheEntry;

/// Closed family of eviction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Oldest access evicted first.
    Lru,
    /// Lowest access count first, oldest access breaking ties.
    Lfu,
    /// Earliest insertion first.
    Fifo,
    /// Uniformly random victim.
    Random,
    /// Expired entries first, then LRU.
    TtlFirst,
}

impl EvictionPolicy {
    /// Parses the CLI/config token.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "lru" => Some(EvictionPolicy::Lru),
            "lfu" => Some(EvictionPolicy::Lfu),
            "fifo" => Some(EvictionPolicy::Fifo),
            "random" => Some(EvictionPolicy::Random),
            "ttl" => Some(EvictionPolicy::TtlFirst),
            _ => None,
        }
    }
}

/// Eviction priority; smaller evicts first. Fields: class, primary,
/// secondary. The class separates expired from live entries for the
/// TTL-preferring policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EvictScore(u8, u64, u64);

/// Per-partition policy state.
///
/// The tick clock is shared engine-wide so access order compares across
/// partitions: `on_add`/`on_access` stamp entries with monotonically
/// increasing ticks, which is what the ordered policies sort by.
/// `on_remove` is part of the hook contract; the current variants keep no
/// per-key state to unwind.
#[derive(Debug)]
pub struct PolicyState {
    policy: EvictionPolicy,
    clock: Arc<AtomicU64>,
    rng: SmallRng,
}

impl PolicyState {
    pub fn new(policy: EvictionPolicy, clock: Arc<AtomicU64>) -> Self {
        PolicyState {
            policy,
            clock,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Stamps a freshly inserted entry.
    pub fn on_add(&mut self, entry: &mut CacheEntry) {
        let tick = self.tick();
        entry.insert_tick = tick;
        entry.touch_tick = tick;
    }

    /// Stamps an access (read or policy-relevant touch).
    pub fn on_access(&mut self, entry: &mut CacheEntry) {
        entry.touch_tick = self.tick();
        entry.access_count += 1;
    }

    /// Removal hook; no per-key state today.
    pub fn on_remove(&mut self, _key: &[u8]) {}

    /// Proposes up to `count` victims from this partition, worst first.
    ///
    /// Returns the empty list when `count` is zero or the partition is
    /// empty; never fails.
    pub fn select_for_eviction(
        &mut self,
        entries: &HashMap<Arc<[u8]>, CacheEntry, RandomState>,
        count: usize,
        now: Instant,
    ) -> Vec<(EvictScore, Arc<[u8]>)> {
        if count == 0 || entries.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(EvictScore, Arc<[u8]>)> = entries
            .iter()
            .map(|(key, entry)| (self.score(entry, now), Arc::clone(key)))
            .collect();
        scored.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        scored.truncate(count);
        scored
    }

    fn score(&mut self, entry: &CacheEntry, now: Instant) -> EvictScore {
        match self.policy {
            EvictionPolicy::Lru => EvictScore(1, entry.touch_tick, 0),
            EvictionPolicy::Lfu => EvictScore(1, entry.access_count, entry.touch_tick),
            EvictionPolicy::Fifo => EvictScore(1, entry.insert_tick, 0),
            EvictionPolicy::Random => EvictScore(1, self.rng.gen(), 0),
            EvictionPolicy::TtlFirst => {
                if entry.is_expired(now) {
                    EvictScore(0, entry.touch_tick, 0)
                } else {
                    EvictScore(1, entry.touch_tick, 0)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryValue;
    use std::time::Duration;

    fn entry(now: Instant, ttl: Option<Duration>) -> CacheEntry {
        CacheEntry::new(EntryValue::Bytes(Arc::from(&b"v"[..])), ttl, now)
    }

    fn state(policy: EvictionPolicy) -> PolicyState {
        PolicyState::new(policy, Arc::new(AtomicU64::new(0)))
    }

    fn keyed(map: &mut HashMap<Arc<[u8]>, CacheEntry, RandomState>, key: &[u8], e: CacheEntry) {
        map.insert(Arc::from(key), e);
    }

    #[test]
    fn lru_picks_oldest_access() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::Lru);
        let mut map = HashMap::with_hasher(RandomState::new());

        for key in [&b"a"[..], b"b", b"c"] {
            let mut e = entry(now, None);
            state.on_add(&mut e);
            keyed(&mut map, key, e);
        }
        // Touch "a" so "b" becomes the oldest.
        if let Some(e) = map.get_mut(&b"a"[..]) {
            state.on_access(e);
        }

        let victims = state.select_for_eviction(&map, 1, now);
        assert_eq!(victims[0].1.as_ref(), b"b");
    }

    #[test]
    fn lfu_breaks_ties_by_oldest_access() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::Lfu);
        let mut map = HashMap::with_hasher(RandomState::new());

        for key in [&b"cold1"[..], b"cold2", b"hot"] {
            let mut e = entry(now, None);
            state.on_add(&mut e);
            keyed(&mut map, key, e);
        }
        if let Some(e) = map.get_mut(&b"hot"[..]) {
            state.on_access(e);
            state.on_access(e);
        }
        // cold2 was touched later than cold1 at equal counts.
        if let Some(e) = map.get_mut(&b"cold2"[..]) {
            e.touch_tick = 100;
        }

        let victims = state.select_for_eviction(&map, 2, now);
        assert_eq!(victims[0].1.as_ref(), b"cold1");
        assert_eq!(victims[1].1.as_ref(), b"cold2");
    }

    #[test]
    fn fifo_ignores_later_touches() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::Fifo);
        let mut map = HashMap::with_hasher(RandomState::new());

        for key in [&b"first"[..], b"second"] {
            let mut e = entry(now, None);
            state.on_add(&mut e);
            keyed(&mut map, key, e);
        }
        if let Some(e) = map.get_mut(&b"first"[..]) {
            state.on_access(e);
        }

        let victims = state.select_for_eviction(&map, 1, now);
        assert_eq!(victims[0].1.as_ref(), b"first");
    }

    #[test]
    fn ttl_first_prefers_expired_entries() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::TtlFirst);
        let mut map = HashMap::with_hasher(RandomState::new());

        let mut live = entry(now, None);
        state.on_add(&mut live);
        keyed(&mut map, b"live", live);

        let mut dead = entry(now, Some(Duration::from_millis(1)));
        state.on_add(&mut dead);
        keyed(&mut map, b"dead", dead);

        let later = now + Duration::from_millis(10);
        let victims = state.select_for_eviction(&map, 1, later);
        assert_eq!(victims[0].1.as_ref(), b"dead");
    }

    #[test]
    fn empty_partition_yields_no_victims() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::Random);
        let map: HashMap<Arc<[u8]>, CacheEntry, RandomState> =
            HashMap::with_hasher(RandomState::new());
        assert!(state.select_for_eviction(&map, 3, now).is_empty());
    }

    #[test]
    fn random_selects_requested_count() {
        let now = Instant::now();
        let mut state = state(EvictionPolicy::Random);
        let mut map = HashMap::with_hasher(RandomState::new());
        for i in 0..10u8 {
            let mut e = entry(now, None);
            state.on_add(&mut e);
            keyed(&mut map, &[b'k', i], e);
        }
        assert_eq!(state.select_for_eviction(&map, 4, now).len(), 4);
    }
}
