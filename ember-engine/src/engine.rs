//! # Cache Engine
//!
//! Thread-safe, in-process store for strings and sorted sets, bounded by a
//! configurable entry count with a pluggable eviction policy.
//!
//! ## Design Principles
//! 1. **Sharded Partitions**: Keys hash onto power-of-two partitions, each a
//!    map plus its own eviction-policy state behind one lock; readers and
//!    writers on different partitions never contend.
//! 2. **Lazy + Swept Expiry**: Expired entries vanish on access and in a
//!    periodic sweep that locks one partition at a time.
//! 3. **Atomic Statistics**: Counters are relaxed atomics; they may slightly
//!    undercount across races but never overcount.
//! 4. **Global Eviction From Local Proposals**: Each partition proposes its
//!    worst entries; the engine merges and removes the global worst, so a
//!    single hot partition cannot dodge its share of evictions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ember_common::{EmberError, EmberResult, EntryKind};

use crate::entry::{CacheEntry, EntryValue};
use crate::policy::{EvictionPolicy, PolicyState};
use crate::zset::SortedSet;

/// Partitions per logical CPU when auto-sizing.
const DEFAULT_PARTITION_MULTIPLIER: usize = 2;

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Partition count; 0 selects CPU count x 2, normalized to a power of
    /// two either way.
    pub partitions: usize,
    /// Maximum live entries across all partitions; `usize::MAX` disables
    /// eviction.
    pub capacity: usize,
    pub policy: EvictionPolicy,
    /// Cadence of the background expiration sweep.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            partitions: 0,
            capacity: usize::MAX,
            policy: EvictionPolicy::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// TTL state of a key, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key missing or already expired (`-2` on the wire).
    Missing,
    /// Key present without expiration (`-1` on the wire).
    NoExpiry,
    ExpiresIn(Duration),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

/// Serializable string entry for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStringEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Remaining TTL at capture time; `None` means no expiry.
    pub ttl_ms: Option<u64>,
}

/// Serializable sorted-set entry for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSetEntry {
    pub key: Vec<u8>,
    /// Pairs in total order.
    pub members: Vec<(Vec<u8>, f64)>,
    pub ttl_ms: Option<u64>,
}

/// Full engine state at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineImage {
    pub strings: Vec<ImageStringEntry>,
    pub sets: Vec<ImageSetEntry>,
}

struct PartitionInner {
    map: HashMap<Arc<[u8]>, CacheEntry, RandomState>,
    policy: PolicyState,
}

impl PartitionInner {
    /// Drops an entry that turned out to be expired. Returns true when a
    /// removal actually happened.
    fn drop_expired(&mut self, key: &[u8], now: Instant) -> bool {
        let expired = match self.map.get(key) {
            Some(entry) => entry.is_expired(now),
            None => false,
        };
        if expired {
            self.map.remove(key);
            self.policy.on_remove(key);
        }
        expired
    }
}

struct Partition {
    inner: RwLock<PartitionInner>,
}

/// Sharded cache engine.
pub struct CacheEngine {
    partitions: Vec<Partition>,
    partition_mask: usize,
    hash_state: RandomState,
    capacity: usize,
    /// Engine-wide access clock shared by every partition's policy state,
    /// so eviction order compares across partitions.
    clock: Arc<AtomicU64>,
    live: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl CacheEngine {
    pub fn new(config: EngineConfig) -> Self {
        let requested = if config.partitions == 0 {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
                .saturating_mul(DEFAULT_PARTITION_MULTIPLIER)
        } else {
            config.partitions
        };
        let partition_count = requested.max(1).next_power_of_two();

        let hash_state = RandomState::new();
        let clock = Arc::new(AtomicU64::new(0));
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            partitions.push(Partition {
                inner: RwLock::new(PartitionInner {
                    map: HashMap::with_hasher(hash_state.clone()),
                    policy: PolicyState::new(config.policy, Arc::clone(&clock)),
                }),
            });
        }

        CacheEngine {
            partitions,
            partition_mask: partition_count - 1,
            hash_state,
            capacity: config.capacity,
            clock,
            live: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Stores a string value, replacing any prior entry under the key.
    ///
    /// A bare `set` clears any previous TTL, matching Redis `SET`.
    pub fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> EmberResult<()> {
        validate_key(key)?;
        let now = Instant::now();
        let mut entry = CacheEntry::new(EntryValue::Bytes(Arc::from(value)), ttl, now);

        let partition = self.partition_for(key);
        {
            let mut inner = partition.inner.write();
            inner.policy.on_add(&mut entry);
            let replaced = inner.map.insert(Arc::from(key), entry).is_some();
            if replaced {
                inner.policy.on_remove(key);
            } else {
                self.live.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.evict_overflow();
        Ok(())
    }

    /// Looks a string value up, removing it when expired.
    pub fn get(&self, key: &[u8]) -> EmberResult<Option<Arc<[u8]>>> {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if !inner.map.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let PartitionInner { map, policy } = &mut *inner;
        let entry = map.get_mut(key).expect("entry exists");
        let value = match &entry.value {
            EntryValue::Bytes(bytes) => Arc::clone(bytes),
            EntryValue::Set(_) => return Err(EmberError::WrongType),
        };
        policy.on_access(entry);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Deletes a key of either kind. Expired entries count as absent.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        let Some(entry) = inner.map.remove(key) else {
            return false;
        };
        inner.policy.on_remove(key);
        self.live.fetch_sub(1, Ordering::Relaxed);
        if entry.is_expired(now) {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if !inner.map.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let PartitionInner { map, policy } = &mut *inner;
        if let Some(entry) = map.get_mut(key) {
            policy.on_access(entry);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remaining TTL for a key; expired keys are removed on the way.
    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if !inner.map.contains_key(key) {
            return TtlStatus::Missing;
        }
        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            return TtlStatus::Missing;
        }

        let remaining = inner.map.get(key).and_then(|entry| entry.remaining_ttl(now));
        match remaining {
            None => TtlStatus::NoExpiry,
            Some(remaining) => TtlStatus::ExpiresIn(remaining),
        }
    }

    /// Attaches a TTL to an existing key. Returns false when absent.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            return false;
        }
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    /// Clears any TTL. Returns true when a TTL was removed.
    pub fn persist(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            return false;
        }
        match inner.map.get_mut(key) {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        }
    }

    /// Drops every entry and resets the eviction state.
    pub fn flush(&self) {
        for partition in &self.partitions {
            let mut inner = partition.inner.write();
            let removed = inner.map.len();
            inner.map.clear();
            inner.policy = PolicyState::new(inner.policy.policy(), Arc::clone(&self.clock));
            self.live.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    /// Live (non-expired) keys across all partitions.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut out = Vec::new();
        for partition in &self.partitions {
            let inner = partition.inner.read();
            for (key, entry) in inner.map.iter() {
                if !entry.is_expired(now) {
                    out.push(key.to_vec());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    // ------------------------------------------------------------------
    // Sorted-set operations
    // ------------------------------------------------------------------

    /// Adds a member to the sorted set under `key`, creating the set on
    /// first use. Returns true when the member is new.
    pub fn zadd(&self, key: &[u8], member: &[u8], score: f64) -> EmberResult<bool> {
        validate_key(key)?;
        self.with_set_mut(key, |set| set.add(member, score))
    }

    /// Removes a member; the key itself is dropped when the set empties.
    pub fn zrem(&self, key: &[u8], member: &[u8]) -> EmberResult<bool> {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if !inner.map.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let removed;
        let emptied;
        {
            let PartitionInner { map, policy } = &mut *inner;
            let entry = map.get_mut(key).expect("entry exists");
            let EntryValue::Set(set) = &mut entry.value else {
                return Err(EmberError::WrongType);
            };
            removed = set.remove(member);
            emptied = set.is_empty();
            if !emptied {
                policy.on_access(entry);
            }
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        if emptied {
            inner.map.remove(key);
            inner.policy.on_remove(key);
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> EmberResult<Option<f64>> {
        self.with_set(key, |set| set.score(member)).map(Option::flatten)
    }

    pub fn zrank(&self, key: &[u8], member: &[u8]) -> EmberResult<Option<usize>> {
        self.with_set(key, |set| set.rank(member)).map(Option::flatten)
    }

    pub fn zrev_rank(&self, key: &[u8], member: &[u8]) -> EmberResult<Option<usize>> {
        self.with_set(key, |set| set.rev_rank(member))
            .map(Option::flatten)
    }

    /// Inclusive rank slice; absent keys yield the empty list.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> EmberResult<Vec<(Vec<u8>, f64)>> {
        self.with_set(key, |set| materialize(set.range_by_rank(start, stop)))
            .map(Option::unwrap_or_default)
    }

    pub fn zrev_range(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> EmberResult<Vec<(Vec<u8>, f64)>> {
        self.with_set(key, |set| materialize(set.rev_range_by_rank(start, stop)))
            .map(Option::unwrap_or_default)
    }

    pub fn zrange_by_score(
        &self,
        key: &[u8],
        min: f64,
        max: f64,
    ) -> EmberResult<Vec<(Vec<u8>, f64)>> {
        self.with_set(key, |set| materialize(set.range_by_score(min, max)))
            .map(Option::unwrap_or_default)
    }

    /// Increments a member's score, creating set and member as needed.
    pub fn zincr_by(&self, key: &[u8], member: &[u8], delta: f64) -> EmberResult<f64> {
        validate_key(key)?;
        self.with_set_mut(key, |set| set.incr_by(member, delta))
    }

    pub fn zcard(&self, key: &[u8]) -> EmberResult<usize> {
        self.with_set(key, |set| set.len())
            .map(Option::unwrap_or_default)
    }

    /// Drops a whole sorted set. Returns true when the key held one.
    pub fn zdel(&self, key: &[u8]) -> EmberResult<bool> {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        let (expired, is_set) = match inner.map.get(key) {
            Some(entry) => (entry.is_expired(now), entry.kind() == EntryKind::SortedSet),
            None => return Ok(false),
        };
        if !expired && !is_set {
            return Err(EmberError::WrongType);
        }

        inner.map.remove(key);
        inner.policy.on_remove(key);
        self.live.fetch_sub(1, Ordering::Relaxed);
        if expired {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Expiration sweep
    // ------------------------------------------------------------------

    /// Removes expired entries, one partition lock at a time.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for partition in &self.partitions {
            let mut inner = partition.inner.write();
            let expired: Vec<Arc<[u8]>> = inner
                .map
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| Arc::clone(key))
                .collect();
            for key in expired {
                inner.map.remove(key.as_ref());
                inner.policy.on_remove(key.as_ref());
                removed += 1;
            }
        }
        self.live.fetch_sub(removed, Ordering::Relaxed);
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Starts the periodic sweep thread; stop the handle on shutdown.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let engine = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let removed = engine.sweep_expired(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, "expiration sweep");
                }
            }
        });

        SweeperHandle {
            stop,
            join: Some(join),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot support
    // ------------------------------------------------------------------

    /// Captures the full live state. The caller is responsible for blocking
    /// writers if the image must correspond to a single log position.
    pub fn dump(&self) -> EngineImage {
        let now = Instant::now();
        let mut image = EngineImage::default();
        for partition in &self.partitions {
            let inner = partition.inner.read();
            for (key, entry) in inner.map.iter() {
                if entry.is_expired(now) {
                    continue;
                }
                let ttl_ms = entry
                    .remaining_ttl(now)
                    .map(|ttl| ttl.as_millis() as u64);
                match &entry.value {
                    EntryValue::Bytes(bytes) => image.strings.push(ImageStringEntry {
                        key: key.to_vec(),
                        value: bytes.to_vec(),
                        ttl_ms,
                    }),
                    EntryValue::Set(set) => image.sets.push(ImageSetEntry {
                        key: key.to_vec(),
                        members: set.dump(),
                        ttl_ms,
                    }),
                }
            }
        }
        image
    }

    /// Replaces the engine contents with an image (snapshot load path).
    pub fn restore(&self, image: &EngineImage) -> EmberResult<()> {
        self.flush();
        for record in &image.strings {
            let ttl = record.ttl_ms.map(Duration::from_millis);
            if matches!(ttl, Some(ttl) if ttl.is_zero()) {
                continue;
            }
            self.set(&record.key, &record.value, ttl)?;
        }
        for record in &image.sets {
            let ttl = record.ttl_ms.map(Duration::from_millis);
            if matches!(ttl, Some(ttl) if ttl.is_zero()) {
                continue;
            }
            for (member, score) in &record.members {
                self.zadd(&record.key, member, *score)?;
            }
            if let Some(ttl) = ttl {
                self.expire(&record.key, ttl);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn partition_for(&self, key: &[u8]) -> &Partition {
        use std::hash::{BuildHasher, Hasher};
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        &self.partitions[(hasher.finish() as usize) & self.partition_mask]
    }

    fn note_expired_removal(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-shaped access to a sorted set. `Ok(None)` means the key is
    /// absent or expired; a string key is a type error.
    fn with_set<R>(
        &self,
        key: &[u8],
        read: impl FnOnce(&SortedSet) -> R,
    ) -> EmberResult<Option<R>> {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut inner = partition.inner.write();

        if !inner.map.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if inner.drop_expired(key, now) {
            self.note_expired_removal();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let PartitionInner { map, policy } = &mut *inner;
        let entry = map.get_mut(key).expect("entry exists");
        let result = match &entry.value {
            EntryValue::Set(set) => read(set),
            EntryValue::Bytes(_) => return Err(EmberError::WrongType),
        };
        policy.on_access(entry);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(result))
    }

    /// Write-shaped access to the sorted set under `key`, creating an empty
    /// set for an absent key before running `write`.
    fn with_set_mut<R>(
        &self,
        key: &[u8],
        write: impl FnOnce(&mut SortedSet) -> EmberResult<R>,
    ) -> EmberResult<R> {
        let now = Instant::now();
        let partition = self.partition_for(key);
        let mut created = false;
        let result = {
            let mut inner = partition.inner.write();

            if inner.drop_expired(key, now) {
                self.note_expired_removal();
            }
            if !inner.map.contains_key(key) {
                let mut entry = CacheEntry::new(EntryValue::Set(SortedSet::new()), None, now);
                inner.policy.on_add(&mut entry);
                inner.map.insert(Arc::from(key), entry);
                self.live.fetch_add(1, Ordering::Relaxed);
                created = true;
            }

            let result;
            let emptied;
            {
                let PartitionInner { map, policy } = &mut *inner;
                let entry = map.get_mut(key).expect("entry exists");
                let EntryValue::Set(set) = &mut entry.value else {
                    return Err(EmberError::WrongType);
                };
                result = write(set);
                emptied = set.is_empty();
                if result.is_ok() && !emptied {
                    policy.on_access(entry);
                }
            }
            // A validation failure on the first member must not leave an
            // empty set behind.
            if created && emptied {
                inner.map.remove(key);
                inner.policy.on_remove(key);
                self.live.fetch_sub(1, Ordering::Relaxed);
                created = false;
            }
            result
        };

        if created {
            self.evict_overflow();
        }
        result
    }

    /// Evicts until the live count is back under capacity.
    fn evict_overflow(&self) {
        if self.capacity == usize::MAX {
            return;
        }
        let over = self.live.load(Ordering::Relaxed).saturating_sub(self.capacity);
        if over == 0 {
            return;
        }

        let now = Instant::now();
        let mut candidates = Vec::new();
        for (pidx, partition) in self.partitions.iter().enumerate() {
            let mut inner = partition.inner.write();
            let PartitionInner { map, policy } = &mut *inner;
            for (score, key) in policy.select_for_eviction(map, over, now) {
                candidates.push((score, pidx, key));
            }
        }
        candidates.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut evicted = 0;
        for (_, pidx, key) in candidates {
            if evicted == over {
                break;
            }
            let mut inner = self.partitions[pidx].inner.write();
            if inner.map.remove(key.as_ref()).is_some() {
                inner.policy.on_remove(key.as_ref());
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
    }
}

fn validate_key(key: &[u8]) -> EmberResult<()> {
    if key.is_empty() {
        return Err(EmberError::invalid("empty key"));
    }
    Ok(())
}

fn materialize(pairs: Vec<(Arc<[u8]>, f64)>) -> Vec<(Vec<u8>, f64)> {
    pairs
        .into_iter()
        .map(|(member, score)| (member.to_vec(), score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CacheEngine {
        CacheEngine::new(EngineConfig {
            partitions: 4,
            ..EngineConfig::default()
        })
    }

    fn capped(capacity: usize, policy: EvictionPolicy) -> CacheEngine {
        CacheEngine::new(EngineConfig {
            partitions: 1,
            capacity,
            policy,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn set_get_roundtrip() {
        let engine = engine();
        engine.set(b"alpha", b"value", None).unwrap();
        let value = engine.get(b"alpha").unwrap().unwrap();
        assert_eq!(&*value, b"value");
    }

    #[test]
    fn empty_key_is_rejected() {
        let engine = engine();
        assert!(engine.set(b"", b"v", None).is_err());
        assert!(engine.zadd(b"", b"m", 1.0).is_err());
    }

    #[test]
    fn delete_reports_prior_existence() {
        let engine = engine();
        engine.set(b"alpha", b"value", None).unwrap();
        assert!(engine.delete(b"alpha"));
        assert!(!engine.delete(b"alpha"));
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn ttl_states_match_redis_semantics() {
        let engine = engine();
        assert_eq!(engine.ttl(b"missing"), TtlStatus::Missing);

        engine.set(b"alpha", b"value", None).unwrap();
        assert_eq!(engine.ttl(b"alpha"), TtlStatus::NoExpiry);

        assert!(engine.expire(b"alpha", Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(engine.ttl(b"alpha"), TtlStatus::Missing);
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn set_with_ttl_expires() {
        let engine = engine();
        engine
            .set(b"alpha", b"value", Some(Duration::from_millis(5)))
            .unwrap();
        assert!(engine.get(b"alpha").unwrap().is_some());
        std::thread::sleep(Duration::from_millis(15));
        assert!(engine.get(b"alpha").unwrap().is_none());
    }

    #[test]
    fn replacement_clears_ttl() {
        let engine = engine();
        engine
            .set(b"alpha", b"old", Some(Duration::from_secs(100)))
            .unwrap();
        engine.set(b"alpha", b"new", None).unwrap();
        assert_eq!(engine.ttl(b"alpha"), TtlStatus::NoExpiry);
        assert_eq!(&*engine.get(b"alpha").unwrap().unwrap(), b"new");
    }

    #[test]
    fn persist_drops_ttl() {
        let engine = engine();
        engine
            .set(b"alpha", b"value", Some(Duration::from_secs(100)))
            .unwrap();
        assert!(engine.persist(b"alpha"));
        assert!(!engine.persist(b"alpha"));
        assert_eq!(engine.ttl(b"alpha"), TtlStatus::NoExpiry);
    }

    #[test]
    fn lru_eviction_keeps_recent_reads() {
        let engine = capped(3, EvictionPolicy::Lru);
        engine.set(b"a", b"1", None).unwrap();
        engine.set(b"b", b"2", None).unwrap();
        engine.set(b"c", b"3", None).unwrap();
        engine.get(b"a").unwrap();
        engine.set(b"d", b"4", None).unwrap();

        assert_eq!(engine.len(), 3);
        assert!(engine.get(b"b").unwrap().is_none());
        assert!(engine.get(b"a").unwrap().is_some());
        assert!(engine.get(b"c").unwrap().is_some());
        assert!(engine.get(b"d").unwrap().is_some());
    }

    #[test]
    fn lru_eviction_is_global_across_partitions() {
        let engine = CacheEngine::new(EngineConfig {
            partitions: 8,
            capacity: 3,
            policy: EvictionPolicy::Lru,
            ..EngineConfig::default()
        });
        engine.set(b"a", b"1", None).unwrap();
        engine.set(b"b", b"2", None).unwrap();
        engine.set(b"c", b"3", None).unwrap();
        engine.get(b"a").unwrap();
        engine.set(b"d", b"4", None).unwrap();

        // "b" is the globally least-recent entry even though the four keys
        // live in different partitions.
        assert_eq!(engine.len(), 3);
        assert!(engine.get(b"b").unwrap().is_none());
        assert!(engine.get(b"a").unwrap().is_some());
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let engine = capped(8, EvictionPolicy::Fifo);
        for i in 0..100u32 {
            engine
                .set(format!("key-{i}").as_bytes(), b"v", None)
                .unwrap();
            assert!(engine.len() <= 8);
        }
        assert_eq!(engine.stats().evictions, 92);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let engine = engine();
        engine
            .set(b"gone", b"v", Some(Duration::from_millis(1)))
            .unwrap();
        engine.set(b"kept", b"v", None).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let removed = engine.sweep_expired(Instant::now());
        assert_eq!(removed, 1);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().expirations, 1);
    }

    #[test]
    fn sweeper_thread_clears_expired() {
        let engine = Arc::new(engine());
        engine
            .set(b"gone", b"v", Some(Duration::from_millis(1)))
            .unwrap();
        let handle = engine.start_sweeper(Duration::from_millis(2));
        std::thread::sleep(Duration::from_millis(20));
        handle.stop();
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn zset_roundtrip_and_order() {
        let engine = engine();
        assert!(engine.zadd(b"board", b"alice", 10.0).unwrap());
        assert!(engine.zadd(b"board", b"bob", 20.0).unwrap());
        assert!(engine.zadd(b"board", b"carol", 15.0).unwrap());

        let range = engine.zrange(b"board", 0, -1).unwrap();
        let members: Vec<Vec<u8>> = range.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(
            members,
            vec![b"alice".to_vec(), b"carol".to_vec(), b"bob".to_vec()]
        );
        assert_eq!(engine.zcard(b"board").unwrap(), 3);
        assert_eq!(engine.zscore(b"board", b"carol").unwrap(), Some(15.0));
    }

    #[test]
    fn zrem_drops_empty_sets() {
        let engine = engine();
        engine.zadd(b"board", b"alice", 1.0).unwrap();
        assert!(engine.zrem(b"board", b"alice").unwrap());
        assert!(!engine.exists(b"board"));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn zdel_drops_whole_set() {
        let engine = engine();
        engine.zadd(b"board", b"alice", 1.0).unwrap();
        engine.zadd(b"board", b"bob", 2.0).unwrap();
        assert!(engine.zdel(b"board").unwrap());
        assert!(!engine.zdel(b"board").unwrap());
        assert_eq!(engine.len(), 0);

        engine.set(b"plain", b"v", None).unwrap();
        assert!(matches!(engine.zdel(b"plain"), Err(EmberError::WrongType)));
    }

    #[test]
    fn type_confusion_is_an_error() {
        let engine = engine();
        engine.set(b"plain", b"v", None).unwrap();
        assert!(matches!(
            engine.zadd(b"plain", b"m", 1.0),
            Err(EmberError::WrongType)
        ));
        engine.zadd(b"board", b"m", 1.0).unwrap();
        assert!(matches!(engine.get(b"board"), Err(EmberError::WrongType)));
    }

    #[test]
    fn zadd_rejecting_first_member_leaves_no_key() {
        let engine = engine();
        assert!(engine.zadd(b"board", b"m", f64::NAN).is_err());
        assert!(!engine.exists(b"board"));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn flush_resets_everything() {
        let engine = engine();
        engine.set(b"a", b"1", None).unwrap();
        engine.zadd(b"z", b"m", 1.0).unwrap();
        engine.flush();
        assert_eq!(engine.len(), 0);
        assert!(engine.keys().is_empty());
    }

    #[test]
    fn dump_and_restore_preserve_state() {
        let engine = engine();
        engine.set(b"a", b"1", None).unwrap();
        engine
            .set(b"t", b"2", Some(Duration::from_secs(60)))
            .unwrap();
        engine.zadd(b"board", b"alice", 10.0).unwrap();
        engine.zadd(b"board", b"bob", 20.0).unwrap();

        let image = engine.dump();
        let other = CacheEngine::new(EngineConfig::default());
        other.restore(&image).unwrap();

        assert_eq!(&*other.get(b"a").unwrap().unwrap(), b"1");
        assert_eq!(other.zcard(b"board").unwrap(), 2);
        assert!(matches!(other.ttl(b"t"), TtlStatus::ExpiresIn(_)));
        assert_eq!(other.len(), 3);
    }

    #[test]
    fn concurrent_writers_settle_on_one_value() {
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for worker in 0..8u8 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u32 {
                    engine
                        .set(b"contended", format!("{worker}-{i}").as_bytes(), None)
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let value = engine.get(b"contended").unwrap().unwrap();
        let text = String::from_utf8(value.to_vec()).unwrap();
        let (worker, i) = text.split_once('-').unwrap();
        assert!(worker.parse::<u8>().unwrap() < 8);
        assert_eq!(i.parse::<u32>().unwrap(), 199);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let engine = engine();
        engine.set(b"a", b"1", None).unwrap();
        engine.get(b"a").unwrap();
        engine.get(b"nope").unwrap();
        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
