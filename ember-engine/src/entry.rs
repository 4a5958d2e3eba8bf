//! # Cache Entry
//!
//! One stored value plus the metadata the TTL machinery and the eviction
//! policies read: creation/access ordering ticks, access count, expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_common::EntryKind;

use crate::zset::SortedSet;

/// Payload of a cache entry.
#[derive(Debug)]
pub enum EntryValue {
    Bytes(Arc<[u8]>),
    Set(SortedSet),
}

/// Stored entry with TTL and access metadata.
///
/// `insert_tick` / `touch_tick` are per-partition logical clocks assigned by
/// the eviction policy hooks; wall-clock fields serve TTL and stats.
#[derive(Debug)]
pub struct CacheEntry {
    pub value: EntryValue,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub access_count: u64,
    pub insert_tick: u64,
    pub touch_tick: u64,
}

impl CacheEntry {
    pub fn new(value: EntryValue, ttl: Option<Duration>, now: Instant) -> Self {
        CacheEntry {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            access_count: 0,
            insert_tick: 0,
            touch_tick: 0,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.value {
            EntryValue::Bytes(_) => EntryKind::String,
            EntryValue::Set(_) => EntryKind::SortedSet,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Remaining TTL, `None` when the entry does not expire.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|deadline| deadline.saturating_duration_since(now))
    }
}
