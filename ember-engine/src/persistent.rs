//! # Persistent Engine
//!
//! Composes the cache engine with a write-ahead log and snapshot store.
//! Write path: validate, append to the WAL (blocking until the durability
//! policy is satisfied), then mutate memory. Read path: memory only, via
//! [`PersistentEngine::engine`].
//!
//! ## Recovery
//!
//! On open with persistence enabled: load the newest snapshot if one
//! exists, then replay the WAL on top of it. Any failure here is fatal to
//! the process (exit code 2 at the binary layer); a half-recovered node
//! must not serve traffic.
//!
//! ## Snapshot consistency
//!
//! Writers take the snapshot gate shared; `snapshot_now` takes it
//! exclusive across dump-and-truncate, so every image corresponds to
//! exactly one log sequence and truncation never discards an unsnapshotted
//! record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use ember_common::config::DurabilityConfig;
use ember_common::types::NodeId;
use ember_common::{EmberError, EmberResult, EntryKind};

use crate::engine::{CacheEngine, EngineConfig, TtlStatus};
use crate::snapshot::SnapshotStore;
use crate::wal::{DurabilityPolicy, Wal, WalOp, WalPayload, WalRecord};

/// Cache engine with optional durability.
pub struct PersistentEngine {
    node_id: NodeId,
    engine: Arc<CacheEngine>,
    wal: Option<Wal>,
    wal_path: PathBuf,
    snapshots: Option<SnapshotStore>,
    /// Shared by writers, exclusive for dump-and-truncate.
    snapshot_gate: RwLock<()>,
    /// Serializes increment-then-log pairs so WAL order matches the order
    /// the increments were applied in.
    incr_lock: Mutex<()>,
    recovering: AtomicBool,
}

/// Handle for the background snapshot scheduler thread.
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl PersistentEngine {
    /// Builds the engine, running crash recovery when persistence is on.
    pub fn open(
        node_id: NodeId,
        engine_config: EngineConfig,
        durability: &DurabilityConfig,
    ) -> EmberResult<Self> {
        let engine = Arc::new(CacheEngine::new(engine_config));

        if !durability.enabled {
            return Ok(PersistentEngine {
                node_id,
                engine,
                wal: None,
                wal_path: PathBuf::new(),
                snapshots: None,
                snapshot_gate: RwLock::new(()),
                incr_lock: Mutex::new(()),
                recovering: AtomicBool::new(false),
            });
        }

        let wal_path = durability.wal_path(&node_id);
        let snapshots = SnapshotStore::new(
            &durability.snapshot_dir(&node_id),
            node_id.clone(),
            durability.snapshot_retain,
            durability.max_snapshot_bytes,
        )?;

        let this = PersistentEngine {
            node_id,
            engine,
            wal: None,
            wal_path: wal_path.clone(),
            snapshots: Some(snapshots),
            snapshot_gate: RwLock::new(()),
            incr_lock: Mutex::new(()),
            recovering: AtomicBool::new(true),
        };

        let last_seq = this.recover()?;
        this.recovering.store(false, Ordering::Release);

        let policy = DurabilityPolicy {
            flush_each_write: true,
            fsync_interval: durability.wal_fsync_interval,
        };
        let wal = Wal::open(&wal_path, policy, last_seq)?;

        Ok(PersistentEngine { wal: Some(wal), ..this })
    }

    /// Snapshot load + WAL replay. Returns the last applied sequence.
    fn recover(&self) -> EmberResult<u64> {
        let snapshots = self.snapshots.as_ref().expect("persistence enabled");

        let snapshot_lsn = match snapshots.latest().map_err(recovery_err)? {
            Some(meta) => {
                let lsn = snapshots
                    .load(&meta.path, &self.engine)
                    .map_err(recovery_err)?;
                tracing::info!(
                    node = %self.node_id,
                    path = %meta.path.display(),
                    lsn,
                    "snapshot loaded"
                );
                lsn
            }
            None => 0,
        };

        // Truncation restarts sequence numbering, so the log on disk is
        // normally the pure post-snapshot tail. A crash between snapshot
        // and truncate instead leaves exactly the records the snapshot
        // covers; replaying those over the image is harmless because every
        // record is an absolute-state operation. Either way, every frame
        // gets applied.
        let engine = Arc::clone(&self.engine);
        let report = Wal::replay(&self.wal_path, |record| {
            apply_record(&engine, &record);
        })
        .map_err(recovery_err)?;

        if report.applied > 0 || report.skipped > 0 {
            tracing::info!(
                node = %self.node_id,
                snapshot_lsn,
                applied = report.applied,
                skipped = report.skipped,
                last_seq = report.last_seq,
                "wal replay complete"
            );
        }
        // Appends continue the file's own numbering to keep one log
        // lifetime gap-free.
        Ok(report.last_seq)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Direct access for the read path and stats.
    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    /// Shared handle, for spawning the engine's background sweeper.
    pub fn engine_arc(&self) -> Arc<CacheEngine> {
        Arc::clone(&self.engine)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn persistence_enabled(&self) -> bool {
        self.wal.is_some()
    }

    // ------------------------------------------------------------------
    // Write path (WAL first, memory second)
    // ------------------------------------------------------------------

    pub fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> EmberResult<()> {
        validate_key(key)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::Set,
                key,
                WalPayload::Write {
                    kind: EntryKind::String,
                    value: value.to_vec(),
                    ttl_sec: ttl_to_sec(ttl),
                },
            )?;
        }
        self.engine.set(key, value, ttl)
    }

    pub fn delete(&self, key: &[u8]) -> EmberResult<bool> {
        validate_key(key)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::Delete,
                key,
                WalPayload::Write {
                    kind: EntryKind::String,
                    value: Vec::new(),
                    ttl_sec: -1,
                },
            )?;
        }
        Ok(self.engine.delete(key))
    }

    pub fn expire(&self, key: &[u8], ttl: Duration) -> EmberResult<bool> {
        validate_key(key)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::Expire,
                key,
                WalPayload::Write {
                    kind: EntryKind::String,
                    value: Vec::new(),
                    ttl_sec: ttl.as_secs() as i64,
                },
            )?;
        }
        Ok(self.engine.expire(key, ttl))
    }

    /// TTL removal is logged as EXPIRE with `-1`.
    pub fn persist_key(&self, key: &[u8]) -> EmberResult<bool> {
        validate_key(key)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::Expire,
                key,
                WalPayload::Write {
                    kind: EntryKind::String,
                    value: Vec::new(),
                    ttl_sec: -1,
                },
            )?;
        }
        Ok(self.engine.persist(key))
    }

    pub fn zadd(&self, key: &[u8], member: &[u8], score: f64) -> EmberResult<bool> {
        validate_key(key)?;
        validate_member(member)?;
        validate_score(score)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::ZAdd,
                key,
                WalPayload::Member {
                    member: member.to_vec(),
                    score,
                },
            )?;
        }
        self.engine.zadd(key, member, score)
    }

    pub fn zrem(&self, key: &[u8], member: &[u8]) -> EmberResult<bool> {
        validate_key(key)?;
        validate_member(member)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::ZRem,
                key,
                WalPayload::Member {
                    member: member.to_vec(),
                    score: 0.0,
                },
            )?;
        }
        self.engine.zrem(key, member)
    }

    /// Increments under the engine's partition lock, then logs the
    /// resulting score as a plain ZADD upsert for replay.
    ///
    /// The serial lock keeps log order aligned with increment order across
    /// concurrent callers. A WAL failure after the increment still fails
    /// the call and poisons the log, so the unlogged score can never be
    /// followed by an acknowledged write.
    pub fn zincr_by(&self, key: &[u8], member: &[u8], delta: f64) -> EmberResult<f64> {
        validate_key(key)?;
        validate_member(member)?;
        validate_score(delta)?;

        let _serial = self.incr_lock.lock();
        let _gate = self.snapshot_gate.read();
        let next = self.engine.zincr_by(key, member, delta)?;
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::ZAdd,
                key,
                WalPayload::Member {
                    member: member.to_vec(),
                    score: next,
                },
            )?;
        }
        Ok(next)
    }

    /// Drops a whole sorted set; logged as DELETE.
    pub fn zdel(&self, key: &[u8]) -> EmberResult<bool> {
        validate_key(key)?;
        let _gate = self.snapshot_gate.read();
        if let Some(wal) = &self.wal {
            wal.append(
                WalOp::Delete,
                key,
                WalPayload::Write {
                    kind: EntryKind::SortedSet,
                    value: Vec::new(),
                    ttl_sec: -1,
                },
            )?;
        }
        self.engine.zdel(key)
    }

    /// Clears everything; durable emptiness comes from the fresh snapshot
    /// plus the truncated WAL, not from a logged record.
    pub fn flush(&self) -> EmberResult<()> {
        self.engine.flush();
        if self.persistence_enabled() {
            self.snapshot_now()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Dumps the engine at the current LSN and truncates the WAL.
    pub fn snapshot_now(&self) -> EmberResult<Option<PathBuf>> {
        let (Some(wal), Some(snapshots)) = (&self.wal, &self.snapshots) else {
            return Ok(None);
        };
        let _gate = self.snapshot_gate.write();
        let lsn = wal.current_seq();
        let path = snapshots.create(&self.engine, lsn)?;
        wal.truncate()?;
        Ok(Some(path))
    }

    /// Starts the periodic snapshot thread.
    pub fn start_snapshot_scheduler(self: &Arc<Self>, interval: Duration) -> SchedulerHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let this = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if stop_thread.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = this.snapshot_now() {
                    tracing::error!(error = %err, "scheduled snapshot failed");
                }
            }
        });

        SchedulerHandle {
            stop,
            join: Some(join),
        }
    }

    /// Final snapshot plus WAL sync; call once, on the way down.
    pub fn shutdown(&self) {
        if let Err(err) = self.snapshot_now() {
            tracing::warn!(error = %err, "shutdown snapshot failed");
        }
        if let Some(wal) = &self.wal {
            if let Err(err) = wal.close() {
                tracing::warn!(error = %err, "wal close failed");
            }
        }
    }

    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        self.engine.ttl(key)
    }
}

/// Applies one replayed record as if it were an original engine call.
fn apply_record(engine: &CacheEngine, record: &WalRecord) {
    let outcome: EmberResult<()> = match (&record.op, &record.payload) {
        (WalOp::Set, WalPayload::Write { value, ttl_sec, .. }) => {
            engine.set(&record.key, value, sec_to_ttl(*ttl_sec))
        }
        (WalOp::Delete, WalPayload::Write { .. }) => {
            engine.delete(&record.key);
            Ok(())
        }
        (WalOp::Expire, WalPayload::Write { ttl_sec, .. }) => {
            if *ttl_sec < 0 {
                engine.persist(&record.key);
            } else {
                engine.expire(&record.key, Duration::from_secs(*ttl_sec as u64));
            }
            Ok(())
        }
        (WalOp::ZAdd, WalPayload::Member { member, score }) => {
            engine.zadd(&record.key, member, *score).map(|_| ())
        }
        (WalOp::ZRem, WalPayload::Member { member, .. }) => {
            engine.zrem(&record.key, member).map(|_| ())
        }
        _ => Err(EmberError::Corrupt("op/payload mismatch".into())),
    };
    if let Err(err) = outcome {
        tracing::warn!(seq = record.seq, error = %err, "skipping unreplayable record");
    }
}

fn recovery_err(err: EmberError) -> EmberError {
    EmberError::Recovery(err.to_string())
}

fn ttl_to_sec(ttl: Option<Duration>) -> i64 {
    ttl.map(|d| d.as_secs() as i64).unwrap_or(-1)
}

fn sec_to_ttl(ttl_sec: i64) -> Option<Duration> {
    (ttl_sec >= 0).then(|| Duration::from_secs(ttl_sec as u64))
}

fn validate_key(key: &[u8]) -> EmberResult<()> {
    if key.is_empty() {
        return Err(EmberError::invalid("empty key"));
    }
    Ok(())
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

    fn durable_config(dir: &std::path::Path) -> DurabilityConfig {
        DurabilityConfig {
            enabled: true,
            data_dir: dir.to_path_buf(),
            wal_fsync_interval: Duration::ZERO,
            ..DurabilityConfig::default()
        }
    }

    fn small_engine_config() -> EngineConfig {
        EngineConfig {
            partitions: 2,
            ..EngineConfig::default()
        }
    }

    fn open(dir: &std::path::Path) -> PersistentEngine {
        PersistentEngine::open(
            NodeId::from("node-1"),
            small_engine_config(),
            &durable_config(dir),
        )
        .unwrap()
    }

    #[test]
    fn writes_survive_reopen_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set(b"x", b"1", None).unwrap();
            store.zadd(b"board", b"alice", 10.0).unwrap();
            // No snapshot, no graceful shutdown: recovery must come from
            // the WAL alone.
        }

        let store = open(dir.path());
        assert_eq!(&*store.engine().get(b"x").unwrap().unwrap(), b"1");
        assert_eq!(store.engine().zscore(b"board", b"alice").unwrap(), Some(10.0));
    }

    #[test]
    fn deletes_and_expires_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set(b"kept", b"1", None).unwrap();
            store.set(b"gone", b"2", None).unwrap();
            store.delete(b"gone").unwrap();
            store.set(b"brief", b"3", None).unwrap();
            store.expire(b"brief", Duration::from_secs(600)).unwrap();
        }

        let store = open(dir.path());
        assert!(store.engine().get(b"kept").unwrap().is_some());
        assert!(store.engine().get(b"gone").unwrap().is_none());
        assert!(matches!(store.ttl(b"brief"), TtlStatus::ExpiresIn(_)));
    }

    #[test]
    fn snapshot_plus_tail_replay_matches_pre_crash_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set(b"a", b"1", None).unwrap();
            store.zadd(b"board", b"alice", 1.0).unwrap();
            store.snapshot_now().unwrap();
            // Writes after the snapshot live only in the WAL tail.
            store.set(b"b", b"2", None).unwrap();
            store.zincr_by(b"board", b"alice", 4.0).unwrap();
        }

        let store = open(dir.path());
        assert_eq!(&*store.engine().get(b"a").unwrap().unwrap(), b"1");
        assert_eq!(&*store.engine().get(b"b").unwrap().unwrap(), b"2");
        assert_eq!(store.engine().zscore(b"board", b"alice").unwrap(), Some(5.0));
    }

    #[test]
    fn flush_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set(b"x", b"1", None).unwrap();
            store.flush().unwrap();
        }

        let store = open(dir.path());
        assert!(store.engine().get(b"x").unwrap().is_none());
        assert_eq!(store.engine().len(), 0);
    }

    #[test]
    fn zincr_replays_as_absolute_score() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.zincr_by(b"board", b"alice", 2.5).unwrap();
            store.zincr_by(b"board", b"alice", 2.5).unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.engine().zscore(b"board", b"alice").unwrap(), Some(5.0));
    }

    #[test]
    fn corrupt_snapshot_fails_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.set(b"x", b"1", None).unwrap();
            store.snapshot_now().unwrap();
        }
        // Clobber the snapshot body.
        let snap_dir = durable_config(dir.path()).snapshot_dir(&NodeId::from("node-1"));
        let snapshot = std::fs::read_dir(snap_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(&snapshot, b"garbage").unwrap();

        let result = PersistentEngine::open(
            NodeId::from("node-1"),
            small_engine_config(),
            &durable_config(dir.path()),
        );
        assert!(matches!(result, Err(EmberError::Recovery(_))));
    }

    #[test]
    fn disabled_persistence_keeps_everything_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = DurabilityConfig {
            enabled: false,
            data_dir: dir.path().to_path_buf(),
            ..DurabilityConfig::default()
        };
        let store =
            PersistentEngine::open(NodeId::from("node-1"), small_engine_config(), &config).unwrap();
        store.set(b"x", b"1", None).unwrap();
        assert!(!store.persistence_enabled());
        assert!(dir.path().join("node-1").metadata().is_err());
    }
}
