//! # Snapshot Store
//!
//! Point-in-time engine dumps with retention. One snapshot is one file,
//! `<nodeId>_<epochMs>.snapshot`: a 16-byte magic+version header, the
//! 8-byte big-endian log sequence the image corresponds to, then two
//! length-prefixed bincode sections (string entries, sorted sets).
//!
//! ## Design Principles
//! 1. **Write Aside, Rename In**: Dumps go to a `.tmp` sibling, fsync, then
//!    rename, so a crash mid-dump never leaves a readable half-snapshot.
//! 2. **Single-LSN Images**: The caller (persistent engine) blocks writers
//!    across dump-and-truncate; the store just records the LSN it is given.
//! 3. **Bounded Retention**: `retain` keeps the newest k files and deletes
//!    the rest immediately.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use ember_common::types::NodeId;
use ember_common::{EmberError, EmberResult};

use crate::engine::{CacheEngine, EngineImage};
use crate::wal::epoch_ms;

const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBRSNAP";
const SNAPSHOT_VERSION: u32 = 1;

/// A snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub path: PathBuf,
    pub ts_ms: u64,
}

/// Snapshot directory manager for one node.
pub struct SnapshotStore {
    dir: PathBuf,
    node_id: NodeId,
    retain: usize,
    max_body_bytes: Option<u64>,
}

impl SnapshotStore {
    pub fn new(
        dir: &Path,
        node_id: NodeId,
        retain: usize,
        max_body_bytes: Option<u64>,
    ) -> EmberResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(SnapshotStore {
            dir: dir.to_path_buf(),
            node_id,
            retain: retain.max(1),
            max_body_bytes,
        })
    }

    /// Captures the engine image at `lsn` and persists it durably.
    ///
    /// Returns the final snapshot path. Retention runs before returning.
    pub fn create(&self, engine: &CacheEngine, lsn: u64) -> EmberResult<PathBuf> {
        let image = engine.dump();
        let strings = bincode::serialize(&image.strings)
            .map_err(|err| EmberError::Corrupt(format!("snapshot encode: {err}")))?;
        let sets = bincode::serialize(&image.sets)
            .map_err(|err| EmberError::Corrupt(format!("snapshot encode: {err}")))?;

        let body_len = (strings.len() + sets.len()) as u64;
        if let Some(cap) = self.max_body_bytes {
            if body_len > cap {
                return Err(EmberError::Durability(format!(
                    "snapshot body {body_len} bytes exceeds cap {cap}"
                )));
            }
        }

        let mut ts = epoch_ms();
        let mut path = self.path_for(ts);
        while path.exists() {
            ts += 1;
            path = self.path_for(ts);
        }
        let tmp = path.with_extension("snapshot.tmp");

        {
            let mut file = File::create(&tmp)?;
            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_u32::<BigEndian>(SNAPSHOT_VERSION)?;
            file.write_u32::<BigEndian>(0)?; // reserved
            file.write_u64::<BigEndian>(lsn)?;
            file.write_u64::<BigEndian>(strings.len() as u64)?;
            file.write_all(&strings)?;
            file.write_u64::<BigEndian>(sets.len() as u64)?;
            file.write_all(&sets)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        let removed = self.retain()?;
        tracing::info!(
            path = %path.display(),
            lsn,
            entries = image.strings.len() + image.sets.len(),
            removed,
            "snapshot written"
        );
        Ok(path)
    }

    /// Newest snapshot by embedded timestamp, if any.
    pub fn latest(&self) -> EmberResult<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().max_by_key(|meta| meta.ts_ms))
    }

    /// All snapshots for this node, unordered.
    pub fn list(&self) -> EmberResult<Vec<SnapshotMeta>> {
        let mut out = Vec::new();
        let prefix = format!("{}_", self.node_id);
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".snapshot") else {
                continue;
            };
            let Some(ts) = stem.strip_prefix(&prefix) else {
                continue;
            };
            if let Ok(ts_ms) = ts.parse::<u64>() {
                out.push(SnapshotMeta { path, ts_ms });
            }
        }
        Ok(out)
    }

    /// Clears the engine and restores the snapshot. Returns the LSN the
    /// image corresponds to.
    pub fn load(&self, path: &Path, engine: &CacheEngine) -> EmberResult<u64> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(EmberError::Corrupt(format!(
                "{}: bad snapshot magic",
                path.display()
            )));
        }
        let version = file.read_u32::<BigEndian>()?;
        if version != SNAPSHOT_VERSION {
            return Err(EmberError::Corrupt(format!(
                "{}: unsupported snapshot version {version}",
                path.display()
            )));
        }
        let _reserved = file.read_u32::<BigEndian>()?;
        let lsn = file.read_u64::<BigEndian>()?;

        let strings = read_section(&mut file, path)?;
        let sets = read_section(&mut file, path)?;
        let image = EngineImage {
            strings: bincode::deserialize(&strings)
                .map_err(|err| EmberError::Corrupt(format!("{}: {err}", path.display())))?,
            sets: bincode::deserialize(&sets)
                .map_err(|err| EmberError::Corrupt(format!("{}: {err}", path.display())))?,
        };

        engine.restore(&image)?;
        Ok(lsn)
    }

    /// Deletes all but the newest `retain` snapshots. Returns how many were
    /// removed.
    pub fn retain(&self) -> EmberResult<usize> {
        let mut snapshots = self.list()?;
        if snapshots.len() <= self.retain {
            return Ok(0);
        }
        snapshots.sort_by_key(|meta| std::cmp::Reverse(meta.ts_ms));
        let stale = snapshots.split_off(self.retain);
        let removed = stale.len();
        for meta in stale {
            std::fs::remove_file(&meta.path)?;
        }
        Ok(removed)
    }

    fn path_for(&self, ts_ms: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.snapshot", self.node_id, ts_ms))
    }
}

fn read_section(file: &mut File, path: &Path) -> EmberResult<Vec<u8>> {
    let len = file.read_u64::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).map_err(|_| {
        EmberError::Corrupt(format!("{}: truncated snapshot section", path.display()))
    })?;
    Ok(buf)
}
