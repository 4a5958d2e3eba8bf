//! # Write-Ahead Log
//!
//! Append-only log of committed mutations, one file per engine instance.
//! Records are self-delimiting text frames, one per line:
//! `seq|epochMs|op|key|payload`. String ops carry `kind|value|ttlSec`;
//! sorted-set ops carry `SORTED_SET|member|score`.
//!
//! ## Design Principles
//! 1. **Layered**: [`LogFile`] handles framing and the durability policy;
//!    [`Wal`] adds sequence numbers and the cache-record codec. The
//!    discovery registry journals through the same `LogFile`.
//! 2. **Ack After Durability Policy**: `append` returns only once the frame
//!    is flushed (and fsynced when the interval is due); the caller mutates
//!    memory after that.
//! 3. **Fail Fast**: The first write error poisons the log; further appends
//!    are refused until `truncate` restores a usable file.
//! 4. **Tolerant Replay**: A partial final line (crash mid-write) is
//!    discarded; malformed interior frames are logged and skipped.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use ember_common::{EmberError, EmberResult, EntryKind};

/// When fsync happens relative to appends.
#[derive(Debug, Clone, Copy)]
pub struct DurabilityPolicy {
    /// Flush the userspace buffer on every append.
    pub flush_each_write: bool,
    /// Upper bound between fsyncs; `Duration::ZERO` syncs every append.
    pub fsync_interval: Duration,
}

impl Default for DurabilityPolicy {
    fn default() -> Self {
        DurabilityPolicy {
            flush_each_write: true,
            fsync_interval: Duration::from_millis(1000),
        }
    }
}

impl DurabilityPolicy {
    /// Strictest policy: flush and fsync on every append. Used by tests and
    /// the discovery journal, where write volume is tiny.
    pub fn strict() -> Self {
        DurabilityPolicy {
            flush_each_write: true,
            fsync_interval: Duration::ZERO,
        }
    }
}

/// Operation recorded in a WAL frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Set,
    Delete,
    Expire,
    ZAdd,
    ZRem,
}

impl WalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOp::Set => "SET",
            WalOp::Delete => "DELETE",
            WalOp::Expire => "EXPIRE",
            WalOp::ZAdd => "ZADD",
            WalOp::ZRem => "ZREM",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "SET" => Some(WalOp::Set),
            "DELETE" => Some(WalOp::Delete),
            "EXPIRE" => Some(WalOp::Expire),
            "ZADD" => Some(WalOp::ZAdd),
            "ZREM" => Some(WalOp::ZRem),
            _ => None,
        }
    }
}

/// Op-dependent payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WalPayload {
    /// SET / DELETE / EXPIRE. `ttl_sec` is `-1` for "no expiry"; DELETE
    /// carries an empty value and `-1`.
    Write {
        kind: EntryKind,
        value: Vec<u8>,
        ttl_sec: i64,
    },
    /// ZADD / ZREM. ZREM writes a zero score.
    Member { member: Vec<u8>, score: f64 },
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub seq: u64,
    pub ts_ms: u64,
    pub op: WalOp,
    pub key: Vec<u8>,
    pub payload: WalPayload,
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Highest sequence seen; 0 for an empty or missing log.
    pub last_seq: u64,
    pub applied: usize,
    pub skipped: usize,
    /// True when a partial final line was discarded.
    pub partial_tail: bool,
}

// ----------------------------------------------------------------------
// Frame codec
// ----------------------------------------------------------------------

/// Escapes `\`, `|`, CR, and LF so a field can never split a frame.
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'|' => out.extend_from_slice(b"\\|"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
}

fn unescape(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'|') => out.push(b'|'),
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            _ => return None,
        }
    }
    Some(out)
}

/// Splits a frame on unescaped `|` without unescaping field bytes.
fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    while idx < line.len() {
        match line[idx] {
            b'\\' => idx += 2,
            b'|' => {
                fields.push(&line[start..idx]);
                idx += 1;
                start = idx;
            }
            _ => idx += 1,
        }
    }
    fields.push(&line[start.min(line.len())..]);
    fields
}

/// Encodes a record as one frame, without the trailing newline.
pub fn encode_frame(record: &WalRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + record.key.len());
    out.extend_from_slice(record.seq.to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(record.ts_ms.to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(record.op.as_str().as_bytes());
    out.push(b'|');
    escape_into(&record.key, &mut out);
    out.push(b'|');
    match &record.payload {
        WalPayload::Write { kind, value, ttl_sec } => {
            out.extend_from_slice(kind.as_wal_token().as_bytes());
            out.push(b'|');
            escape_into(value, &mut out);
            out.push(b'|');
            out.extend_from_slice(ttl_sec.to_string().as_bytes());
        }
        WalPayload::Member { member, score } => {
            out.extend_from_slice(EntryKind::SortedSet.as_wal_token().as_bytes());
            out.push(b'|');
            escape_into(member, &mut out);
            out.push(b'|');
            out.extend_from_slice(score.to_string().as_bytes());
        }
    }
    out
}

/// Decodes one frame (a full line without its newline).
pub fn parse_frame(line: &[u8]) -> EmberResult<WalRecord> {
    let fields = split_fields(line);
    if fields.len() != 7 {
        return Err(EmberError::Corrupt(format!(
            "expected 7 fields, found {}",
            fields.len()
        )));
    }

    let seq = parse_u64_field(fields[0], "seq")?;
    let ts_ms = parse_u64_field(fields[1], "ts")?;
    let op = std::str::from_utf8(fields[2])
        .ok()
        .and_then(WalOp::parse)
        .ok_or_else(|| EmberError::Corrupt("unknown op".to_string()))?;
    let key = unescape(fields[3]).ok_or_else(|| EmberError::Corrupt("bad key escape".into()))?;

    let kind_token = std::str::from_utf8(fields[4])
        .map_err(|_| EmberError::Corrupt("bad kind".into()))?;
    let kind = EntryKind::from_wal_token(kind_token)
        .ok_or_else(|| EmberError::Corrupt(format!("unknown kind {kind_token}")))?;

    let payload = match op {
        WalOp::ZAdd | WalOp::ZRem => {
            if kind != EntryKind::SortedSet {
                return Err(EmberError::Corrupt("sorted-set op without set kind".into()));
            }
            let member =
                unescape(fields[5]).ok_or_else(|| EmberError::Corrupt("bad member".into()))?;
            let score: f64 = std::str::from_utf8(fields[6])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| EmberError::Corrupt("bad score".into()))?;
            if !score.is_finite() {
                return Err(EmberError::Corrupt("non-finite score".into()));
            }
            WalPayload::Member { member, score }
        }
        _ => {
            let value =
                unescape(fields[5]).ok_or_else(|| EmberError::Corrupt("bad value".into()))?;
            let ttl_sec: i64 = std::str::from_utf8(fields[6])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| EmberError::Corrupt("bad ttl".into()))?;
            WalPayload::Write { kind, value, ttl_sec }
        }
    };

    Ok(WalRecord {
        seq,
        ts_ms,
        op,
        key,
        payload,
    })
}

fn parse_u64_field(data: &[u8], what: &str) -> EmberResult<u64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EmberError::Corrupt(format!("bad {what} field")))
}

/// Current wall time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------
// LogFile: framed appender with a durability policy
// ----------------------------------------------------------------------

/// Line-framed append-only file. Not thread-safe; owners serialize access.
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
    policy: DurabilityPolicy,
    last_fsync: Instant,
    dirty: bool,
}

impl LogFile {
    /// Opens (creating parents and the file as needed) for appending.
    pub fn open(path: &Path, policy: DurabilityPolicy) -> EmberResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            policy,
            last_fsync: Instant::now(),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one frame plus newline and applies the durability policy.
    pub fn append_line(&mut self, frame: &[u8]) -> EmberResult<()> {
        self.writer.write_all(frame)?;
        self.writer.write_all(b"\n")?;
        self.dirty = true;
        if self.policy.flush_each_write {
            self.writer.flush()?;
        }
        if self.last_fsync.elapsed() >= self.policy.fsync_interval {
            self.sync()?;
        }
        Ok(())
    }

    /// Flushes buffered bytes and fsyncs the file.
    pub fn sync(&mut self) -> EmberResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.last_fsync = Instant::now();
        self.dirty = false;
        Ok(())
    }

    /// Discards every record and syncs the empty file.
    pub fn truncate(&mut self) -> EmberResult<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_data()?;
        self.last_fsync = Instant::now();
        self.dirty = false;
        Ok(())
    }

    /// Streams complete lines to `visit(offset, line)`. A final line with
    /// no terminating newline is reported via the returned flag, not
    /// visited.
    pub fn scan(
        path: &Path,
        mut visit: impl FnMut(u64, &[u8]),
    ) -> EmberResult<bool> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut offset = 0u64;
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                return Ok(false);
            }
            if line.last() != Some(&b'\n') {
                // Crash mid-write left a partial tail; drop it.
                return Ok(true);
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            visit(offset, &line);
            offset += read as u64;
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.sync();
        }
    }
}

// ----------------------------------------------------------------------
// Wal: sequence numbers + cache-record codec over LogFile
// ----------------------------------------------------------------------

/// Single-writer write-ahead log for one engine.
pub struct Wal {
    file: Mutex<LogFile>,
    next_seq: AtomicU64,
    usable: AtomicBool,
}

impl Wal {
    /// Opens the log, continuing sequence numbers from `start_seq` (the
    /// last sequence observed by recovery; 0 for a fresh log).
    pub fn open(path: &Path, policy: DurabilityPolicy, start_seq: u64) -> EmberResult<Self> {
        let file = LogFile::open(path, policy)?;
        Ok(Wal {
            file: Mutex::new(file),
            next_seq: AtomicU64::new(start_seq),
            usable: AtomicBool::new(true),
        })
    }

    /// Appends a record and returns its assigned sequence once the
    /// durability policy is satisfied.
    pub fn append(&self, op: WalOp, key: &[u8], payload: WalPayload) -> EmberResult<u64> {
        if !self.usable.load(Ordering::Acquire) {
            return Err(EmberError::Durability(
                "write-ahead log unavailable after prior failure".to_string(),
            ));
        }

        let mut file = self.file.lock();
        // Sequence assignment happens under the file lock so on-disk order
        // always matches sequence order.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = WalRecord {
            seq,
            ts_ms: epoch_ms(),
            op,
            key: key.to_vec(),
            payload,
        };
        match file.append_line(&encode_frame(&record)) {
            Ok(()) => Ok(seq),
            Err(err) => {
                self.usable.store(false, Ordering::Release);
                tracing::error!(error = %err, "wal append failed; refusing further writes");
                Err(EmberError::Durability(err.to_string()))
            }
        }
    }

    /// Last assigned sequence.
    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Drops all records after a durable snapshot; sequence restarts at 0
    /// and a previously poisoned log becomes usable again.
    pub fn truncate(&self) -> EmberResult<()> {
        let mut file = self.file.lock();
        file.truncate()?;
        self.next_seq.store(0, Ordering::Relaxed);
        self.usable.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes and fsyncs outstanding frames.
    pub fn sync(&self) -> EmberResult<()> {
        self.file.lock().sync()
    }

    /// Flush + fsync; the log stays open (files close on drop).
    pub fn close(&self) -> EmberResult<()> {
        self.sync()
    }

    /// Replays every decodable frame in file order. Malformed frames are
    /// warned about and skipped; a partial tail is discarded silently.
    pub fn replay(path: &Path, mut handler: impl FnMut(WalRecord)) -> EmberResult<ReplayReport> {
        if !path.exists() {
            return Ok(ReplayReport::default());
        }

        let mut report = ReplayReport::default();
        let partial = LogFile::scan(path, |offset, line| match parse_frame(line) {
            Ok(record) => {
                if record.seq <= report.last_seq {
                    tracing::warn!(
                        offset,
                        seq = record.seq,
                        "wal sequence went backwards; applying anyway"
                    );
                }
                report.last_seq = record.seq;
                report.applied += 1;
                handler(record);
            }
            Err(err) => {
                tracing::warn!(offset, error = %err, "skipping malformed wal frame");
                report.skipped += 1;
            }
        })?;
        report.partial_tail = partial;
        if partial {
            tracing::warn!(path = %path.display(), "discarded partial wal tail");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn record(seq: u64, op: WalOp, key: &[u8], payload: WalPayload) -> WalRecord {
        WalRecord {
            seq,
            ts_ms: 1_700_000_000_000,
            op,
            key: key.to_vec(),
            payload,
        }
    }

    fn write_payload(value: &[u8], ttl_sec: i64) -> WalPayload {
        WalPayload::Write {
            kind: EntryKind::String,
            value: value.to_vec(),
            ttl_sec,
        }
    }

    #[test]
    fn frame_roundtrip_plain() {
        let rec = record(1, WalOp::Set, b"foo", write_payload(b"bar", 30));
        let frame = encode_frame(&rec);
        assert_eq!(frame, b"1|1700000000000|SET|foo|STRING|bar|30".to_vec());
        assert_eq!(parse_frame(&frame).unwrap(), rec);
    }

    #[test]
    fn frame_roundtrip_with_delimiters_in_value() {
        let rec = record(2, WalOp::Set, b"k|ey", write_payload(b"a|b\r\nc\\d", -1));
        let frame = encode_frame(&rec);
        assert_eq!(parse_frame(&frame).unwrap(), rec);
    }

    #[test]
    fn frame_roundtrip_sorted_set() {
        let rec = record(
            3,
            WalOp::ZAdd,
            b"board",
            WalPayload::Member {
                member: b"alice".to_vec(),
                score: 12.5,
            },
        );
        let frame = encode_frame(&rec);
        assert_eq!(frame, b"3|1700000000000|ZADD|board|SORTED_SET|alice|12.5".to_vec());
        assert_eq!(parse_frame(&frame).unwrap(), rec);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_frame(b"not a frame").is_err());
        assert!(parse_frame(b"1|2|NOPE|k|STRING|v|1").is_err());
        assert!(parse_frame(b"x|2|SET|k|STRING|v|1").is_err());
        assert!(parse_frame(b"1|2|ZADD|k|SORTED_SET|m|notanumber").is_err());
    }

    #[test]
    fn append_assigns_increasing_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        let wal = Wal::open(&path, DurabilityPolicy::strict(), 0).unwrap();

        assert_eq!(wal.append(WalOp::Set, b"a", write_payload(b"1", -1)).unwrap(), 1);
        assert_eq!(wal.append(WalOp::Set, b"b", write_payload(b"2", -1)).unwrap(), 2);
        assert_eq!(wal.current_seq(), 2);
    }

    #[test]
    fn replay_returns_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        {
            let wal = Wal::open(&path, DurabilityPolicy::strict(), 0).unwrap();
            wal.append(WalOp::Set, b"a", write_payload(b"1", -1)).unwrap();
            wal.append(WalOp::Delete, b"a", write_payload(b"", -1)).unwrap();
            wal.close().unwrap();
        }

        let mut seen = Vec::new();
        let report = Wal::replay(&path, |rec| seen.push((rec.seq, rec.op))).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.last_seq, 2);
        assert!(!report.partial_tail);
        assert_eq!(seen, vec![(1, WalOp::Set), (2, WalOp::Delete)]);
    }

    #[test]
    fn replay_discards_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        {
            let wal = Wal::open(&path, DurabilityPolicy::strict(), 0).unwrap();
            wal.append(WalOp::Set, b"a", write_payload(b"1", -1)).unwrap();
        }
        // Simulate a crash mid-append: half a frame, no newline.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"2|170000").unwrap();
        }

        let report = Wal::replay(&path, |_| {}).unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.partial_tail);
    }

    #[test]
    fn replay_skips_malformed_interior_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(b"1|1|SET|a|STRING|1|-1\n").unwrap();
            file.write_all(b"garbage line\n").unwrap();
            file.write_all(b"3|3|SET|b|STRING|2|-1\n").unwrap();
        }

        let mut keys = Vec::new();
        let report = Wal::replay(&path, |rec| keys.push(rec.key)).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn truncate_resets_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        let wal = Wal::open(&path, DurabilityPolicy::strict(), 0).unwrap();
        wal.append(WalOp::Set, b"a", write_payload(b"1", -1)).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.current_seq(), 0);

        let report = Wal::replay(&path, |_| panic!("log should be empty")).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(wal.append(WalOp::Set, b"b", write_payload(b"2", -1)).unwrap(), 1);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = Wal::replay(&dir.path().join("absent.wal"), |_| {}).unwrap();
        assert_eq!(report, ReplayReport::default());
    }
}
