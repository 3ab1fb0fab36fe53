//! WIREDKV - Active Segment
//! One append-only segment file together with its offset index.
//!
//! ## Concurrency Model
//! - **Appends** hold the segment's writer mutex for the whole batch, so
//!   records from concurrent puts never interleave
//! - **Reads** copy the index under a short read lock and then read the
//!   file through their own handle; the index only ever names records
//!   whose bytes were fully written
//! - **Retirement** (delete) takes the writer mutex, so it waits for an
//!   in-flight append to finish before the file is unlinked. The segment
//!   only counts as retired once the unlink has succeeded

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{DecodeError, Result, WiredError};
use crate::types::Tables;

use super::codec::RecordCodec;
use super::index::{IndexKey, OffsetIndex};

/// File extension of segment files inside the data directory.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Path of the file backing segment `key`.
pub fn segment_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", key, SEGMENT_EXTENSION))
}

/// A record ready to be appended, already framed by the codec.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub key: IndexKey,
    pub bytes: Vec<u8>,
}

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// All records were written and indexed.
    Appended { records: usize, bytes: u64 },
    /// The segment was deleted while the caller waited for the lock.
    Retired,
}

/// Write side of a segment file.
///
/// `File` is the only production implementation; tests substitute
/// targets that fail at chosen points.
pub(crate) trait SegmentFile: Send {
    /// Append `bytes` at the end of the file, syncing when `sync` is set.
    fn append(&mut self, bytes: &[u8], sync: bool) -> io::Result<()>;

    /// Cut the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Remove the file at `path`.
    fn unlink(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

impl SegmentFile for File {
    fn append(&mut self, bytes: &[u8], sync: bool) -> io::Result<()> {
        self.write_all(bytes)?;
        if sync {
            self.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// State guarded by the writer mutex.
struct SegmentWriter {
    file: Box<dyn SegmentFile>,
    /// End of the last complete record; equals `committed_len`.
    offset: u64,
    /// Set when a failed write could not be rolled back, so the file may
    /// hold bytes past `offset`.
    dirty_tail: bool,
}

/// File-backed segment registered in a store.
pub struct ActiveSegment {
    key: String,
    path: PathBuf,
    writer: Mutex<SegmentWriter>,
    index: RwLock<OffsetIndex>,
    committed_len: AtomicU64,
    retired: AtomicBool,
}

/// What recovery found when a segment file was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Live entities in the rebuilt index.
    pub live: usize,
    /// Bytes cut from the end of the file.
    pub discarded: u64,
    /// Why the tail was cut, if it was.
    pub reason: Option<DecodeError>,
}

impl ActiveSegment {
    /// Create an empty segment file for `key`.
    pub fn create(dir: &Path, key: &str) -> Result<Self> {
        let path = segment_path(dir, key);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;

        log::debug!("Segment '{}' created at {:?}", key, path);
        Ok(Self::from_parts(key, path, Box::new(file), 0, OffsetIndex::new()))
    }

    /// Open an existing segment file and rebuild its index.
    ///
    /// An invalid or incomplete tail is truncated back to the last valid
    /// record. A file whose first record fails authentication is refused
    /// instead, since that points at a wrong key rather than a torn write.
    pub fn open(path: PathBuf, key: &str, codec: &RecordCodec) -> Result<(Self, Recovery)> {
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let report = OffsetIndex::rebuild(&file, codec)?;

        if report.valid_len == 0 && report.stopped_at == Some(DecodeError::AuthenticationFailed) {
            log::warn!(
                "Segment '{}' could not be authenticated; refusing to open it",
                key
            );
            return Err(WiredError::Decode(DecodeError::AuthenticationFailed));
        }

        let discarded = file_len - report.valid_len;
        if discarded > 0 {
            log::warn!(
                "Segment '{}': discarding {} byte tail at offset {} ({})",
                key,
                discarded,
                report.valid_len,
                report
                    .stopped_at
                    .as_ref()
                    .map_or_else(|| "trailing bytes".to_string(), |e| e.to_string())
            );
            file.set_len(report.valid_len)?;
            file.sync_all()?;
        }

        let recovery = Recovery {
            live: report.index.len(),
            discarded,
            reason: report.stopped_at,
        };
        let segment = Self::from_parts(key, path, Box::new(file), report.valid_len, report.index);
        Ok((segment, recovery))
    }

    fn from_parts(
        key: &str,
        path: PathBuf,
        file: Box<dyn SegmentFile>,
        offset: u64,
        index: OffsetIndex,
    ) -> Self {
        Self {
            key: key.to_string(),
            path,
            writer: Mutex::new(SegmentWriter {
                file,
                offset,
                dirty_tail: false,
            }),
            index: RwLock::new(index),
            committed_len: AtomicU64::new(offset),
            retired: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file covered by complete records.
    pub fn committed_len(&self) -> u64 {
        self.committed_len.load(Ordering::Acquire)
    }

    /// Number of live entities.
    pub fn live_entities(&self) -> usize {
        self.index.read().len()
    }

    /// True once [`ActiveSegment::retire`] has unlinked the file.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Append framed records under the writer lock.
    ///
    /// A non-zero `expected_offset` must equal the committed length or the
    /// append is rejected before any byte is written. Each record is
    /// indexed only after its bytes are written (and synced when `sync`
    /// is set). A failed write truncates the file back to the last
    /// complete record; records before it stay committed.
    ///
    /// If that truncation fails too, the segment refuses appends until a
    /// later attempt manages to cut the stray tail, so no record is ever
    /// indexed at an offset other than where its bytes landed.
    pub fn append(
        &self,
        records: &[PendingRecord],
        expected_offset: u64,
        sync: bool,
    ) -> Result<AppendOutcome> {
        let mut writer = self.writer.lock();
        if self.retired.load(Ordering::Acquire) {
            return Ok(AppendOutcome::Retired);
        }

        if writer.dirty_tail {
            let offset = writer.offset;
            if let Err(e) = writer.file.truncate(offset) {
                log::warn!(
                    "Segment '{}': stray tail past {} still cannot be cut: {}",
                    self.key,
                    offset,
                    e
                );
                return Err(WiredError::Write(e));
            }
            writer.dirty_tail = false;
            log::info!("Segment '{}': stray tail cut back to {}", self.key, offset);
        }

        if expected_offset != 0 && expected_offset != writer.offset {
            return Err(WiredError::MalformedRequest(format!(
                "segment '{}' expected at offset {}, committed length is {}",
                self.key, expected_offset, writer.offset
            )));
        }

        let mut bytes = 0u64;
        for record in records {
            let offset = writer.offset;
            if let Err(e) = writer.file.append(&record.bytes, sync) {
                log::warn!(
                    "Segment '{}': append failed, rolling back to {}: {}",
                    self.key,
                    offset,
                    e
                );
                if let Err(rollback) = writer.file.truncate(offset) {
                    log::error!(
                        "Segment '{}': rollback failed, refusing appends until the tail is cut: {}",
                        self.key,
                        rollback
                    );
                    writer.dirty_tail = true;
                }
                return Err(WiredError::Write(e));
            }

            let length = record.bytes.len() as u32;
            self.index.write().put(record.key.clone(), offset, length);
            writer.offset += length as u64;
            self.committed_len.store(writer.offset, Ordering::Release);
            bytes += length as u64;
        }

        Ok(AppendOutcome::Appended {
            records: records.len(),
            bytes,
        })
    }

    /// Read every live entity into tables.
    /// Returns the tables and the number of record bytes read.
    pub fn read_tables(&self, codec: &RecordCodec) -> Result<(Tables, u64)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WiredError::NotFound(format!("segment '{}'", self.key)))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = self.index.read().snapshot();
        // checked after open: a handle opened before retirement still
        // points at this segment's bytes
        if self.retired.load(Ordering::Acquire) {
            return Err(WiredError::NotFound(format!("segment '{}'", self.key)));
        }

        let mut tables = Tables::new();
        let mut bytes_read = 0u64;
        let mut buf = Vec::new();
        for (key, entry) in snapshot {
            buf.resize(entry.length as usize, 0);
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => WiredError::Decode(DecodeError::Truncated {
                    needed: entry.length as usize,
                    available: 0,
                }),
                _ => WiredError::Io(e),
            })?;

            let decoded = codec.decode(&buf)?;
            if decoded.table != key.table || decoded.entity.key != key.key {
                return Err(WiredError::Decode(DecodeError::Malformed(format!(
                    "record at offset {} does not belong to its index entry",
                    entry.offset
                ))));
            }
            tables.insert_entity(&decoded.table, decoded.entity);
            bytes_read += entry.length as u64;
        }
        Ok((tables, bytes_read))
    }

    /// Retire the segment: wait for any in-flight append, unlink the file
    /// and drop the index. Later appends through this handle report
    /// [`AppendOutcome::Retired`].
    ///
    /// If the unlink fails the segment stays live and untouched. Retiring
    /// an already retired segment reports `NotFound`.
    pub fn retire(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.retired.load(Ordering::Acquire) {
            return Err(WiredError::NotFound(format!("segment '{}'", self.key)));
        }
        match writer.file.unlink(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("Segment '{}': unlink failed, keeping it live: {}", self.key, e);
                return Err(e.into());
            }
        }
        self.retired.store(true, Ordering::Release);
        *self.index.write() = OffsetIndex::new();
        self.committed_len.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::envelope::NoOpEnvelope;
    use crate::types::Entity;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn codec() -> RecordCodec {
        RecordCodec::new(Arc::new(NoOpEnvelope))
    }

    fn pending(codec: &RecordCodec, table: &str, key: &str, value: &str) -> PendingRecord {
        PendingRecord {
            key: IndexKey::new(table, key),
            bytes: codec.encode(table, &Entity::new(key, value)).unwrap(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let seg = ActiveSegment::create(dir.path(), "orders").unwrap();

        let records = vec![
            pending(&codec, "cart", "user-01", "3 items"),
            pending(&codec, "cart", "user-02", "1 item"),
        ];
        let outcome = seg.append(&records, 0, true).unwrap();
        let total: u64 = records.iter().map(|r| r.bytes.len() as u64).sum();
        assert_eq!(outcome, AppendOutcome::Appended { records: 2, bytes: total });
        assert_eq!(seg.committed_len(), total);
        assert_eq!(fs::metadata(seg.path()).unwrap().len(), total);

        let (tables, read) = seg.read_tables(&codec).unwrap();
        assert_eq!(read, total);
        let cart = tables.table("cart").unwrap();
        assert_eq!(cart.get(b"user-01").unwrap().value, b"3 items");
        assert_eq!(cart.get(b"user-02").unwrap().value, b"1 item");
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let seg = ActiveSegment::create(dir.path(), "orders").unwrap();
        seg.append(&[pending(&codec, "cart", "k", "old")], 0, false).unwrap();
        seg.append(&[pending(&codec, "cart", "k", "new")], 0, false).unwrap();

        assert_eq!(seg.live_entities(), 1);
        let (tables, _) = seg.read_tables(&codec).unwrap();
        assert_eq!(tables.table("cart").unwrap().get(b"k").unwrap().value, b"new");
    }

    #[test]
    fn test_expected_offset_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let seg = ActiveSegment::create(dir.path(), "orders").unwrap();
        seg.append(&[pending(&codec, "t", "a", "1")], 0, false).unwrap();

        let err = seg
            .append(&[pending(&codec, "t", "b", "2")], 3, false)
            .unwrap_err();
        assert!(matches!(err, WiredError::MalformedRequest(_)));

        let len = seg.committed_len();
        seg.append(&[pending(&codec, "t", "b", "2")], len, false).unwrap();
        assert_eq!(seg.live_entities(), 2);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let path = {
            let seg = ActiveSegment::create(dir.path(), "orders").unwrap();
            seg.append(&[pending(&codec, "t", "a", "1")], 0, true).unwrap();
            seg.path().to_path_buf()
        };
        let valid = fs::metadata(&path).unwrap().len();

        let torn = pending(&codec, "t", "b", "half written");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn.bytes[..torn.bytes.len() - 4]).unwrap();
        drop(file);

        let (seg, recovery) = ActiveSegment::open(path.clone(), "orders", &codec).unwrap();
        assert_eq!(recovery.live, 1);
        assert_eq!(recovery.discarded, torn.bytes.len() as u64 - 4);
        assert!(matches!(recovery.reason, Some(DecodeError::Truncated { .. })));
        assert_eq!(seg.committed_len(), valid);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid);

        // appends continue after the valid prefix
        seg.append(&[pending(&codec, "t", "c", "3")], 0, true).unwrap();
        let (_, recovery) = ActiveSegment::open(path, "orders", &codec).unwrap();
        assert_eq!(recovery.live, 2);
        assert_eq!(recovery.discarded, 0);
    }

    #[test]
    fn test_retire_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let seg = ActiveSegment::create(dir.path(), "orders").unwrap();
        seg.append(&[pending(&codec, "t", "a", "1")], 0, false).unwrap();

        seg.retire().unwrap();
        assert!(!seg.path().exists());
        assert_eq!(seg.live_entities(), 0);
        assert!(matches!(
            seg.read_tables(&codec).unwrap_err(),
            WiredError::NotFound(_)
        ));
        assert_eq!(
            seg.append(&[pending(&codec, "t", "b", "2")], 0, false).unwrap(),
            AppendOutcome::Retired
        );
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        ActiveSegment::create(dir.path(), "orders").unwrap();
        assert!(ActiveSegment::create(dir.path(), "orders").is_err());
    }

    /// Switches shared between a test and its [`FlakyFile`].
    #[derive(Default)]
    struct Faults {
        /// Appends allowed before one writes half its bytes and fails.
        appends_left: AtomicUsize,
        fail_truncate: AtomicBool,
        fail_unlink: AtomicBool,
    }

    impl Faults {
        fn allowing(appends: usize) -> Arc<Self> {
            let faults = Self::default();
            faults.appends_left.store(appends, Ordering::SeqCst);
            Arc::new(faults)
        }
    }

    struct FlakyFile {
        inner: File,
        faults: Arc<Faults>,
    }

    impl SegmentFile for FlakyFile {
        fn append(&mut self, bytes: &[u8], sync: bool) -> io::Result<()> {
            let left = self.faults.appends_left.load(Ordering::SeqCst);
            if left == 0 {
                self.inner.write_all(&bytes[..bytes.len() / 2])?;
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            self.faults.appends_left.store(left - 1, Ordering::SeqCst);
            self.inner.append(bytes, sync)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.faults.fail_truncate.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "device busy"));
            }
            self.inner.set_len(len)
        }

        fn unlink(&mut self, path: &Path) -> io::Result<()> {
            if self.faults.fail_unlink.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only directory"));
            }
            fs::remove_file(path)
        }
    }

    fn flaky_segment(dir: &Path, faults: &Arc<Faults>) -> ActiveSegment {
        let path = segment_path(dir, "orders");
        let inner = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let file = FlakyFile {
            inner,
            faults: Arc::clone(faults),
        };
        ActiveSegment::from_parts("orders", path, Box::new(file), 0, OffsetIndex::new())
    }

    #[test]
    fn test_write_failure_mid_batch_keeps_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let faults = Faults::allowing(1);
        let seg = flaky_segment(dir.path(), &faults);

        let records = vec![
            pending(&codec, "cart", "user-01", "3 items"),
            pending(&codec, "cart", "user-02", "1 item"),
            pending(&codec, "cart", "user-03", "empty"),
        ];
        let err = seg.append(&records, 0, true).unwrap_err();
        assert!(matches!(err, WiredError::Write(_)));

        let first_len = records[0].bytes.len() as u64;
        assert_eq!(seg.live_entities(), 1);
        assert_eq!(seg.committed_len(), first_len);
        assert_eq!(fs::metadata(seg.path()).unwrap().len(), first_len);

        let (tables, _) = seg.read_tables(&codec).unwrap();
        let cart = tables.table("cart").unwrap();
        assert_eq!(cart.get(b"user-01").unwrap().value, b"3 items");
        assert!(cart.get(b"user-02").is_none());

        // the segment keeps accepting writes right after the rollback
        faults.appends_left.store(usize::MAX, Ordering::SeqCst);
        seg.append(&records[1..], 0, true).unwrap();
        assert_eq!(seg.live_entities(), 3);
        assert_eq!(fs::metadata(seg.path()).unwrap().len(), seg.committed_len());
    }

    #[test]
    fn test_failed_rollback_blocks_appends_until_tail_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let faults = Faults::allowing(1);
        faults.fail_truncate.store(true, Ordering::SeqCst);
        let seg = flaky_segment(dir.path(), &faults);

        let a = pending(&codec, "t", "a", "1");
        let b = pending(&codec, "t", "b", "2");
        assert!(matches!(
            seg.append(&[a.clone(), b.clone()], 0, false).unwrap_err(),
            WiredError::Write(_)
        ));
        let committed = a.bytes.len() as u64;
        assert_eq!(seg.committed_len(), committed);
        assert!(fs::metadata(seg.path()).unwrap().len() > committed);

        // writes would succeed now, but the stray half record is still there
        faults.appends_left.store(usize::MAX, Ordering::SeqCst);
        let c = pending(&codec, "t", "c", "3");
        assert!(matches!(
            seg.append(&[c.clone()], 0, false).unwrap_err(),
            WiredError::Write(_)
        ));
        assert_eq!(seg.live_entities(), 1);
        assert_eq!(seg.committed_len(), committed);

        faults.fail_truncate.store(false, Ordering::SeqCst);
        seg.append(&[c.clone()], 0, false).unwrap();
        assert_eq!(seg.committed_len(), committed + c.bytes.len() as u64);
        assert_eq!(fs::metadata(seg.path()).unwrap().len(), seg.committed_len());

        let (tables, _) = seg.read_tables(&codec).unwrap();
        let t = tables.table("t").unwrap();
        assert_eq!(t.get(b"a").unwrap().value, b"1");
        assert_eq!(t.get(b"c").unwrap().value, b"3");
        assert!(t.get(b"b").is_none());

        let (_, recovery) = ActiveSegment::open(seg.path().to_path_buf(), "orders", &codec).unwrap();
        assert_eq!(recovery.live, 2);
        assert_eq!(recovery.discarded, 0);
    }

    #[test]
    fn test_failed_unlink_keeps_segment_live() {
        let dir = tempfile::tempdir().unwrap();
        let codec = codec();
        let faults = Faults::allowing(usize::MAX);
        faults.fail_unlink.store(true, Ordering::SeqCst);
        let seg = flaky_segment(dir.path(), &faults);
        seg.append(&[pending(&codec, "t", "a", "1")], 0, false).unwrap();
        let len = seg.committed_len();

        assert!(matches!(seg.retire().unwrap_err(), WiredError::Io(_)));
        assert!(!seg.is_retired());
        assert!(seg.path().exists());
        assert_eq!(seg.committed_len(), len);
        assert_eq!(seg.live_entities(), 1);

        let (tables, _) = seg.read_tables(&codec).unwrap();
        assert_eq!(tables.table("t").unwrap().get(b"a").unwrap().value, b"1");
        assert!(matches!(
            seg.append(&[pending(&codec, "t", "b", "2")], 0, false).unwrap(),
            AppendOutcome::Appended { records: 1, .. }
        ));

        faults.fail_unlink.store(false, Ordering::SeqCst);
        seg.retire().unwrap();
        assert!(seg.is_retired());
        assert!(!seg.path().exists());
        assert!(matches!(seg.retire().unwrap_err(), WiredError::NotFound(_)));
    }
}
