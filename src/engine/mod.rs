//! WIREDKV - Storage Engine Module
//! Top-level module for the segment storage components.

pub mod codec;
pub mod envelope;
pub mod index;
pub mod metrics;
pub mod segment;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::{Result, WiredError};
use crate::types::{validate_segment_key, Segment, Tables};

use self::codec::RecordCodec;
use self::envelope::Envelope;
use self::index::IndexKey;
use self::metrics::StoreMetrics;
use self::segment::{segment_path, ActiveSegment, AppendOutcome, PendingRecord, SEGMENT_EXTENSION};

/// The core WiredKV segment store.
/// Maps segment keys to file-backed segments and exposes their
/// create / put / fetch / delete lifecycle.
///
/// The store is `Send + Sync`; share it between threads with an `Arc`.
/// Writers to one segment are serialized by that segment's lock, while
/// the registry lock is only held to look up, create or drop entries.
pub struct SegmentStore {
    /// Registered segments by key.
    segments: RwLock<HashMap<String, Arc<ActiveSegment>>>,
    /// Codec shared by every segment (carries the envelope).
    codec: RecordCodec,
    /// Operation counters.
    metrics: StoreMetrics,
    /// Store configuration.
    config: Config,
}

impl SegmentStore {
    /// Open or create a store in the configured directory.
    ///
    /// Every `*.seg` file found is recovered: its index is rebuilt and any
    /// invalid tail is cut before the segment accepts writes. A file that
    /// cannot be opened (for instance one written under another key) is
    /// logged, counted and left on disk unregistered; the rest of the
    /// store still opens.
    pub fn open(config: Config) -> Result<Self> {
        let envelope: Arc<dyn Envelope> =
            Arc::from(envelope::envelope_for(config.encryption_key.as_ref()));
        Self::open_with_envelope(config, envelope)
    }

    /// Open a store with an explicit envelope, ignoring the configured key.
    pub fn open_with_envelope(config: Config, envelope: Arc<dyn Envelope>) -> Result<Self> {
        config.ensure_dirs()?;

        let codec = RecordCodec::new(envelope);
        let metrics = StoreMetrics::new();
        let mut segments = HashMap::new();

        for dir_entry in std::fs::read_dir(&config.data_dir)? {
            let path = dir_entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION)
            {
                continue;
            }
            let key = match path.file_stem().and_then(|s| s.to_str()) {
                Some(key) if validate_segment_key(key).is_ok() => key.to_string(),
                _ => {
                    log::warn!("Skipping unrecognised segment file {:?}", path);
                    continue;
                }
            };

            let (segment, recovery) = match ActiveSegment::open(path, &key, &codec) {
                Ok(opened) => opened,
                Err(e) => {
                    log::warn!("Segment '{}' skipped, it could not be opened: {}", key, e);
                    metrics.record_skip();
                    continue;
                }
            };
            metrics.record_recovery(recovery.discarded);
            log::info!(
                "Segment '{}' recovered ({} live entities, {} bytes discarded)",
                key,
                recovery.live,
                recovery.discarded
            );
            segments.insert(key, Arc::new(segment));
        }

        log::info!(
            "WiredKV store opened at {:?} ({} segments, envelope: {})",
            config.data_dir,
            segments.len(),
            codec.envelope_name()
        );

        Ok(Self {
            segments: RwLock::new(segments),
            codec,
            metrics,
            config,
        })
    }

    /// Build a segment value for `key` from `tables`. No I/O is performed;
    /// pass the result to [`SegmentStore::put_segment`].
    pub fn new_segment(&self, key: &str, tables: Tables, initial_offset: u64) -> Result<Segment> {
        Segment::new(key, tables, initial_offset)
    }

    /// Append every entity of `segment` to the segment file for `key`,
    /// creating the segment on first use.
    ///
    /// All records are encoded before the segment lock is taken, so an
    /// encode failure writes nothing. Each record is indexed right after
    /// its bytes are appended; a write failure leaves earlier records of
    /// the batch committed and readable.
    pub fn put_segment(&self, key: &str, segment: &Segment) -> Result<()> {
        validate_segment_key(key)?;
        if segment.key() != key {
            return Err(WiredError::MalformedRequest(format!(
                "segment built for '{}' cannot be put under '{}'",
                segment.key(),
                key
            )));
        }

        let records = self.encode_tables(segment.tables())?;

        loop {
            let handle = self.get_or_create(key).map_err(into_write_error)?;
            match handle.append(&records, segment.initial_offset(), self.config.sync_writes)? {
                AppendOutcome::Appended { records, bytes } => {
                    self.metrics.record_put(records, bytes);
                    log::debug!(
                        "Segment '{}': appended {} records ({} bytes)",
                        key,
                        records,
                        bytes
                    );
                    return Ok(());
                }
                // deleted while we waited; recreate under a fresh handle
                AppendOutcome::Retired => continue,
            }
        }
    }

    /// Read back all live entities of segment `key`.
    ///
    /// The returned segment's `initial_offset` is the committed length at
    /// read time, usable as the expected offset of a follow-up put.
    pub fn fetch_segment(&self, key: &str) -> Result<Segment> {
        let handle = self
            .live_handle(key)
            .ok_or_else(|| WiredError::NotFound(format!("segment '{}'", key)))?;

        let committed = handle.committed_len();
        let (tables, bytes_read) = handle.read_tables(&self.codec)?;
        self.metrics.record_fetch(bytes_read);
        Ok(Segment::from_parts(key.to_string(), tables, committed))
    }

    /// Delete segment `key`: its file, index and registry entry.
    ///
    /// The file is unlinked before anything else changes; if that fails
    /// the segment stays registered and readable.
    pub fn delete_segment(&self, key: &str) -> Result<()> {
        let handle = self
            .live_handle(key)
            .ok_or_else(|| WiredError::NotFound(format!("segment '{}'", key)))?;
        handle.retire()?;

        // a put may already have replaced the retired entry
        let mut segments = self.segments.write();
        if segments
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current, &handle))
        {
            segments.remove(key);
        }
        drop(segments);

        self.metrics.record_delete();
        log::info!("Segment '{}' deleted", key);
        Ok(())
    }

    /// Returns true if a live segment is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.live_handle(key).is_some()
    }

    /// Live segment keys, sorted.
    pub fn segment_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .segments
            .read()
            .iter()
            .filter(|(_, s)| !s.is_retired())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.segments.read().values().filter(|s| !s.is_retired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed file length of segment `key`.
    pub fn segment_len(&self, key: &str) -> Result<u64> {
        self.live_handle(key)
            .map(|s| s.committed_len())
            .ok_or_else(|| WiredError::NotFound(format!("segment '{}'", key)))
    }

    /// Access the store metrics.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Name of the envelope records are written with.
    pub fn envelope_name(&self) -> &str {
        self.codec.envelope_name()
    }

    fn encode_tables(&self, tables: &Tables) -> Result<Vec<PendingRecord>> {
        let mut records = Vec::with_capacity(tables.entity_count());
        for table in tables.iter() {
            for entity in table.entities.values() {
                records.push(PendingRecord {
                    key: IndexKey::new(table.name.clone(), entity.key.clone()),
                    bytes: self.codec.encode(&table.name, entity)?,
                });
            }
        }
        Ok(records)
    }

    /// Registered handle for `key`, unless it has been retired.
    fn live_handle(&self, key: &str) -> Option<Arc<ActiveSegment>> {
        self.segments
            .read()
            .get(key)
            .filter(|s| !s.is_retired())
            .cloned()
    }

    fn get_or_create(&self, key: &str) -> Result<Arc<ActiveSegment>> {
        if let Some(handle) = self.live_handle(key) {
            return Ok(handle);
        }

        let mut segments = self.segments.write();
        if let Some(handle) = segments.get(key).filter(|s| !s.is_retired()) {
            return Ok(Arc::clone(handle));
        }
        // a retired entry whose delete has not dropped it yet is replaced
        let handle = Arc::new(self.create_segment(key)?);
        segments.insert(key.to_string(), Arc::clone(&handle));
        log::info!("Segment '{}' created", key);
        Ok(handle)
    }

    fn create_segment(&self, key: &str) -> Result<ActiveSegment> {
        match ActiveSegment::create(&self.config.data_dir, key) {
            Ok(segment) => Ok(segment),
            // an unregistered file left behind (e.g. dropped in by hand):
            // adopt it after recovery instead of clobbering it
            Err(WiredError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let path = segment_path(&self.config.data_dir, key);
                let (segment, recovery) = ActiveSegment::open(path, key, &self.codec)?;
                self.metrics.record_recovery(recovery.discarded);
                Ok(segment)
            }
            Err(e) => Err(e),
        }
    }
}

/// Failures creating or adopting a segment file are write failures.
fn into_write_error(err: WiredError) -> WiredError {
    match err {
        WiredError::Io(e) => WiredError::Write(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::envelope::EncryptionKey;
    use crate::types::{Entity, Table};

    fn temp_config(dir: &std::path::Path) -> Config {
        Config::new(dir).with_sync_writes(false)
    }

    fn cart(value: &str) -> Tables {
        Tables::new().with_table(Table::new("cart").with_entity(Entity::new("user-01", value)))
    }

    #[test]
    fn test_put_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();

        let seg = store.new_segment("orders", cart("3 items"), 0).unwrap();
        store.put_segment("orders", &seg).unwrap();

        let fetched = store.fetch_segment("orders").unwrap();
        assert_eq!(fetched.tables(), &cart("3 items"));
        assert_eq!(fetched.initial_offset(), store.segment_len("orders").unwrap());
    }

    #[test]
    fn test_fetch_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        assert!(matches!(
            store.fetch_segment("nope").unwrap_err(),
            WiredError::NotFound(_)
        ));
        assert!(matches!(
            store.delete_segment("nope").unwrap_err(),
            WiredError::NotFound(_)
        ));
    }

    #[test]
    fn test_put_key_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        let seg = store.new_segment("orders", cart("x"), 0).unwrap();
        let err = store.put_segment("other", &seg).unwrap_err();
        assert!(matches!(err, WiredError::MalformedRequest(_)));
        assert!(!store.contains("other"));
    }

    #[test]
    fn test_conditional_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        store
            .put_segment("orders", &store.new_segment("orders", cart("1"), 0).unwrap())
            .unwrap();

        let current = store.fetch_segment("orders").unwrap().initial_offset();
        let stale = store.new_segment("orders", cart("2"), current + 1).unwrap();
        assert!(matches!(
            store.put_segment("orders", &stale).unwrap_err(),
            WiredError::MalformedRequest(_)
        ));

        let fresh = store.new_segment("orders", cart("2"), current).unwrap();
        store.put_segment("orders", &fresh).unwrap();
        assert_eq!(store.fetch_segment("orders").unwrap().into_tables(), cart("2"));
    }

    #[test]
    fn test_delete_then_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        let seg = store.new_segment("orders", cart("1"), 0).unwrap();
        store.put_segment("orders", &seg).unwrap();

        store.delete_segment("orders").unwrap();
        assert!(!store.contains("orders"));
        assert!(!segment_path(dir.path(), "orders").exists());
        assert!(matches!(
            store.fetch_segment("orders").unwrap_err(),
            WiredError::NotFound(_)
        ));

        let seg = store.new_segment("orders", cart("2"), 0).unwrap();
        store.put_segment("orders", &seg).unwrap();
        assert_eq!(store.fetch_segment("orders").unwrap().into_tables(), cart("2"));
    }

    #[test]
    fn test_reopen_recovers_segments() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SegmentStore::open(temp_config(dir.path())).unwrap();
            for key in ["a", "b"] {
                let seg = store.new_segment(key, cart(key), 0).unwrap();
                store.put_segment(key, &seg).unwrap();
            }
        }
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        assert_eq!(store.segment_keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.fetch_segment("b").unwrap().into_tables(), cart("b"));
        assert_eq!(
            store
                .metrics()
                .recoveries
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn test_encrypted_store_skips_segment_under_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = temp_config(dir.path()).with_encryption_key(EncryptionKey::generate());
            let store = SegmentStore::open(config).unwrap();
            assert_eq!(store.envelope_name(), "aes-256-gcm");
            let seg = store.new_segment("orders", cart("secret"), 0).unwrap();
            store.put_segment("orders", &seg).unwrap();
        }
        let path = segment_path(dir.path(), "orders");
        let before = std::fs::read(&path).unwrap();

        let config = temp_config(dir.path()).with_encryption_key(EncryptionKey::generate());
        let store = SegmentStore::open(config).unwrap();
        assert!(!store.contains("orders"));
        assert_eq!(
            store
                .metrics()
                .skipped_segments
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        // the file is left untouched
        assert_eq!(std::fs::read(&path).unwrap(), before);

        // a put does not clobber the unreadable file either
        let seg = store.new_segment("orders", cart("other"), 0).unwrap();
        assert!(matches!(
            store.put_segment("orders", &seg).unwrap_err(),
            WiredError::Decode(crate::error::DecodeError::AuthenticationFailed)
        ));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_put_reports_file_creation_failure_as_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        std::fs::create_dir(segment_path(dir.path(), "x")).unwrap();

        let seg = store.new_segment("x", cart("1"), 0).unwrap();
        let err = store.put_segment("x", &seg).unwrap_err();
        assert!(matches!(err, WiredError::Write(_)), "got {:?}", err);
        assert!(!err.is_client_error());
        assert!(!store.contains("x"));
    }

    #[test]
    fn test_delete_replaced_entry_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        store
            .put_segment("orders", &store.new_segment("orders", cart("1"), 0).unwrap())
            .unwrap();

        // retire the handle directly, as a delete does before it touches
        // the registry, then let a put race in ahead of the removal
        let old = store.live_handle("orders").unwrap();
        old.retire().unwrap();
        assert!(!store.contains("orders"));
        store
            .put_segment("orders", &store.new_segment("orders", cart("2"), 0).unwrap())
            .unwrap();

        let current = store.live_handle("orders").unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert_eq!(store.fetch_segment("orders").unwrap().into_tables(), cart("2"));

        // deleting again targets the new segment only
        store.delete_segment("orders").unwrap();
        assert!(!store.contains("orders"));
        assert!(matches!(
            store.delete_segment("orders").unwrap_err(),
            WiredError::NotFound(_)
        ));
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let store = SegmentStore::open(temp_config(dir.path())).unwrap();
        assert!(store.is_empty());
    }
}
