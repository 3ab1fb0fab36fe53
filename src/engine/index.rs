//! WIREDKV - Offset Index
//! In-memory map from (table, entity key) to the byte range of the
//! entity's latest record inside a segment file.
//!
//! The index is never persisted. It is rebuilt by rescanning the segment
//! file from offset 0 whenever a segment is opened.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read};

use crate::error::{DecodeError, Result, WiredError};
use crate::types::Key;

use super::codec::{read_length_prefix, RecordCodec, LENGTH_PREFIX_SIZE};

/// Identifies one entity inside a segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub table: String,
    pub key: Key,
}

impl IndexKey {
    pub fn new(table: impl Into<String>, key: impl Into<Key>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

/// Byte range of a complete record, length prefix included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    /// First byte past the record.
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Sorted map of live records in one segment file.
#[derive(Debug, Clone, Default)]
pub struct OffsetIndex {
    entries: BTreeMap<IndexKey, IndexEntry>,
}

impl OffsetIndex {
    /// Create a new, empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `key` at a new record. Returns the range it replaced, whose
    /// bytes stay on disk as unreachable garbage.
    pub fn put(&mut self, key: IndexKey, offset: u64, length: u32) -> Option<IndexEntry> {
        self.entries.insert(key, IndexEntry { offset, length })
    }

    /// Resolve a key to its live record.
    pub fn get(&self, key: &IndexKey) -> Result<IndexEntry> {
        self.entries.get(key).copied().ok_or_else(|| {
            WiredError::NotFound(format!(
                "entity {:?} in table '{}'",
                String::from_utf8_lossy(&key.key),
                key.table
            ))
        })
    }

    /// Drop a key from the live set.
    pub fn remove(&mut self, key: &IndexKey) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&IndexKey, &IndexEntry)> {
        self.entries.iter()
    }

    /// Total bytes held by live records.
    pub fn live_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.length as u64).sum()
    }

    /// Copy of the live set ordered by file offset, for sequential reads.
    pub fn snapshot(&self) -> Vec<(IndexKey, IndexEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        entries.sort_by_key(|(_, e)| e.offset);
        entries
    }

    /// Rebuild an index by scanning records from the start of `reader`.
    ///
    /// Scanning stops at the first record that is incomplete or fails to
    /// decode; everything before it is the live set. Only I/O errors other
    /// than a short read are returned as errors.
    pub fn rebuild<R: Read>(reader: R, codec: &RecordCodec) -> Result<RebuildReport> {
        let mut reader = BufReader::new(reader);
        let mut index = OffsetIndex::new();
        let mut offset: u64 = 0;
        let mut records = 0usize;

        let stopped_at = loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            let got = read_full(&mut reader, &mut prefix)?;
            if got == 0 {
                break None;
            }
            if got < LENGTH_PREFIX_SIZE {
                break Some(DecodeError::Truncated {
                    needed: LENGTH_PREFIX_SIZE,
                    available: got,
                });
            }

            let payload_len = match read_length_prefix(&prefix) {
                Ok(len) => len,
                Err(e) => break Some(e),
            };

            let mut payload = Vec::new();
            (&mut reader)
                .take(payload_len as u64)
                .read_to_end(&mut payload)?;
            if payload.len() < payload_len {
                break Some(DecodeError::Truncated {
                    needed: LENGTH_PREFIX_SIZE + payload_len,
                    available: LENGTH_PREFIX_SIZE + payload.len(),
                });
            }

            match codec.decode_payload(&payload) {
                Ok((table, entity)) => {
                    let length = (LENGTH_PREFIX_SIZE + payload_len) as u32;
                    index.put(IndexKey::new(table, entity.key), offset, length);
                    offset += length as u64;
                    records += 1;
                }
                Err(e) => break Some(e),
            }
        };

        Ok(RebuildReport {
            index,
            valid_len: offset,
            records,
            stopped_at,
        })
    }
}

/// Outcome of [`OffsetIndex::rebuild`].
#[derive(Debug)]
pub struct RebuildReport {
    /// Live set built from the valid prefix of the file.
    pub index: OffsetIndex,
    /// Length of the valid prefix; bytes past it are an invalid tail.
    pub valid_len: u64,
    /// Number of valid records scanned (superseded ones included).
    pub records: usize,
    /// Why scanning stopped before end of file, if it did.
    pub stopped_at: Option<DecodeError>,
}

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
