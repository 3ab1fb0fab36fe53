//! WIREDKV - Record Codec
//! Frames entities into the on-disk record format and parses them back.
//!
//! ## Record Format
//! ```text
//! [length: 4 bytes (LE)][payload: length bytes]
//! ```
//! `payload` is the envelope output for the plaintext below:
//! ```text
//! [table_len: 4][table][key_len: 4][key][value_len: 4][value][meta_flag: 1]([meta_len: 4][meta])[crc: 4]
//! ```
//! All integers are little-endian. The CRC32 covers every plaintext byte
//! before it.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DecodeError, Result, WiredError};
use crate::types::{Entity, MAX_KEY_LEN, MAX_METADATA_LEN, MAX_TABLE_NAME_LEN, MAX_VALUE_LEN};

use super::envelope::Envelope;

/// Size of the record length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;
const CRC_SIZE: usize = 4;
const META_ABSENT: u8 = 0;
const META_PRESENT: u8 = 1;

/// Upper bound on any payload this codec can have produced.
/// Larger declared lengths are garbage, not a short read.
pub const MAX_PAYLOAD_LEN: usize =
    MAX_TABLE_NAME_LEN + MAX_KEY_LEN + MAX_VALUE_LEN + MAX_METADATA_LEN + 64 + 1024;

/// An entity recovered from a record, with the table it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub table: String,
    pub entity: Entity,
    /// Total bytes the record occupies on disk, prefix included.
    pub record_len: usize,
}

/// Encodes and decodes records through a shared envelope.
#[derive(Clone)]
pub struct RecordCodec {
    envelope: Arc<dyn Envelope>,
}

impl RecordCodec {
    pub fn new(envelope: Arc<dyn Envelope>) -> Self {
        Self { envelope }
    }

    /// Name of the envelope in use.
    pub fn envelope_name(&self) -> &str {
        self.envelope.name()
    }

    /// Encode one entity of `table` into a complete record.
    /// Nothing is returned unless every step succeeded.
    pub fn encode(&self, table: &str, entity: &Entity) -> Result<Vec<u8>> {
        let plaintext = encode_plaintext(table, entity)?;
        let payload = self.envelope.encode(&plaintext)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(WiredError::Encode(format!(
                "record payload of {} bytes exceeds limit",
                payload.len()
            )));
        }

        let mut record = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        record.put_u32_le(payload.len() as u32);
        record.extend_from_slice(&payload);
        Ok(record)
    }

    /// Decode the record at the start of `bytes`. Trailing bytes after the
    /// record are ignored; `record_len` tells the caller where the next one
    /// starts.
    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<DecodedRecord, DecodeError> {
        let payload_len = read_length_prefix(bytes)?;
        let needed = LENGTH_PREFIX_SIZE + payload_len;
        if bytes.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        let (table, entity) = self.decode_payload(&bytes[LENGTH_PREFIX_SIZE..needed])?;
        Ok(DecodedRecord {
            table,
            entity,
            record_len: needed,
        })
    }

    /// Decode an already-framed payload (the bytes after the prefix).
    pub fn decode_payload(
        &self,
        payload: &[u8],
    ) -> std::result::Result<(String, Entity), DecodeError> {
        let plaintext = self.envelope.decode(payload)?;
        decode_plaintext(&plaintext)
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("envelope", &self.envelope.name())
            .finish()
    }
}

/// Read and sanity-check a record's length prefix.
pub fn read_length_prefix(bytes: &[u8]) -> std::result::Result<usize, DecodeError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(DecodeError::Truncated {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }
    let len = (&bytes[..LENGTH_PREFIX_SIZE]).get_u32_le() as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::Malformed(format!(
            "declared payload length {} exceeds limit",
            len
        )));
    }
    Ok(len)
}

fn encode_plaintext(table: &str, entity: &Entity) -> Result<Vec<u8>> {
    check_len("table name", table.len(), MAX_TABLE_NAME_LEN)?;
    check_len("key", entity.key.len(), MAX_KEY_LEN)?;
    check_len("value", entity.value.len(), MAX_VALUE_LEN)?;
    let meta_len = entity.metadata.as_ref().map_or(0, Vec::len);
    check_len("metadata", meta_len, MAX_METADATA_LEN)?;

    let mut buf = BytesMut::with_capacity(
        13 + table.len() + entity.key.len() + entity.value.len() + 4 + meta_len + CRC_SIZE,
    );
    buf.put_u32_le(table.len() as u32);
    buf.put_slice(table.as_bytes());
    buf.put_u32_le(entity.key.len() as u32);
    buf.put_slice(&entity.key);
    buf.put_u32_le(entity.value.len() as u32);
    buf.put_slice(&entity.value);
    match &entity.metadata {
        Some(meta) => {
            buf.put_u8(META_PRESENT);
            buf.put_u32_le(meta.len() as u32);
            buf.put_slice(meta);
        }
        None => buf.put_u8(META_ABSENT),
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    Ok(buf.to_vec())
}

fn check_len(what: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(WiredError::Encode(format!(
            "{} of {} bytes exceeds limit of {}",
            what, len, max
        )));
    }
    Ok(())
}

fn decode_plaintext(plaintext: &[u8]) -> std::result::Result<(String, Entity), DecodeError> {
    if plaintext.len() < CRC_SIZE {
        return Err(DecodeError::Malformed("payload shorter than checksum".into()));
    }
    let (body, mut crc_bytes) = plaintext.split_at(plaintext.len() - CRC_SIZE);
    let stored_crc = crc_bytes.get_u32_le();
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(DecodeError::Malformed(format!(
            "checksum mismatch (expected {:#010x}, got {:#010x})",
            stored_crc, computed_crc
        )));
    }

    let mut buf = body;
    let table = take_chunk(&mut buf, "table name")?;
    let table = String::from_utf8(table.to_vec())
        .map_err(|_| DecodeError::Malformed("table name is not UTF-8".into()))?;
    let key = take_chunk(&mut buf, "key")?.to_vec();
    let value = take_chunk(&mut buf, "value")?.to_vec();

    if !buf.has_remaining() {
        return Err(DecodeError::Malformed("missing metadata flag".into()));
    }
    let metadata = match buf.get_u8() {
        META_ABSENT => None,
        META_PRESENT => Some(take_chunk(&mut buf, "metadata")?.to_vec()),
        flag => {
            return Err(DecodeError::Malformed(format!(
                "unknown metadata flag {}",
                flag
            )))
        }
    };
    if buf.has_remaining() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after entity",
            buf.remaining()
        )));
    }

    Ok((
        table,
        Entity {
            key,
            value,
            metadata,
        },
    ))
}

/// Split a `[len: u32][bytes]` chunk off the front of `buf`.
fn take_chunk<'a>(buf: &mut &'a [u8], what: &str) -> std::result::Result<&'a [u8], DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Malformed(format!("missing {} length", what)));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Malformed(format!(
            "{} length {} overruns payload",
            what, len
        )));
    }
    let (chunk, rest) = buf.split_at(len);
    *buf = rest;
    Ok(chunk)
}
