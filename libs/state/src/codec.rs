//! Binary checkpoint codec.
//!
//! # Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! [u16 format_version][u32 record_count]{record}*
//!
//! record = [str account][i64 create_time][u32 id][str name]
//!          [str partition][str pool][str qos][u32 user_id][u64 size]
//!
//! str    = [u32 len] then len bytes, the last being NUL; len 0 is null
//! ```

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::record::{AllocationKey, AllocationRecord};

/// First record layout.
pub const FORMAT_V1: u16 = 1;

/// Version written by the encoder.
pub const CURRENT_FORMAT_VERSION: u16 = FORMAT_V1;

/// Versions the decoder can read.
pub const SUPPORTED_FORMAT_VERSIONS: &[u16] = &[FORMAT_V1];

/// Sentinel for "no version present".
pub const UNKNOWN_FORMAT_VERSION: u16 = 0xfffe;

/// Smallest possible encoded record (all strings null).
const MIN_RECORD_LEN: usize = 5 * 4 + 8 + 4 + 4 + 8;

/// Initial encode buffer size.
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Checkpoint codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The version tag is the sentinel or one this build cannot read.
    #[error("incompatible checkpoint format version {version:#06x}")]
    IncompatibleVersion { version: u16 },

    /// The stream ended inside the header.
    #[error("truncated checkpoint header: missing {field}")]
    TruncatedHeader { field: &'static str },

    /// The stream ended inside a record.
    #[error("truncated checkpoint: missing {field} in record {index}")]
    TruncatedRecord { index: u32, field: &'static str },

    /// A string field is not NUL-terminated UTF-8.
    #[error("invalid {field} in record {index}: {reason}")]
    InvalidString {
        index: u32,
        field: &'static str,
        reason: &'static str,
    },

    /// Bytes remain after the declared records.
    #[error("{remaining} trailing bytes after {count} records")]
    TrailingBytes { count: u32, remaining: usize },
}

impl CodecError {
    /// Version incompatibility, as opposed to a damaged stream.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::IncompatibleVersion { .. })
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IncompatibleVersion { .. } => "incompatible_version",
            Self::TruncatedHeader { .. } => "truncated_header",
            Self::TruncatedRecord { .. } => "truncated_record",
            Self::InvalidString { .. } => "invalid_string",
            Self::TrailingBytes { .. } => "trailing_bytes",
        }
    }
}

/// A decoded checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub format_version: u16,
    /// Records in stream order, each fully decoded. Keys are unique.
    pub records: Vec<AllocationRecord>,
    /// Records dropped because they had no name or repeated an earlier
    /// record's name and user.
    pub skipped: u32,
}

/// Stateful encoder that remembers the largest checkpoint it produced, so
/// later buffers start big enough.
#[derive(Debug, Clone)]
pub struct CheckpointEncoder {
    high_water: usize,
}

impl Default for CheckpointEncoder {
    fn default() -> Self {
        Self {
            high_water: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl CheckpointEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode records with the current format version.
    pub fn encode<'a, I>(&mut self, records: I) -> Bytes
    where
        I: IntoIterator<Item = &'a AllocationRecord>,
    {
        let bytes = encode_into(
            BytesMut::with_capacity(self.high_water),
            CURRENT_FORMAT_VERSION,
            records,
        );
        self.high_water = self.high_water.max(bytes.len());
        bytes
    }
}

/// Encode records with an explicit format version.
pub fn encode_records<'a, I>(version: u16, records: I) -> Result<Bytes, CodecError>
where
    I: IntoIterator<Item = &'a AllocationRecord>,
{
    if !SUPPORTED_FORMAT_VERSIONS.contains(&version) {
        return Err(CodecError::IncompatibleVersion { version });
    }
    Ok(encode_into(
        BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        version,
        records,
    ))
}

fn encode_into<'a, I>(mut buf: BytesMut, version: u16, records: I) -> Bytes
where
    I: IntoIterator<Item = &'a AllocationRecord>,
{
    buf.put_u16(version);

    // Count is patched once iteration is done.
    let count_offset = buf.len();
    buf.put_u32(0);

    let mut count: u32 = 0;
    for record in records {
        put_record_v1(&mut buf, record);
        count += 1;
    }

    buf[count_offset..count_offset + 4].copy_from_slice(&count.to_be_bytes());
    buf.freeze()
}

fn put_record_v1(buf: &mut BytesMut, record: &AllocationRecord) {
    put_str(buf, record.account.as_deref());
    buf.put_i64(record.create_time);
    buf.put_u32(record.id);
    put_str(buf, Some(&record.name));
    put_str(buf, record.partition.as_deref());
    put_str(buf, record.pool.as_deref());
    put_str(buf, record.qos.as_deref());
    buf.put_u32(record.user_id);
    buf.put_u64(record.size);
}

fn put_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => buf.put_u32(0),
        Some(s) => {
            buf.put_u32(s.len() as u32 + 1);
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
        }
    }
}

/// Decode a checkpoint.
///
/// Nothing is returned unless every record decodes; callers never see a
/// partial stream. When a key repeats, the first record wins.
pub fn decode(data: &[u8]) -> Result<Checkpoint, CodecError> {
    let mut buf = data;

    let format_version = buf.try_get_u16().map_err(|_| CodecError::TruncatedHeader {
        field: "format_version",
    })?;
    if !SUPPORTED_FORMAT_VERSIONS.contains(&format_version) {
        return Err(CodecError::IncompatibleVersion {
            version: format_version,
        });
    }

    let count = buf.try_get_u32().map_err(|_| CodecError::TruncatedHeader {
        field: "record_count",
    })?;

    let mut records = Vec::with_capacity((count as usize).min(buf.remaining() / MIN_RECORD_LEN));
    let mut seen: HashSet<AllocationKey> = HashSet::with_capacity(records.capacity());
    let mut skipped = 0;
    for index in 0..count {
        let mut reader = RecordReader {
            buf: &mut buf,
            index,
        };
        let decoded = match format_version {
            FORMAT_V1 => reader.record_v1()?,
            version => return Err(CodecError::IncompatibleVersion { version }),
        };

        match decoded {
            Some(record) if seen.insert(record.key()) => records.push(record),
            Some(record) => {
                warn!(
                    index,
                    name = %record.name,
                    user_id = record.user_id,
                    "Skipping duplicate checkpoint record"
                );
                skipped += 1;
            }
            None => {
                warn!(index, "Skipping checkpoint record without a name");
                skipped += 1;
            }
        }
    }

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes {
            count,
            remaining: buf.remaining(),
        });
    }

    Ok(Checkpoint {
        format_version,
        records,
        skipped,
    })
}

struct RecordReader<'a, 'b> {
    buf: &'a mut &'b [u8],
    index: u32,
}

impl<'b> RecordReader<'_, 'b> {
    /// Returns `None` for a record whose name is null.
    fn record_v1(&mut self) -> Result<Option<AllocationRecord>, CodecError> {
        let account = self.string("account")?;
        let create_time = self
            .buf
            .try_get_i64()
            .map_err(|_| self.truncated("create_time"))?;
        let id = self.buf.try_get_u32().map_err(|_| self.truncated("id"))?;
        let name = self.string("name")?;
        let partition = self.string("partition")?;
        let pool = self.string("pool")?;
        let qos = self.string("qos")?;
        let user_id = self
            .buf
            .try_get_u32()
            .map_err(|_| self.truncated("user_id"))?;
        let size = self.buf.try_get_u64().map_err(|_| self.truncated("size"))?;

        let Some(name) = name else {
            return Ok(None);
        };

        let mut record = AllocationRecord::new(id, name, user_id, create_time);
        record.account = account;
        record.partition = partition;
        record.pool = pool;
        record.qos = qos;
        record.size = size;
        Ok(Some(record))
    }

    fn string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        let len = self.buf.try_get_u32().map_err(|_| self.truncated(field))? as usize;
        if len == 0 {
            return Ok(None);
        }
        if self.buf.remaining() < len {
            return Err(self.truncated(field));
        }

        let current: &'b [u8] = *self.buf;
        let (raw, rest) = current.split_at(len);
        *self.buf = rest;

        let Some((&0, body)) = raw.split_last() else {
            return Err(self.invalid(field, "missing NUL terminator"));
        };
        let s = std::str::from_utf8(body).map_err(|_| self.invalid(field, "not UTF-8"))?;
        Ok(Some(s.to_string()))
    }

    fn truncated(&self, field: &'static str) -> CodecError {
        CodecError::TruncatedRecord {
            index: self.index,
            field,
        }
    }

    fn invalid(&self, field: &'static str, reason: &'static str) -> CodecError {
        CodecError::InvalidString {
            index: self.index,
            field,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, user_id: u32) -> AllocationRecord {
        let mut rec = AllocationRecord::new(9, name, user_id, 1_700_000_000);
        rec.account = Some("physics".to_string());
        rec.partition = Some("gpu".to_string());
        rec.pool = None;
        rec.qos = Some(String::new());
        rec.size = 1 << 40;
        rec
    }

    #[test]
    fn test_header_layout() {
        let rec = sample("scratch", 1000);
        let bytes = encode_records(FORMAT_V1, [&rec]).unwrap();

        assert_eq!(&bytes[..2], &FORMAT_V1.to_be_bytes());
        assert_eq!(&bytes[2..6], &1u32.to_be_bytes());
        // account: len 8 ("physics" + NUL)
        assert_eq!(&bytes[6..10], &8u32.to_be_bytes());
        assert_eq!(&bytes[10..18], b"physics\0");
    }

    #[test]
    fn test_count_is_patched() {
        let recs = [sample("a", 1), sample("b", 1), sample("c", 2)];
        let bytes = CheckpointEncoder::new().encode(recs.iter());
        assert_eq!(&bytes[2..6], &3u32.to_be_bytes());

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.records.len(), 3);
    }

    #[test]
    fn test_null_and_empty_strings_are_distinct() {
        let rec = sample("scratch", 1000);
        let bytes = encode_records(FORMAT_V1, [&rec]).unwrap();
        let decoded = decode(&bytes).unwrap();

        let got = &decoded.records[0];
        assert_eq!(got.pool, None);
        assert_eq!(got.qos, Some(String::new()));
        assert!(got.same_persisted_fields(&rec));
    }

    #[test]
    fn test_sentinel_version_is_incompatible() {
        let mut data = UNKNOWN_FORMAT_VERSION.to_be_bytes().to_vec();
        data.extend_from_slice(&0u32.to_be_bytes());

        let err = decode(&data).unwrap_err();
        assert!(err.is_incompatible());
    }

    #[test]
    fn test_unknown_future_version_is_incompatible() {
        let data = [0x7f, 0x00, 0, 0, 0, 0];
        assert_eq!(
            decode(&data).unwrap_err(),
            CodecError::IncompatibleVersion { version: 0x7f00 }
        );
    }

    #[test]
    fn test_encode_rejects_unknown_version() {
        let rec = sample("x", 1);
        assert!(encode_records(UNKNOWN_FORMAT_VERSION, [&rec]).is_err());
    }

    #[test]
    fn test_truncated_record() {
        let recs = [sample("a", 1), sample("b", 1)];
        let bytes = encode_records(FORMAT_V1, recs.iter()).unwrap();
        let cut = &bytes[..bytes.len() - 3];

        let err = decode(cut).unwrap_err();
        assert_eq!(
            err,
            CodecError::TruncatedRecord {
                index: 1,
                field: "size"
            }
        );
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            decode(&[]).unwrap_err(),
            CodecError::TruncatedHeader {
                field: "format_version"
            }
        );
        assert_eq!(
            decode(&FORMAT_V1.to_be_bytes()).unwrap_err(),
            CodecError::TruncatedHeader {
                field: "record_count"
            }
        );
    }

    #[test]
    fn test_count_larger_than_stream() {
        let mut data = FORMAT_V1.to_be_bytes().to_vec();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedRecord { index: 0, .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let rec = sample("a", 1);
        let mut data = encode_records(FORMAT_V1, [&rec]).unwrap().to_vec();
        data.push(0xff);
        assert_eq!(
            decode(&data).unwrap_err(),
            CodecError::TrailingBytes {
                count: 1,
                remaining: 1
            }
        );
    }

    #[test]
    fn test_string_without_nul_is_invalid() {
        let mut data = FORMAT_V1.to_be_bytes().to_vec();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(b"ab");

        let err = decode(&data).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidString {
                index: 0,
                field: "account",
                ..
            }
        ));
    }

    #[test]
    fn test_null_name_record_is_skipped() {
        let mut data = FORMAT_V1.to_be_bytes().to_vec();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes()); // account
        data.extend_from_slice(&5i64.to_be_bytes()); // create_time
        data.extend_from_slice(&3u32.to_be_bytes()); // id
        data.extend_from_slice(&0u32.to_be_bytes()); // name (null)
        data.extend_from_slice(&0u32.to_be_bytes()); // partition
        data.extend_from_slice(&0u32.to_be_bytes()); // pool
        data.extend_from_slice(&0u32.to_be_bytes()); // qos
        data.extend_from_slice(&1000u32.to_be_bytes()); // user_id
        data.extend_from_slice(&64u64.to_be_bytes()); // size

        let decoded = decode(&data).unwrap();
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_repeated_key_keeps_first_record() {
        let mut first = sample("scratch", 1000);
        first.size = 1;
        let mut second = sample("scratch", 1000);
        second.id = 10;
        second.size = 2;
        let other_user = sample("scratch", 2000);

        let bytes = encode_records(FORMAT_V1, [&first, &second, &other_user]).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.skipped, 1);
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].size, 1);
        assert_eq!(decoded.records[0].id, 9);
        assert_eq!(decoded.records[1].user_id, 2000);
    }

    #[test]
    fn test_encoder_tracks_high_water() {
        let mut encoder = CheckpointEncoder::new();
        let big: Vec<_> = (0..2000).map(|i| sample(&i.to_string(), 1)).collect();
        let bytes = encoder.encode(big.iter());
        assert!(bytes.len() > DEFAULT_BUFFER_SIZE);
        assert_eq!(encoder.high_water, bytes.len());
    }
}
