//! Columnar data file codec
//!
//! Layout:
//! ```text
//! header  magic "LKDF" | version u16 | flags u16 | row_count u32 | column_count u32
//! body    bincode(DataFileBody)
//! footer  crc32(header + body) u32 | magic "LKDE"
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::ids::{ColumnId, RowId};
use crate::manifest::{EntryStats, StoredRow, compute_stats};
use crate::value::Value;

const DATA_MAGIC: u32 = u32::from_be_bytes(*b"LKDF");
const DATA_FOOTER_MAGIC: u32 = u32::from_be_bytes(*b"LKDE");
const DATA_VERSION: u16 = 1;
const HEADER_LEN: usize = 16;
const FOOTER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum DataFileError {
    #[error("data file too short ({0} bytes)")]
    Truncated(usize),

    #[error("invalid magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("unsupported data file version {0}")]
    UnsupportedVersion(u16),

    #[error("checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    Checksum { expected: u32, actual: u32 },

    #[error("corrupt data file: {0}")]
    Corrupt(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// One column's values; `None` marks rows written before the column existed
#[derive(Debug, Serialize, Deserialize)]
struct ColumnChunk {
    column_id: ColumnId,
    values: Vec<Option<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataFileBody {
    row_ids: Vec<RowId>,
    chunks: Vec<ColumnChunk>,
}

/// Encoded file contents plus the statistics computed while writing
pub struct EncodedFile {
    pub data: Bytes,
    pub stats: EntryStats,
}

/// Encode rows into a columnar data file
pub fn encode_rows(rows: &[StoredRow]) -> Result<EncodedFile, DataFileError> {
    let columns: BTreeSet<ColumnId> = rows
        .iter()
        .flat_map(|r| r.values.keys().copied())
        .collect();

    let chunks = columns
        .iter()
        .map(|column_id| ColumnChunk {
            column_id: *column_id,
            values: rows.iter().map(|r| r.values.get(column_id).cloned()).collect(),
        })
        .collect::<Vec<_>>();

    let body = DataFileBody {
        row_ids: rows.iter().map(|r| r.row_id).collect(),
        chunks,
    };
    let encoded = bincode::serialize(&body)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + encoded.len() + FOOTER_LEN);
    buf.put_u32_le(DATA_MAGIC);
    buf.put_u16_le(DATA_VERSION);
    buf.put_u16_le(0); // flags
    buf.put_u32_le(rows.len() as u32);
    buf.put_u32_le(columns.len() as u32);
    buf.put_slice(&encoded);

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.put_u32_le(DATA_FOOTER_MAGIC);

    Ok(EncodedFile {
        data: buf.freeze(),
        stats: compute_stats(rows),
    })
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Decode a data file back into stored rows
pub fn decode_rows(data: &[u8]) -> Result<Vec<StoredRow>, DataFileError> {
    if data.len() < HEADER_LEN + FOOTER_LEN {
        return Err(DataFileError::Truncated(data.len()));
    }

    let magic = read_u32(data, 0);
    if magic != DATA_MAGIC {
        return Err(DataFileError::BadMagic {
            expected: DATA_MAGIC,
            actual: magic,
        });
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != DATA_VERSION {
        return Err(DataFileError::UnsupportedVersion(version));
    }

    let row_count = read_u32(data, 8) as usize;
    let column_count = read_u32(data, 12) as usize;

    let footer_start = data.len() - FOOTER_LEN;
    let footer_magic = read_u32(data, footer_start + 4);
    if footer_magic != DATA_FOOTER_MAGIC {
        return Err(DataFileError::BadMagic {
            expected: DATA_FOOTER_MAGIC,
            actual: footer_magic,
        });
    }

    let stored_crc = read_u32(data, footer_start);
    let computed_crc = crc32fast::hash(&data[..footer_start]);
    if stored_crc != computed_crc {
        return Err(DataFileError::Checksum {
            expected: stored_crc,
            actual: computed_crc,
        });
    }

    let body: DataFileBody = bincode::deserialize(&data[HEADER_LEN..footer_start])?;
    if body.row_ids.len() != row_count || body.chunks.len() != column_count {
        return Err(DataFileError::Corrupt(format!(
            "header declares {} rows x {} columns, body has {} x {}",
            row_count,
            column_count,
            body.row_ids.len(),
            body.chunks.len()
        )));
    }

    let mut rows: Vec<StoredRow> = body
        .row_ids
        .iter()
        .map(|row_id| StoredRow {
            row_id: *row_id,
            values: BTreeMap::new(),
        })
        .collect();

    for chunk in body.chunks {
        if chunk.values.len() != row_count {
            return Err(DataFileError::Corrupt(format!(
                "column {} has {} values for {} rows",
                chunk.column_id.0,
                chunk.values.len(),
                row_count
            )));
        }
        for (row, value) in rows.iter_mut().zip(chunk.values) {
            if let Some(value) = value {
                row.values.insert(chunk.column_id, value);
            }
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn sample_rows() -> Vec<StoredRow> {
        vec![
            StoredRow {
                row_id: RowId(1),
                values: BTreeMap::from([
                    (ColumnId(1), Value::Integer(1)),
                    (ColumnId(2), Value::Text("Alice".into())),
                ]),
            },
            StoredRow {
                row_id: RowId(2),
                values: BTreeMap::from([
                    (ColumnId(1), Value::Integer(2)),
                    (ColumnId(2), Value::Null),
                    (
                        ColumnId(3),
                        Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                    ),
                ]),
            },
        ]
    }

    #[test]
    fn test_absent_columns_survive_encoding() {
        let rows = sample_rows();
        let encoded = encode_rows(&rows).unwrap();
        let decoded = decode_rows(&encoded.data).unwrap();
        assert_eq!(decoded, rows);
        assert!(!decoded[0].values.contains_key(&ColumnId(3)));

        let stats = &encoded.stats[&ColumnId(3)];
        assert_eq!(stats.value_count, 1);
        assert_eq!(encoded.stats[&ColumnId(2)].null_count, 1);
    }

    #[test]
    fn test_detects_corruption() {
        let encoded = encode_rows(&sample_rows()).unwrap();
        let mut bytes = encoded.data.to_vec();
        bytes[HEADER_LEN + 3] ^= 0xFF;
        assert!(matches!(
            decode_rows(&bytes),
            Err(DataFileError::Checksum { .. })
        ));

        assert!(matches!(
            decode_rows(&bytes[..10]),
            Err(DataFileError::Truncated(10))
        ));
    }
}
