//! Column blob codec.
//!
//! A column blob holds all rows of one `(table, column)` pair as raw byte
//! payloads with random row access:
//!
//! ```text
//! magic "STBC" | version u32 | row_count u64
//! offsets (row_count + 1) x u64      absolute payload offsets
//! payload bytes
//! ```
//!
//! All integers little-endian. Row `i`'s payload spans
//! `payload[offsets[i] .. offsets[i + 1]]`.

use strobe_common::{Result, StrobeError};

const COLUMN_MAGIC: &[u8; 4] = b"STBC";
const COLUMN_VERSION: u32 = 1;

/// Encode `rows` into a column blob.
pub fn encode_column(rows: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = rows.iter().map(|r| r.len()).sum();
    let mut out = Vec::with_capacity(16 + (rows.len() + 1) * 8 + payload_len);
    out.extend_from_slice(COLUMN_MAGIC);
    out.extend_from_slice(&COLUMN_VERSION.to_le_bytes());
    out.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    let mut offset = 0u64;
    for row in rows {
        out.extend_from_slice(&offset.to_le_bytes());
        offset += row.len() as u64;
    }
    out.extend_from_slice(&offset.to_le_bytes());
    for row in rows {
        out.extend_from_slice(row);
    }
    out
}

/// Zero-copy reader over an encoded column blob.
pub struct ColumnReader<'a> {
    row_count: usize,
    offsets: &'a [u8],
    payload: &'a [u8],
}

impl<'a> ColumnReader<'a> {
    /// Validate framing and build a reader over `blob`.
    pub fn new(blob: &'a [u8]) -> Result<Self> {
        if blob.len() < 16 || &blob[0..4] != COLUMN_MAGIC {
            return Err(StrobeError::Storage("bad column blob magic".to_string()));
        }
        let version = u32::from_le_bytes(blob[4..8].try_into().expect("fixed slice"));
        if version != COLUMN_VERSION {
            return Err(StrobeError::Storage(format!(
                "unsupported column blob version {version}"
            )));
        }
        let row_count = u64::from_le_bytes(blob[8..16].try_into().expect("fixed slice")) as usize;
        let offsets_end = row_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(16))
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| {
                StrobeError::Storage("column blob truncated in offset table".to_string())
            })?;
        let offsets = &blob[16..offsets_end];
        let payload = &blob[offsets_end..];
        let reader = Self {
            row_count,
            offsets,
            payload,
        };
        let total = reader.offset(row_count)?;
        if payload.len() as u64 != total {
            return Err(StrobeError::Storage(
                "column blob truncated in payload".to_string(),
            ));
        }
        Ok(reader)
    }

    /// Number of rows stored in the blob.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    fn offset(&self, index: usize) -> Result<u64> {
        let start = index * 8;
        Ok(u64::from_le_bytes(
            self.offsets[start..start + 8].try_into().expect("fixed slice"),
        ))
    }

    /// Read one row's payload.
    pub fn read_row(&self, row: usize) -> Result<&'a [u8]> {
        if row >= self.row_count {
            return Err(StrobeError::Storage(format!(
                "row {row} out of range (rows={})",
                self.row_count
            )));
        }
        let start = self.offset(row)? as usize;
        let end = self.offset(row + 1)? as usize;
        Ok(&self.payload[start..end])
    }

    /// Read a set of rows in the given order, copying each payload.
    pub fn read_rows(&self, rows: &[i64]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(rows.len());
        for &row in rows {
            if row < 0 {
                return Err(StrobeError::Storage(format!("negative row index {row}")));
            }
            out.push(self.read_row(row as usize)?.to_vec());
        }
        Ok(out)
    }
}
