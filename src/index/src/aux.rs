// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-index descriptor persisted next to the bitmaps.

use snafu::{ensure, OptionExt};

use crate::decompose::ValueDecomposer;
use crate::error::{DecodeAuxDataSnafu, Result};
use crate::model::Encoding;

/// Upper bound on serialized vector lengths, to reject corrupt records
/// before allocating.
const MAX_COMPONENTS: u32 = 1 << 16;

/// Everything a persisted index needs to be reopened: the decomposition
/// basis, per-component bitmap counts, encoding, cardinality and the mapped
/// value range.
#[derive(Debug, Clone)]
pub struct AuxData {
    /// Decomposes mapped values over the chosen basis.
    pub decomposer: ValueDecomposer,
    /// Number of bitmaps per component.
    pub bitmap_counts: Vec<u32>,
    /// Number of distinct attribute values observed at build time.
    pub cardinality: u32,
    pub encoding: Encoding,
    /// Whether attribute values go through the mapping table. When unset,
    /// the mapped value of `v` is `v - min_mapped_value`.
    pub use_value_mapping: bool,
    pub min_mapped_value: i64,
    pub max_mapped_value: i64,
}

impl AuxData {
    /// Width of the mapped value domain, `max_mapped_value - min_mapped_value`.
    pub fn mapped_span(&self) -> i64 {
        self.max_mapped_value - self.min_mapped_value
    }

    /// Serializes into the fixed little-endian layout. The encoding tag is
    /// written twice (one byte, then four bytes) to match the legacy record
    /// layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let basis = self.decomposer.basis();
        let mut buf = Vec::with_capacity(
            8 + 4 * (basis.len() + self.bitmap_counts.len()) + 1 + 4 + 4 + 1 + 16,
        );
        buf.extend_from_slice(&(basis.len() as u32).to_le_bytes());
        for &base in basis {
            buf.extend_from_slice(&base.to_le_bytes());
        }
        buf.extend_from_slice(&(self.bitmap_counts.len() as u32).to_le_bytes());
        for &count in &self.bitmap_counts {
            buf.extend_from_slice(&count.to_le_bytes());
        }
        buf.push(self.encoding as u8);
        buf.extend_from_slice(&self.cardinality.to_le_bytes());
        buf.extend_from_slice(&(self.encoding as i32).to_le_bytes());
        buf.push(self.use_value_mapping as u8);
        buf.extend_from_slice(&self.min_mapped_value.to_le_bytes());
        buf.extend_from_slice(&self.max_mapped_value.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<AuxData> {
        let mut cursor = Cursor { buf, offset: 0 };

        let basis_len = cursor.read_u32()?;
        ensure!(
            basis_len <= MAX_COMPONENTS,
            DecodeAuxDataSnafu {
                reason: "basis length out of bounds",
            }
        );
        let mut basis = Vec::with_capacity(basis_len as usize);
        for _ in 0..basis_len {
            basis.push(cursor.read_u32()?);
        }

        let counts_len = cursor.read_u32()?;
        ensure!(
            counts_len <= MAX_COMPONENTS,
            DecodeAuxDataSnafu {
                reason: "bitmap count length out of bounds",
            }
        );
        let mut bitmap_counts = Vec::with_capacity(counts_len as usize);
        for _ in 0..counts_len {
            bitmap_counts.push(cursor.read_u32()?);
        }

        let encoding = Encoding::from_u8(cursor.read_u8()?).context(DecodeAuxDataSnafu {
            reason: "unknown encoding tag",
        })?;
        let cardinality = cursor.read_u32()?;
        let encoding_again = cursor.read_i32()?;
        ensure!(
            encoding_again == encoding as i32,
            DecodeAuxDataSnafu {
                reason: "encoding tags disagree",
            }
        );
        let use_value_mapping = cursor.read_u8()? != 0;
        let min_mapped_value = cursor.read_i64()?;
        let max_mapped_value = cursor.read_i64()?;

        Ok(AuxData {
            decomposer: ValueDecomposer::new(basis),
            bitmap_counts,
            cardinality,
            encoding,
            use_value_mapping,
            min_mapped_value,
            max_mapped_value,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.offset + len;
        let slice = self.buf.get(self.offset..end).context(DecodeAuxDataSnafu {
            reason: "record truncated",
        })?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}
