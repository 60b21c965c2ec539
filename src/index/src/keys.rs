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

//! KV key and value layouts.
//!
//! All keys embed `(rg_id, column_path)` first so that every record of one
//! index forms a consecutive block under the store's lexicographic byte
//! order. Key-embedded integers are big-endian for that reason; values keep
//! the little-endian layout.

use snafu::ensure;

use crate::error::{DecodeOffsetRangeSnafu, Result};
use crate::model::RowGroupId;
use crate::value::IndexValue;

/// Bitmap number reserved for the all-values bitmap of a storage. Component
/// bitmaps follow in iteration order.
pub const ALL_VALUES_BITMAP_NUMBER: u16 = 0;

/// A `[start, end)` byte range inside the shared bitmaps file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetRange {
    pub start: u32,
    pub end: u32,
}

impl OffsetRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.start.to_le_bytes());
        buf[4..].copy_from_slice(&self.end.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<OffsetRange> {
        ensure!(buf.len() == 8, DecodeOffsetRangeSnafu { len: buf.len() });
        Ok(OffsetRange {
            start: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            end: u32::from_le_bytes(buf[4..].try_into().unwrap()),
        })
    }
}

/// Key prefix shared by every record of one (row group, column) index:
/// `rg_id (be) . column_path . 0x00`. The NUL marks the end of the path so
/// the following field starts at a known position and keys group by path.
pub fn column_prefix(rg_id: RowGroupId, column_path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + column_path.len() + 1);
    key.extend_from_slice(&rg_id.to_be_bytes());
    key.extend_from_slice(column_path.as_bytes());
    key.push(0);
    key
}

/// Key of a bitmap storage in the storage-offsets and aux-data tables.
pub fn storage_key(rg_id: RowGroupId, column_path: &str) -> Vec<u8> {
    column_prefix(rg_id, column_path)
}

/// Key of one bitmap in the bitmap-offsets table. Numbers sort within the
/// column block, so one cursor seek to number 0 yields the whole storage.
pub fn bitmap_key(rg_id: RowGroupId, column_path: &str, number: u16) -> Vec<u8> {
    let mut key = column_prefix(rg_id, column_path);
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Key of one attribute value in the mapping table; the payload is the
/// mapped ordinal as little-endian `u32`.
pub fn attribute_key<T: IndexValue>(rg_id: RowGroupId, column_path: &str, value: &T) -> Vec<u8> {
    let mut key = column_prefix(rg_id, column_path);
    value.encode_ordered(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_range_round_trip() {
        let range = OffsetRange::new(4096, 12288);
        assert_eq!(range.len(), 8192);
        assert_eq!(OffsetRange::from_bytes(&range.to_bytes()).unwrap(), range);
        assert!(OffsetRange::from_bytes(&[0; 7]).is_err());
    }

    #[test]
    fn test_bitmap_keys_are_consecutive() {
        let keys: Vec<_> = (0..300u16).map(|n| bitmap_key(7, "a.b", n)).collect();
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }
        assert!(keys.iter().all(|k| k.starts_with(&column_prefix(7, "a.b"))));
    }

    #[test]
    fn test_keys_sort_by_row_group_then_path() {
        assert!(bitmap_key(1, "b", 9) < bitmap_key(2, "a", 0));
        assert!(bitmap_key(1, "a", 9) < bitmap_key(1, "b", 0));
        assert!(storage_key(1, "a") < storage_key(1, "a.b"));
    }

    #[test]
    fn test_attribute_keys_sort_by_value() {
        let lo = attribute_key(3, "col", &-50_000_000_000_000i64);
        let hi = attribute_key(3, "col", &-40_000_000_000_000i64);
        let top = attribute_key(3, "col", &10_000_000_000_000i64);
        assert!(lo < hi && hi < top);

        let a = attribute_key(3, "col", &"USA".to_string());
        let b = attribute_key(3, "col", &"armenia".to_string());
        assert!(a < b);
        assert!(a.starts_with(&column_prefix(3, "col")));
    }
}
