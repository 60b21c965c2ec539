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

//! Metadata model shared by the builder, the reader and the index itself.

/// Row-local identifier of a document within a row group.
pub type DocumentId = u32;

pub type RowGroupId = u32;

pub type BatchId = u32;

pub type SnapshotId = u64;

/// Range of snapshots covered by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRange {
    pub min_snapshot_id: SnapshotId,
    pub max_snapshot_id: SnapshotId,
}

impl SnapshotRange {
    pub fn new(min_snapshot_id: SnapshotId, max_snapshot_id: SnapshotId) -> Self {
        Self {
            min_snapshot_id,
            max_snapshot_id,
        }
    }

    pub fn intersects(&self, other: &SnapshotRange) -> bool {
        self.min_snapshot_id <= other.max_snapshot_id
            && other.min_snapshot_id <= self.max_snapshot_id
    }
}

/// A horizontal partition of a batch. Bitmap indexes are built per
/// (row group, column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroupInfo {
    pub id: RowGroupId,
    /// Total number of documents in the row group.
    pub num_docs: u32,
}

impl RowGroupInfo {
    pub fn new(id: RowGroupId, num_docs: u32) -> Self {
        Self { id, num_docs }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchInfo {
    pub id: BatchId,
    pub batch_size: i64,
    pub snapshot_range: SnapshotRange,
    pub row_groups: Vec<RowGroupInfo>,
}

impl BatchInfo {
    pub fn row_group(&self, rg_id: RowGroupId) -> Option<&RowGroupInfo> {
        self.row_groups.iter().find(|rg| rg.id == rg_id)
    }
}

/// Element type of an indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

/// Reference to an indexed column of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnReference {
    /// Dotted path of the column inside the document schema,
    /// e.g. `airport.weather.temperature`.
    pub dotted_path: String,
    pub value_type: ValueType,
}

impl ColumnReference {
    pub fn new(dotted_path: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            dotted_path: dotted_path.into(),
            value_type,
        }
    }
}

/// How bits are distributed across the per-component bitmaps.
///
/// Equality answers point lookups with a single bitmap per component but
/// cannot answer range predicates; interval and range trade extra bitmap
/// combinations for range support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    Equality = 0,
    Interval = 1,
    Range = 2,
}

impl Encoding {
    pub fn from_u8(value: u8) -> Option<Encoding> {
        match value {
            0 => Some(Encoding::Equality),
            1 => Some(Encoding::Interval),
            2 => Some(Encoding::Range),
            _ => None,
        }
    }
}

/// Basis construction strategy: two large bases of roughly sqrt(cardinality)
/// each, or many binary bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Bitmap,
    Bitsliced,
}

/// Endpoint flags of a range predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFlags {
    /// Both endpoints excluded.
    Open,
    /// Left endpoint included.
    IncludeLeft,
    /// Right endpoint included.
    IncludeRight,
    /// Both endpoints included.
    Closed,
}

impl RangeFlags {
    pub fn includes_left(self) -> bool {
        matches!(self, RangeFlags::IncludeLeft | RangeFlags::Closed)
    }

    pub fn includes_right(self) -> bool {
        matches!(self, RangeFlags::IncludeRight | RangeFlags::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_range_intersects() {
        let a = SnapshotRange::new(10, 20);
        assert!(a.intersects(&SnapshotRange::new(20, 30)));
        assert!(a.intersects(&SnapshotRange::new(0, 10)));
        assert!(!a.intersects(&SnapshotRange::new(21, 30)));
    }

    #[test]
    fn test_encoding_round_trip() {
        for enc in [Encoding::Equality, Encoding::Interval, Encoding::Range] {
            assert_eq!(Encoding::from_u8(enc as u8), Some(enc));
        }
        assert_eq!(Encoding::from_u8(3), None);
    }

    #[test]
    fn test_range_flags() {
        assert!(RangeFlags::Closed.includes_left());
        assert!(RangeFlags::Closed.includes_right());
        assert!(RangeFlags::IncludeLeft.includes_left());
        assert!(!RangeFlags::IncludeLeft.includes_right());
        assert!(!RangeFlags::Open.includes_left());
        assert!(!RangeFlags::Open.includes_right());
    }
}
