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

//! Read side of a batch index: opening persisted indexes and routing
//! column predicates to them.

use std::fs::File;
use std::sync::Arc;

use roaring::RoaringBitmap;
use snafu::{OptionExt, ResultExt};
use tracing::debug;

use crate::aux::AuxData;
use crate::batch::BatchIndexPaths;
use crate::bitmap_index::BitmapIndex;
use crate::error::{InvalidArgumentSnafu, IoSnafu, Result};
use crate::io::IoPool;
use crate::keys::{storage_key, OffsetRange};
use crate::kv::Dictionary;
use crate::model::{BatchInfo, ColumnReference, RangeFlags, RowGroupId, ValueType};
use crate::storage::BitmapStorage;
use crate::value::{IndexValue, Value};
use crate::IndexConfig;

/// Comparison operator of a binary predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

/// Operator of a unary predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    IsNull,
    IsNotNull,
}

/// A column predicate the index can be asked about.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `column <op> constant`.
    BinaryConst { op: CompareOp, value: Value },
    /// `column IS [NOT] NULL`.
    Unary { op: UnaryOp },
}

/// How faithful the returned candidate set is to the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAccuracy {
    /// The index cannot answer; the caller must fall back to a scan.
    None,
    /// A superset of the matching documents.
    Coarse,
    /// Exactly the matching documents.
    Exact,
}

/// Candidate documents for a predicate, tagged with their accuracy.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub accuracy: IndexAccuracy,
    pub values: Option<RoaringBitmap>,
}

impl IndexResult {
    pub fn exact(values: RoaringBitmap) -> IndexResult {
        IndexResult {
            accuracy: IndexAccuracy::Exact,
            values: Some(values),
        }
    }

    pub fn none() -> IndexResult {
        IndexResult {
            accuracy: IndexAccuracy::None,
            values: None,
        }
    }
}

/// A type-erased document index for one (row group, column).
pub enum DocumentIndex {
    Bool(BitmapIndex<bool>),
    Int8(BitmapIndex<i8>),
    UInt8(BitmapIndex<u8>),
    Int16(BitmapIndex<i16>),
    UInt16(BitmapIndex<u16>),
    Int32(BitmapIndex<i32>),
    UInt32(BitmapIndex<u32>),
    Int64(BitmapIndex<i64>),
    UInt64(BitmapIndex<u64>),
    Float32(BitmapIndex<f32>),
    Float64(BitmapIndex<f64>),
    String(BitmapIndex<String>),
}

/// Runs `$body` with `$index` bound to the typed index of any variant.
macro_rules! for_any_index {
    ($self:expr, $index:ident => $body:expr) => {
        match $self {
            DocumentIndex::Bool($index) => $body,
            DocumentIndex::Int8($index) => $body,
            DocumentIndex::UInt8($index) => $body,
            DocumentIndex::Int16($index) => $body,
            DocumentIndex::UInt16($index) => $body,
            DocumentIndex::Int32($index) => $body,
            DocumentIndex::UInt32($index) => $body,
            DocumentIndex::Int64($index) => $body,
            DocumentIndex::UInt64($index) => $body,
            DocumentIndex::Float32($index) => $body,
            DocumentIndex::Float64($index) => $body,
            DocumentIndex::String($index) => $body,
        }
    };
}

impl DocumentIndex {
    /// Translates a predicate into index calls and returns the candidate
    /// document set. Shapes the index cannot answer (IS NULL, unknown
    /// operators, constants of a foreign type) report `IndexAccuracy::None`
    /// so the caller falls back to a scan.
    pub async fn find_candidate_documents(&self, predicate: &Predicate) -> Result<IndexResult> {
        let values = match predicate {
            Predicate::BinaryConst { op, value } => self.run_binary(*op, value).await?,
            Predicate::Unary {
                op: UnaryOp::IsNotNull,
            } => Some(for_any_index!(self, index => index.get_not_null().await)?),
            // IS NULL needs the complement against a universe of document
            // ids the index does not store.
            Predicate::Unary {
                op: UnaryOp::IsNull,
            } => None,
        };
        Ok(match values {
            Some(bitmap) => IndexResult::exact(bitmap),
            None => IndexResult::none(),
        })
    }

    async fn run_binary(&self, op: CompareOp, value: &Value) -> Result<Option<RoaringBitmap>> {
        macro_rules! typed {
            ($index:expr, $value:expr) => {
                binary_query($index, op, $value).await.map(Some)
            };
        }
        match (self, value) {
            (DocumentIndex::Bool(index), Value::Bool(v)) => typed!(index, v),
            (DocumentIndex::Int8(index), Value::Int8(v)) => typed!(index, v),
            (DocumentIndex::UInt8(index), Value::UInt8(v)) => typed!(index, v),
            (DocumentIndex::Int16(index), Value::Int16(v)) => typed!(index, v),
            (DocumentIndex::UInt16(index), Value::UInt16(v)) => typed!(index, v),
            (DocumentIndex::Int32(index), Value::Int32(v)) => typed!(index, v),
            (DocumentIndex::UInt32(index), Value::UInt32(v)) => typed!(index, v),
            (DocumentIndex::Int64(index), Value::Int64(v)) => typed!(index, v),
            (DocumentIndex::UInt64(index), Value::UInt64(v)) => typed!(index, v),
            (DocumentIndex::Float32(index), Value::Float32(v)) => typed!(index, v),
            (DocumentIndex::Float64(index), Value::Float64(v)) => typed!(index, v),
            (DocumentIndex::String(index), Value::String(v)) => typed!(index, v),
            _ => Ok(None),
        }
    }
}

async fn binary_query<T: IndexValue>(
    index: &BitmapIndex<T>,
    op: CompareOp,
    value: &T,
) -> Result<RoaringBitmap> {
    match op {
        CompareOp::Eq => index.lookup(value).await,
        CompareOp::NotEq => index.not_equals(value).await,
        CompareOp::Gt => index.greater(value, RangeFlags::Open).await,
        CompareOp::GtEq => index.greater(value, RangeFlags::IncludeLeft).await,
        CompareOp::Lt => index.lesser(value, RangeFlags::Open).await,
        CompareOp::LtEq => index.lesser(value, RangeFlags::IncludeRight).await,
    }
}

/// Opens the indexes of a previously built batch for querying.
pub struct BatchIndexReader {
    batch_info: Arc<BatchInfo>,
    file: Arc<File>,
    io: Arc<IoPool>,
    attr_values_kv: Arc<Dictionary>,
    aux_data_kv: Arc<Dictionary>,
    bitmap_offsets_kv: Arc<Dictionary>,
    storage_offsets_kv: Arc<Dictionary>,
    bitmap_cache_size: usize,
}

impl BatchIndexReader {
    pub fn new(
        batch_info: Arc<BatchInfo>,
        paths: &BatchIndexPaths,
        config: &IndexConfig,
    ) -> Result<BatchIndexReader> {
        let file = File::options()
            .read(true)
            .open(&paths.bitmaps)
            .context(IoSnafu)?;
        Ok(BatchIndexReader {
            batch_info,
            file: Arc::new(file),
            io: Arc::new(IoPool::new(config.io_queue_depth)),
            attr_values_kv: Arc::new(Dictionary::open(
                &paths.attribute_mapping,
                config.kv_map_size,
            )?),
            aux_data_kv: Arc::new(Dictionary::open(&paths.aux_data, config.kv_map_size)?),
            bitmap_offsets_kv: Arc::new(Dictionary::open(
                &paths.bitmap_offsets,
                config.kv_map_size,
            )?),
            storage_offsets_kv: Arc::new(Dictionary::open(
                &paths.storage_offsets,
                config.kv_map_size,
            )?),
            bitmap_cache_size: config.bitmap_cache_size,
        })
    }

    /// Materializes the index of one (row group, column). `None` means no
    /// index was built for that column.
    pub async fn open(
        &self,
        rg_id: RowGroupId,
        column: &ColumnReference,
    ) -> Result<Option<DocumentIndex>> {
        let key = storage_key(rg_id, &column.dotted_path);
        let Some(raw_offsets) = self.storage_offsets_kv.get(&key)? else {
            debug!(rg_id, column = %column.dotted_path, "no storage offsets, index absent");
            return Ok(None);
        };
        let offsets = OffsetRange::from_bytes(&raw_offsets)?;
        let Some(raw_aux) = self.aux_data_kv.get(&key)? else {
            debug!(rg_id, column = %column.dotted_path, "no aux data, index absent");
            return Ok(None);
        };
        let aux = AuxData::from_bytes(&raw_aux)?;

        let rg_info = Arc::new(
            self.batch_info
                .row_group(rg_id)
                .cloned()
                .context(InvalidArgumentSnafu {
                    reason: format!("row group {rg_id} is not part of the batch"),
                })?,
        );
        let column = Arc::new(column.clone());
        let storage = BitmapStorage::load(
            rg_info.clone(),
            column.clone(),
            self.file.clone(),
            self.io.clone(),
            offsets,
            aux.bitmap_counts.clone(),
            self.bitmap_offsets_kv.clone(),
            self.bitmap_cache_size,
            true,
        )
        .await?;

        macro_rules! typed_index {
            ($variant:ident) => {
                DocumentIndex::$variant(BitmapIndex::load(
                    rg_info,
                    column.clone(),
                    storage,
                    self.attr_values_kv.clone(),
                    aux,
                ))
            };
        }
        let index = match column.value_type {
            ValueType::Bool => typed_index!(Bool),
            ValueType::Int8 => typed_index!(Int8),
            ValueType::UInt8 => typed_index!(UInt8),
            ValueType::Int16 => typed_index!(Int16),
            ValueType::UInt16 => typed_index!(UInt16),
            ValueType::Int32 => typed_index!(Int32),
            ValueType::UInt32 => typed_index!(UInt32),
            ValueType::Int64 => typed_index!(Int64),
            ValueType::UInt64 => typed_index!(UInt64),
            ValueType::Float32 => typed_index!(Float32),
            ValueType::Float64 => typed_index!(Float64),
            ValueType::String => typed_index!(String),
        };
        Ok(Some(index))
    }
}
