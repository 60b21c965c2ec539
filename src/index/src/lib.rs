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

//! Per-column bitmap indexing for an analytic column store.
//!
//! For each (batch, row group, column) triple the engine builds a compact
//! on-disk index answering equality and range predicates over document
//! ids. Attribute values are mapped to dense ordinals where profitable,
//! decomposed over a mixed-radix basis, and stored as a family of
//! compressed bitmaps (equality, interval or range encoded) in one shared
//! append-only file, with offsets and auxiliary data kept in embedded
//! ordered KV stores.

use serde::{Deserialize, Serialize};

pub mod aux;
pub mod batch;
pub mod bitmap_index;
pub mod decompose;
pub mod error;
pub mod io;
pub mod keys;
pub mod kv;
pub mod model;
pub mod storage;
pub mod value;


pub use crate::batch::{
    BatchIndexBuilder, BatchIndexPaths, BatchIndexReader, CompareOp, DocumentIndex,
    IndexAccuracy, IndexResult, Predicate, UnaryOp,
};
pub use crate::bitmap_index::BitmapIndex;
pub use crate::error::{Error, Result};
pub use crate::model::{
    BatchInfo, ColumnReference, DocumentId, Encoding, IndexKind, RangeFlags, RowGroupInfo,
    ValueType,
};
pub use crate::value::{IndexValue, Value};

/// Tunables of the batch index engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of component bitmaps one storage keeps resident; the rest
    /// reload on demand by access frequency.
    pub bitmap_cache_size: usize,

    /// Depth of the I/O submission queue. Submissions beyond it fail with
    /// a retriable error.
    pub io_queue_depth: usize,

    /// Map size of each KV environment, an address-space reservation.
    pub kv_map_size: usize,
}

impl Default for IndexConfig {
    fn default() -> IndexConfig {
        IndexConfig {
            bitmap_cache_size: usize::MAX,
            io_queue_depth: 200,
            kv_map_size: 1 << 30,
        }
    }
}
