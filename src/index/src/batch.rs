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

//! Batch-level index construction and reading.

pub mod builder;
pub mod reader;

use std::path::{Path, PathBuf};

pub use builder::BatchIndexBuilder;
pub use reader::{
    BatchIndexReader, CompareOp, DocumentIndex, IndexAccuracy, IndexResult, Predicate, UnaryOp,
};

/// On-disk locations of a batch index: the shared bitmaps file plus the
/// four KV environments.
#[derive(Debug, Clone)]
pub struct BatchIndexPaths {
    pub bitmaps: PathBuf,
    pub attribute_mapping: PathBuf,
    pub aux_data: PathBuf,
    pub bitmap_offsets: PathBuf,
    pub storage_offsets: PathBuf,
}

impl BatchIndexPaths {
    /// The conventional layout under one batch directory.
    pub fn under(dir: &Path) -> BatchIndexPaths {
        BatchIndexPaths {
            bitmaps: dir.join("bitmaps"),
            attribute_mapping: dir.join("lmdb_attribute_mapping"),
            aux_data: dir.join("lmdb_bitmap_aux_data"),
            bitmap_offsets: dir.join("lmdb_bitmap_offsets"),
            storage_offsets: dir.join("lmdb_bitmap_storage_offsets"),
        }
    }
}
