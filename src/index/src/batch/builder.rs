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

//! Parallel construction of every bitmap index of one batch.
//!
//! Index builds fan out as independent tasks; the save phase assigns each
//! finished storage a disjoint block-aligned range of the shared file,
//! runs the writes in parallel, and commits the storage offset map last.
//! That final commit is the durability point: a build that dies earlier
//! leaves nothing a reader would open.

use std::fs::File;
use std::sync::Arc;

use futures::future::try_join_all;
use snafu::{ensure, ResultExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::aux::AuxData;
use crate::batch::BatchIndexPaths;
use crate::bitmap_index::BitmapIndex;
use crate::decompose::{bitmap_counts, select_basis, ValueDecomposer};
use crate::error::{IoSnafu, JoinSnafu, Result, WriteSizeMismatchSnafu};
use crate::io::IoPool;
use crate::keys::{storage_key, OffsetRange};
use crate::kv::Dictionary;
use crate::model::{BatchInfo, ColumnReference, DocumentId, Encoding, IndexKind, RowGroupInfo};
use crate::storage::BitmapStorage;
use crate::value::{ordered_bytes, IndexValue};
use crate::IndexConfig;

/// Builds and persists the bitmap indexes of one batch.
pub struct BatchIndexBuilder {
    batch_info: Arc<BatchInfo>,
    file: Arc<File>,
    io: Arc<IoPool>,
    attr_values_kv: Arc<Dictionary>,
    aux_data_kv: Arc<Dictionary>,
    bitmap_offsets_kv: Arc<Dictionary>,
    storage_offsets_kv: Arc<Dictionary>,
    builds: Vec<JoinHandle<Result<BitmapStorage>>>,
    current_offset: u32,
}

impl BatchIndexBuilder {
    /// Opens the bitmaps file (truncating) and the four KV environments.
    pub fn new(
        batch_info: Arc<BatchInfo>,
        paths: &BatchIndexPaths,
        config: &IndexConfig,
    ) -> Result<BatchIndexBuilder> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&paths.bitmaps)
            .context(IoSnafu)?;
        Ok(BatchIndexBuilder {
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
            builds: Vec::new(),
            current_offset: 0,
        })
    }

    pub fn batch_info(&self) -> &Arc<BatchInfo> {
        &self.batch_info
    }

    /// Spawns an independent build of one (row group, column) index from a
    /// precomputed value vector. The result is collected by `save_all`.
    pub fn add_index<T: IndexValue>(
        &mut self,
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
        values: Vec<(DocumentId, T)>,
        encoding: Encoding,
        kind: IndexKind,
    ) {
        let file = self.file.clone();
        let io = self.io.clone();
        let attr_values_kv = self.attr_values_kv.clone();
        let aux_data_kv = self.aux_data_kv.clone();
        let bitmap_offsets_kv = self.bitmap_offsets_kv.clone();
        self.builds.push(tokio::spawn(async move {
            let aux = configure(&values, encoding, kind);
            let storage = BitmapStorage::create(
                rg_info.clone(),
                column.clone(),
                file,
                io,
                aux.bitmap_counts.clone(),
                bitmap_offsets_kv,
            );
            let index = BitmapIndex::create(
                rg_info,
                column,
                storage,
                attr_values_kv,
                &aux_data_kv,
                aux,
                &values,
            )
            .await?;
            Ok(index.into_storage())
        }));
    }

    /// Waits for every spawned build, appends the finished storages to the
    /// file at sequentially assigned offsets, and records the offset map.
    pub async fn save_all(&mut self) -> Result<()> {
        let builds = std::mem::take(&mut self.builds);
        let mut storages = Vec::with_capacity(builds.len());
        for build in builds {
            storages.push(build.await.context(JoinSnafu)??);
        }

        let start_offset = self.current_offset;
        let mut offset = start_offset;
        let mut offsets = Vec::with_capacity(storages.len());
        let mut expected_sizes = Vec::with_capacity(storages.len());
        let mut entries = Vec::with_capacity(storages.len());
        for storage in &storages {
            let size = storage.total_byte_size().await?;
            entries.push((
                storage_key(storage.rg_info().id, &storage.column().dotted_path),
                OffsetRange::new(offset, offset + size).to_bytes().to_vec(),
            ));
            offsets.push(offset);
            expected_sizes.push(size);
            offset += size;
        }

        // Ranges are disjoint, so the writes run in parallel on the pool.
        let results = try_join_all(
            storages
                .iter()
                .zip(&offsets)
                .map(|(storage, &offset)| storage.save(offset)),
        )
        .await?;
        for (result, &expected) in results.iter().zip(&expected_sizes) {
            ensure!(
                result.bytes_written == expected as u64,
                WriteSizeMismatchSnafu {
                    expected: expected as u64,
                    actual: result.bytes_written,
                }
            );
        }

        // The offset map commit makes the new storages visible to readers;
        // everything before it is scratch.
        self.storage_offsets_kv.put_many(entries)?;
        self.current_offset = offset;

        for storage in &storages {
            storage.reset_usage_frequencies();
        }
        debug!(
            batch_id = self.batch_info.id,
            indexes = storages.len(),
            bytes = offset - start_offset,
            "saved batch bitmap indexes"
        );
        Ok(())
    }
}

/// Decides mapping, bounds and basis for a value vector.
///
/// Non-integral types always map; integral types map only when the
/// distinct-value count stays within a tenth of the vector, otherwise the
/// index works directly on `value - min`.
pub(crate) fn configure<T: IndexValue>(
    values: &[(DocumentId, T)],
    encoding: Encoding,
    kind: IndexKind,
) -> AuxData {
    let mut distinct: Vec<Vec<u8>> = values
        .iter()
        .map(|(_, value)| ordered_bytes(value))
        .collect();
    distinct.sort_unstable();
    distinct.dedup();
    let cardinality = distinct.len() as u32;

    let use_value_mapping = !T::INTEGRAL || cardinality as usize <= values.len() / 10;
    let (min_mapped_value, max_mapped_value, basis) = if use_value_mapping {
        (
            0,
            cardinality as i64,
            select_basis(cardinality as u64, kind),
        )
    } else {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for (_, value) in values {
            let Some(raw) = value.to_i64() else { continue };
            min = min.min(raw);
            max = max.max(raw);
        }
        if values.is_empty() {
            (min, max) = (0, 0);
        }
        let span = (max - min) as u64 + 1;
        (min, max, select_basis(span, kind))
    };

    AuxData {
        bitmap_counts: bitmap_counts(&basis, encoding),
        decomposer: ValueDecomposer::new(basis),
        cardinality,
        encoding,
        use_value_mapping,
        min_mapped_value,
        max_mapped_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_integral_mapping_decision() {
        // 100 values, 10 distinct: mapping on.
        let dense: Vec<(DocumentId, u32)> = (0..100).map(|i| (i, i % 10)).collect();
        let aux = configure(&dense, Encoding::Interval, IndexKind::Bitsliced);
        assert!(aux.use_value_mapping);
        assert_eq!(aux.cardinality, 10);
        assert_eq!(aux.min_mapped_value, 0);
        assert_eq!(aux.max_mapped_value, 10);

        // 7 values, 4 distinct: mapping off, bounds observed.
        let sparse: Vec<(DocumentId, u32)> =
            vec![(15, 4), (16, 5), (17, 4), (19, 5), (25, 7), (30, 4), (40, 8)];
        let aux = configure(&sparse, Encoding::Interval, IndexKind::Bitsliced);
        assert!(!aux.use_value_mapping);
        assert_eq!(aux.cardinality, 4);
        assert_eq!(aux.min_mapped_value, 4);
        assert_eq!(aux.max_mapped_value, 8);
        // Span of 5 needs three binary components.
        assert_eq!(aux.decomposer.basis(), &[2, 2, 2]);
    }

    #[test]
    fn test_configure_strings_always_map() {
        let values: Vec<(DocumentId, String)> = (0..4)
            .map(|i| (i, format!("value-{i}")))
            .collect();
        let aux = configure(&values, Encoding::Range, IndexKind::Bitmap);
        assert!(aux.use_value_mapping);
        assert_eq!(aux.cardinality, 4);
        assert_eq!(aux.decomposer.basis(), &[2, 2]);
    }

    #[test]
    fn test_configure_empty_values() {
        let values: Vec<(DocumentId, u64)> = Vec::new();
        let aux = configure(&values, Encoding::Interval, IndexKind::Bitsliced);
        assert_eq!(aux.cardinality, 0);
        assert!(aux.use_value_mapping);
        assert_eq!(aux.decomposer.basis(), &[1]);
    }

    #[test]
    fn test_paths_layout() {
        let paths = BatchIndexPaths::under(std::path::Path::new("/data/batch-7"));
        assert_eq!(paths.bitmaps, std::path::Path::new("/data/batch-7/bitmaps"));
        assert!(paths
            .attribute_mapping
            .ends_with("lmdb_attribute_mapping"));
    }
}
