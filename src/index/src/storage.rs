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

//! Bitmap storage of one (row group, column) index.
//!
//! A storage owns the component bitmaps plus the all-values bitmap, loads
//! them lazily from the shared file by their persisted offsets, and writes
//! them back as one contiguous block. Frequently used bitmaps stay resident
//! in an access-frequency cache; the all-values bitmap is always resident
//! once loaded.

use std::fs::File;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use roaring::RoaringBitmap;
use snafu::{ensure, OptionExt, ResultExt};

use crate::error::{
    DeserializeBitmapSnafu, MissingBitmapOffsetsSnafu, Result, SerializeBitmapSnafu,
    WriteSizeMismatchSnafu,
};
use crate::io::{round_to_disk_block, IoPool, WriteResult};
use crate::keys::{bitmap_key, OffsetRange};
use crate::kv::Dictionary;
use crate::model::{ColumnReference, RowGroupInfo};

/// In-memory bitmap slots plus the access statistics driving eviction.
#[derive(Debug)]
struct CacheState {
    bitmaps: Vec<Vec<Option<Arc<RoaringBitmap>>>>,
    all_values: Option<Arc<RoaringBitmap>>,
    frequencies: Vec<Vec<u32>>,
    frequency_threshold: u32,
}

impl CacheState {
    fn empty(bitmap_counts: &[u32]) -> CacheState {
        CacheState {
            bitmaps: bitmap_counts
                .iter()
                .map(|&n| vec![None; n as usize])
                .collect(),
            all_values: None,
            frequencies: bitmap_counts.iter().map(|&n| vec![0; n as usize]).collect(),
            frequency_threshold: 0,
        }
    }

    /// Counts an access, refreshing the threshold when this bitmap crosses
    /// it.
    fn bump(&mut self, component: usize, i: usize, cache_size: usize) {
        if self.frequencies[component][i] == self.frequency_threshold {
            self.recompute_threshold(cache_size);
        }
        self.frequencies[component][i] += 1;
    }

    /// The threshold is the cache_size-th largest access count, so exactly
    /// the hottest `cache_size` bitmaps stay resident (modulo ties).
    fn recompute_threshold(&mut self, cache_size: usize) {
        let mut counts: Vec<u32> = self.frequencies.iter().flatten().copied().collect();
        if cache_size >= counts.len() {
            self.frequency_threshold = 0;
        } else if cache_size == 0 {
            self.frequency_threshold = u32::MAX;
        } else {
            let pivot = counts.len() - cache_size;
            let (_, nth, _) = counts.select_nth_unstable(pivot);
            self.frequency_threshold = *nth;
        }
    }

    fn maybe_evict(&mut self, component: usize, i: usize) {
        if self.frequencies[component][i] < self.frequency_threshold {
            self.bitmaps[component][i] = None;
        }
    }

    fn reset_frequencies(&mut self, cache_size: usize) {
        for row in &mut self.frequencies {
            row.fill(0);
        }
        self.recompute_threshold(cache_size);
    }
}

/// The bitmaps of one (row group, column) index and their file locations.
#[derive(Debug)]
pub struct BitmapStorage {
    rg_info: Arc<RowGroupInfo>,
    column: Arc<ColumnReference>,
    file: Arc<File>,
    io: Arc<IoPool>,
    bitmap_offsets_kv: Arc<Dictionary>,
    bitmap_counts: Vec<u32>,
    cache_size: usize,
    /// Per-bitmap file ranges; empty until the storage has been persisted
    /// and reloaded.
    bitmap_offsets: Vec<Vec<OffsetRange>>,
    all_values_offsets: Option<OffsetRange>,
    state: Mutex<CacheState>,
}

impl BitmapStorage {
    /// Creates an empty storage for index construction. Every bitmap is
    /// resident and the cache is unbounded.
    pub fn create(
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
        file: Arc<File>,
        io: Arc<IoPool>,
        bitmap_counts: Vec<u32>,
        bitmap_offsets_kv: Arc<Dictionary>,
    ) -> BitmapStorage {
        let mut state = CacheState::empty(&bitmap_counts);
        for row in &mut state.bitmaps {
            for slot in row.iter_mut() {
                *slot = Some(Arc::new(RoaringBitmap::new()));
            }
        }
        state.all_values = Some(Arc::new(RoaringBitmap::new()));
        BitmapStorage {
            rg_info,
            column,
            file,
            io,
            bitmap_offsets_kv,
            bitmap_counts,
            cache_size: usize::MAX,
            bitmap_offsets: Vec::new(),
            all_values_offsets: None,
            state: Mutex::new(state),
        }
    }

    /// Opens a persisted storage occupying `offsets` in the shared file.
    /// Per-bitmap offsets are resolved from the KV store; with `eager` the
    /// whole block is read at once and every bitmap materialized.
    #[allow(clippy::too_many_arguments)]
    pub async fn load(
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
        file: Arc<File>,
        io: Arc<IoPool>,
        offsets: OffsetRange,
        bitmap_counts: Vec<u32>,
        bitmap_offsets_kv: Arc<Dictionary>,
        cache_size: usize,
        eager: bool,
    ) -> Result<BitmapStorage> {
        let state = CacheState::empty(&bitmap_counts);
        let mut storage = BitmapStorage {
            rg_info,
            column,
            file,
            io,
            bitmap_offsets_kv,
            bitmap_counts,
            cache_size,
            bitmap_offsets: Vec::new(),
            all_values_offsets: None,
            state: Mutex::new(state),
        };
        storage.resolve_offsets()?;

        if eager {
            let blob = storage
                .io
                .submit_read(
                    storage.file.clone(),
                    offsets.start as u64,
                    offsets.len() as usize,
                )
                .await?;
            let slice_of = |range: &OffsetRange| {
                let start = (range.start - offsets.start) as usize;
                let end = (range.end - offsets.start) as usize;
                blob.slice(start..end)
            };

            let mut state = storage.state.lock().unwrap();
            for (component, ranges) in storage.bitmap_offsets.iter().enumerate() {
                for (i, range) in ranges.iter().enumerate() {
                    let bytes = slice_of(range);
                    let bitmap = RoaringBitmap::deserialize_from(bytes.as_ref())
                        .context(DeserializeBitmapSnafu)?;
                    state.bitmaps[component][i] = Some(Arc::new(bitmap));
                }
            }
            let all_values_range =
                storage
                    .all_values_offsets
                    .context(MissingBitmapOffsetsSnafu {
                        rg_id: storage.rg_info.id,
                        column: storage.column.dotted_path.clone(),
                        number: crate::keys::ALL_VALUES_BITMAP_NUMBER,
                    })?;
            let bitmap = RoaringBitmap::deserialize_from(slice_of(&all_values_range).as_ref())
                .context(DeserializeBitmapSnafu)?;
            state.all_values = Some(Arc::new(bitmap));
            drop(state);
        }
        Ok(storage)
    }

    /// Reads the consecutive KV block `(rg, col, 0..=N)` into the offset
    /// tables, validating that every yielded key belongs to this storage.
    fn resolve_offsets(&mut self) -> Result<()> {
        let rg_id = self.rg_info.id;
        let path = &self.column.dotted_path;
        let total = self.total_bitmaps();

        let start = bitmap_key(rg_id, path, 0);
        let block = self.bitmap_offsets_kv.read_block(&start, total)?;

        let mut entries = block.iter();
        let mut next = |number: u16| -> Result<OffsetRange> {
            let (key, value) = entries.next().context(MissingBitmapOffsetsSnafu {
                rg_id,
                column: path.clone(),
                number,
            })?;
            ensure!(
                *key == bitmap_key(rg_id, path, number),
                MissingBitmapOffsetsSnafu {
                    rg_id,
                    column: path.clone(),
                    number,
                }
            );
            OffsetRange::from_bytes(value)
        };

        let mut number = 0u16;
        self.all_values_offsets = Some(next(number)?);
        let mut bitmap_offsets = Vec::with_capacity(self.bitmap_counts.len());
        for &count in &self.bitmap_counts {
            let mut ranges = Vec::with_capacity(count as usize);
            for _ in 0..count {
                number += 1;
                ranges.push(next(number)?);
            }
            bitmap_offsets.push(ranges);
        }
        self.bitmap_offsets = bitmap_offsets;
        Ok(())
    }

    pub fn rg_info(&self) -> &Arc<RowGroupInfo> {
        &self.rg_info
    }

    pub fn column(&self) -> &Arc<ColumnReference> {
        &self.column
    }

    pub fn bitmap_counts(&self) -> &[u32] {
        &self.bitmap_counts
    }

    /// Number of persisted bitmaps including the all-values bitmap.
    fn total_bitmaps(&self) -> usize {
        1 + self.bitmap_counts.iter().map(|&n| n as usize).sum::<usize>()
    }

    /// Returns a shared view of one component bitmap, loading it from the
    /// file if it is not resident. `pin` keeps it resident regardless of
    /// the eviction policy.
    pub async fn load_const_bitmap(
        &self,
        component: usize,
        i: usize,
        pin: bool,
    ) -> Result<Arc<RoaringBitmap>> {
        {
            let mut state = self.state.lock().unwrap();
            state.bump(component, i, self.cache_size);
            if let Some(bitmap) = &state.bitmaps[component][i] {
                let bitmap = bitmap.clone();
                if !pin {
                    state.maybe_evict(component, i);
                }
                return Ok(bitmap);
            }
        }

        let range = self.component_range(component, i)?;
        let bytes = self
            .io
            .submit_read(self.file.clone(), range.start as u64, range.len() as usize)
            .await?;
        let bitmap = Arc::new(
            RoaringBitmap::deserialize_from(bytes.as_ref()).context(DeserializeBitmapSnafu)?,
        );

        let mut state = self.state.lock().unwrap();
        state.bitmaps[component][i] = Some(bitmap.clone());
        if !pin {
            state.maybe_evict(component, i);
        }
        Ok(bitmap)
    }

    /// Returns an owned copy of one component bitmap.
    pub async fn load_bitmap(&self, component: usize, i: usize) -> Result<RoaringBitmap> {
        let bitmap = self.load_const_bitmap(component, i, false).await?;
        Ok((*bitmap).clone())
    }

    /// Shared view of the all-values bitmap. It is queried on almost every
    /// operation, so it stays resident once loaded.
    pub async fn load_all_values_bitmap_const(&self) -> Result<Arc<RoaringBitmap>> {
        {
            let state = self.state.lock().unwrap();
            if let Some(bitmap) = &state.all_values {
                return Ok(bitmap.clone());
            }
        }

        let range = self
            .all_values_offsets
            .context(MissingBitmapOffsetsSnafu {
                rg_id: self.rg_info.id,
                column: self.column.dotted_path.clone(),
                number: crate::keys::ALL_VALUES_BITMAP_NUMBER,
            })?;
        let bytes = self
            .io
            .submit_read(self.file.clone(), range.start as u64, range.len() as usize)
            .await?;
        let bitmap = Arc::new(
            RoaringBitmap::deserialize_from(bytes.as_ref()).context(DeserializeBitmapSnafu)?,
        );
        let mut state = self.state.lock().unwrap();
        state.all_values = Some(bitmap.clone());
        Ok(bitmap)
    }

    /// Owned copy of the all-values bitmap.
    pub async fn load_all_values_bitmap(&self) -> Result<RoaringBitmap> {
        let bitmap = self.load_all_values_bitmap_const().await?;
        Ok((*bitmap).clone())
    }

    /// Adds document ids to one component bitmap, loading it first if
    /// needed.
    pub async fn add_to_bitmap(&self, component: usize, i: usize, doc: u32) -> Result<()> {
        let loaded = self.load_const_bitmap(component, i, true).await?;
        let mut state = self.state.lock().unwrap();
        let slot = state.bitmaps[component][i].get_or_insert(loaded);
        Arc::make_mut(slot).insert(doc);
        state.maybe_evict(component, i);
        Ok(())
    }

    pub async fn add_many_to_bitmap(
        &self,
        component: usize,
        i: usize,
        docs: &[u32],
    ) -> Result<()> {
        let loaded = self.load_const_bitmap(component, i, true).await?;
        let mut state = self.state.lock().unwrap();
        let slot = state.bitmaps[component][i].get_or_insert(loaded);
        Arc::make_mut(slot).extend(docs.iter().copied());
        state.maybe_evict(component, i);
        Ok(())
    }

    pub async fn add_to_all_values_bitmap(&self, doc: u32) -> Result<()> {
        let loaded = self.load_all_values_bitmap_const().await?;
        let mut state = self.state.lock().unwrap();
        let slot = state.all_values.get_or_insert(loaded);
        Arc::make_mut(slot).insert(doc);
        Ok(())
    }

    pub async fn add_many_to_all_values_bitmap(&self, docs: &[u32]) -> Result<()> {
        let loaded = self.load_all_values_bitmap_const().await?;
        let mut state = self.state.lock().unwrap();
        let slot = state.all_values.get_or_insert(loaded);
        Arc::make_mut(slot).extend(docs.iter().copied());
        Ok(())
    }

    /// Zeroes the access statistics. Called after construction so the
    /// build-time access pattern does not skew query-time caching.
    pub fn reset_usage_frequencies(&self) {
        let mut state = self.state.lock().unwrap();
        state.reset_frequencies(self.cache_size);
    }

    /// Total bytes needed to persist every bitmap, rounded up to whole
    /// disk blocks.
    pub async fn total_byte_size(&self) -> Result<u32> {
        let mut total = self.load_all_values_bitmap_const().await?.serialized_size() as u32;
        for (component, &count) in self.bitmap_counts.iter().enumerate() {
            for i in 0..count as usize {
                total += self
                    .load_const_bitmap(component, i, false)
                    .await?
                    .serialized_size() as u32;
            }
        }
        Ok(round_to_disk_block(total))
    }

    /// Serializes every bitmap into one block-aligned buffer starting at
    /// file position `offset`, records each sub-range in the bitmap-offsets
    /// table with a single bulk put, and submits one write for the whole
    /// block.
    pub async fn save(&self, offset: u32) -> Result<WriteResult> {
        let mut bitmaps = Vec::with_capacity(self.total_bitmaps());
        bitmaps.push(self.load_all_values_bitmap_const().await?);
        for (component, &count) in self.bitmap_counts.iter().enumerate() {
            for i in 0..count as usize {
                bitmaps.push(self.load_const_bitmap(component, i, false).await?);
            }
        }

        let sizes: Vec<u32> = bitmaps.iter().map(|b| b.serialized_size() as u32).collect();
        let total = round_to_disk_block(sizes.iter().sum());
        let mut buffer = vec![0u8; total as usize];

        let rg_id = self.rg_info.id;
        let path = &self.column.dotted_path;
        let mut entries = Vec::with_capacity(bitmaps.len());
        let mut position = 0u32;
        for (number, (bitmap, &size)) in bitmaps.iter().zip(&sizes).enumerate() {
            let end = position + size;
            let mut cursor = Cursor::new(&mut buffer[position as usize..end as usize]);
            bitmap
                .serialize_into(&mut cursor)
                .context(SerializeBitmapSnafu)?;
            ensure!(
                cursor.position() == size as u64,
                WriteSizeMismatchSnafu {
                    expected: size as u64,
                    actual: cursor.position(),
                }
            );
            entries.push((
                bitmap_key(rg_id, path, number as u16),
                OffsetRange::new(offset + position, offset + end).to_bytes().to_vec(),
            ));
            position = end;
        }
        self.bitmap_offsets_kv.put_many(entries)?;

        self.io
            .submit_write(self.file.clone(), offset as u64, buffer)
            .await
    }

    fn component_range(&self, component: usize, i: usize) -> Result<OffsetRange> {
        self.bitmap_offsets
            .get(component)
            .and_then(|ranges| ranges.get(i))
            .copied()
            .context(MissingBitmapOffsetsSnafu {
                rg_id: self.rg_info.id,
                column: self.column.dotted_path.clone(),
                number: (1 + self
                    .bitmap_counts
                    .iter()
                    .take(component)
                    .map(|&n| n as usize)
                    .sum::<usize>()
                    + i) as u16,
            })
    }

    #[cfg(test)]
    fn resident(&self, component: usize, i: usize) -> bool {
        self.state.lock().unwrap().bitmaps[component][i].is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValueType;

    const MAP_SIZE: usize = 64 << 20;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: Arc<File>,
        io: Arc<IoPool>,
        offsets_kv: Arc<Dictionary>,
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("bitmaps"))
            .unwrap();
        let offsets_kv =
            Arc::new(Dictionary::open(&dir.path().join("offsets"), MAP_SIZE).unwrap());
        Fixture {
            _dir: dir,
            file: Arc::new(file),
            io: Arc::new(IoPool::new(16)),
            offsets_kv,
            rg_info: Arc::new(RowGroupInfo::new(3, 1000)),
            column: Arc::new(ColumnReference::new("a.b.c", ValueType::UInt32)),
        }
    }

    fn create_storage(fx: &Fixture, counts: Vec<u32>) -> BitmapStorage {
        BitmapStorage::create(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            counts,
            fx.offsets_kv.clone(),
        )
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let fx = fixture();
        let storage = create_storage(&fx, vec![2, 3]);

        storage.add_many_to_bitmap(0, 0, &[1, 5, 9]).await.unwrap();
        storage.add_many_to_bitmap(1, 2, &[5, 700]).await.unwrap();
        storage.add_to_bitmap(1, 0, 42).await.unwrap();
        storage
            .add_many_to_all_values_bitmap(&[1, 5, 9, 42, 700])
            .await
            .unwrap();

        let size = storage.total_byte_size().await.unwrap();
        assert_eq!(size % 4096, 0);
        let written = storage.save(4096).await.unwrap();
        assert_eq!(written.bytes_written, size as u64);

        let loaded = BitmapStorage::load(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            OffsetRange::new(4096, 4096 + size),
            vec![2, 3],
            fx.offsets_kv.clone(),
            usize::MAX,
            true,
        )
        .await
        .unwrap();

        let bitmap = loaded.load_bitmap(0, 0).await.unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![1, 5, 9]);
        let bitmap = loaded.load_bitmap(1, 2).await.unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![5, 700]);
        let bitmap = loaded.load_bitmap(1, 1).await.unwrap();
        assert!(bitmap.is_empty());
        let all = loaded.load_all_values_bitmap().await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_lazy_load_serves_same_data() {
        let fx = fixture();
        let storage = create_storage(&fx, vec![4]);
        for i in 0..4u32 {
            storage
                .add_many_to_bitmap(0, i as usize, &[i * 10, i * 10 + 1])
                .await
                .unwrap();
            storage
                .add_many_to_all_values_bitmap(&[i * 10, i * 10 + 1])
                .await
                .unwrap();
        }
        let size = storage.total_byte_size().await.unwrap();
        storage.save(0).await.unwrap();

        // A cache of one bitmap: loads succeed and evictions stay invisible.
        let lazy = BitmapStorage::load(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            OffsetRange::new(0, size),
            vec![4],
            fx.offsets_kv.clone(),
            1,
            false,
        )
        .await
        .unwrap();

        for round in 0..3 {
            for i in 0..4usize {
                let bitmap = lazy.load_bitmap(0, i).await.unwrap();
                assert_eq!(
                    bitmap.iter().collect::<Vec<_>>(),
                    vec![i as u32 * 10, i as u32 * 10 + 1],
                    "round {round}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_eviction_keeps_hot_bitmap() {
        let fx = fixture();
        let storage = create_storage(&fx, vec![3]);
        for i in 0..3usize {
            storage.add_to_bitmap(0, i, i as u32).await.unwrap();
        }
        storage.add_many_to_all_values_bitmap(&[0, 1, 2]).await.unwrap();
        let size = storage.total_byte_size().await.unwrap();
        storage.save(0).await.unwrap();

        let lazy = BitmapStorage::load(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            OffsetRange::new(0, size),
            vec![3],
            fx.offsets_kv.clone(),
            1,
            false,
        )
        .await
        .unwrap();

        // Heat up bitmap 0 far beyond the others.
        for _ in 0..16 {
            lazy.load_const_bitmap(0, 0, false).await.unwrap();
        }
        for _ in 0..2 {
            lazy.load_const_bitmap(0, 1, false).await.unwrap();
            lazy.load_const_bitmap(0, 2, false).await.unwrap();
        }
        assert!(lazy.resident(0, 0));
        assert!(!lazy.resident(0, 1));
        assert!(!lazy.resident(0, 2));
    }

    #[tokio::test]
    async fn test_missing_offsets_detected() {
        let fx = fixture();
        let result = BitmapStorage::load(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            OffsetRange::new(0, 4096),
            vec![2],
            fx.offsets_kv.clone(),
            usize::MAX,
            false,
        )
        .await;
        assert!(matches!(
            result.unwrap_err(),
            crate::error::Error::MissingBitmapOffsets { number: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_reset_usage_frequencies() {
        let fx = fixture();
        let storage = create_storage(&fx, vec![2]);
        storage.add_to_bitmap(0, 0, 7).await.unwrap();
        storage.add_to_all_values_bitmap(7).await.unwrap();
        storage.reset_usage_frequencies();
        let state = storage.state.lock().unwrap();
        assert!(state.frequencies.iter().flatten().all(|&f| f == 0));
    }
}
