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

//! The per-(row group, column) bitmap index.
//!
//! Attribute values are optionally mapped to dense ordinals, decomposed
//! over a mixed-radix basis, and spread across per-component bitmaps by the
//! chosen encoding. Queries recover result sets with a small number of
//! bitmap combinations; the interval and range decoders follow the
//! SIGMOD'99 encoding algebra of Chan and Ioannidis.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::{try_join, FutureExt};
use roaring::RoaringBitmap;
use snafu::{ensure, OptionExt};

use crate::aux::AuxData;
use crate::error::{
    DecodeOrdinalSnafu, IndexNotFoundSnafu, InvalidArgumentSnafu, Result,
    UnsupportedEncodingSnafu, ValueOutOfRangeSnafu,
};
use crate::keys::{attribute_key, column_prefix, storage_key};
use crate::kv::Dictionary;
use crate::model::{ColumnReference, DocumentId, Encoding, RangeFlags, RowGroupInfo};
use crate::storage::BitmapStorage;
use crate::value::{ordered_bytes, IndexValue};

/// Bitmap index over one column of one row group, typed by the attribute
/// type. Mutable only between creation and the first save; queries are
/// fully concurrent.
pub struct BitmapIndex<T: IndexValue> {
    rg_info: Arc<RowGroupInfo>,
    column: Arc<ColumnReference>,
    storage: BitmapStorage,
    attr_values_kv: Arc<Dictionary>,
    aux: AuxData,
    _type: PhantomData<T>,
}

impl<T: IndexValue> BitmapIndex<T> {
    /// Builds the index from a precomputed value vector: assigns ordinals
    /// (when mapping is on), fills the bitmaps, and persists the auxiliary
    /// data. The configured `aux` must describe these values.
    pub async fn create(
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
        storage: BitmapStorage,
        attr_values_kv: Arc<Dictionary>,
        aux_data_kv: &Dictionary,
        aux: AuxData,
        values: &[(DocumentId, T)],
    ) -> Result<BitmapIndex<T>> {
        let mut index = BitmapIndex {
            rg_info,
            column,
            storage,
            attr_values_kv,
            aux,
            _type: PhantomData,
        };
        index.insert_batch(values).await?;
        aux_data_kv.put_many([(
            storage_key(index.rg_info.id, &index.column.dotted_path),
            index.aux.to_bytes(),
        )])?;
        Ok(index)
    }

    /// Assembles an index over an already persisted storage.
    pub fn load(
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
        storage: BitmapStorage,
        attr_values_kv: Arc<Dictionary>,
        aux: AuxData,
    ) -> BitmapIndex<T> {
        BitmapIndex {
            rg_info,
            column,
            storage,
            attr_values_kv,
            aux,
            _type: PhantomData,
        }
    }

    /// Loads the auxiliary data persisted for a (row group, column), or
    /// `None` when the index was never created.
    pub fn fetch_aux_data(
        rg_id: u32,
        column_path: &str,
        aux_data_kv: &Dictionary,
    ) -> Result<Option<AuxData>> {
        aux_data_kv
            .get(&storage_key(rg_id, column_path))?
            .map(|bytes| AuxData::from_bytes(&bytes))
            .transpose()
    }

    /// Loads the auxiliary data, failing when it is absent.
    pub fn require_aux_data(
        rg_id: u32,
        column_path: &str,
        aux_data_kv: &Dictionary,
    ) -> Result<AuxData> {
        Self::fetch_aux_data(rg_id, column_path, aux_data_kv)?.context(IndexNotFoundSnafu {
            rg_id,
            column: column_path.to_string(),
        })
    }

    pub fn storage(&self) -> &BitmapStorage {
        &self.storage
    }

    pub fn into_storage(self) -> BitmapStorage {
        self.storage
    }

    pub fn aux_data(&self) -> &AuxData {
        &self.aux
    }

    pub fn reset_usage_frequencies(&self) {
        self.storage.reset_usage_frequencies();
    }

    /// Inserts one more pair. The value must not extend the set of values
    /// the index was configured for.
    pub async fn insert(&mut self, doc: DocumentId, value: &T) -> Result<()> {
        let ordinal = self
            .ordinal_of(value)?
            .context(InvalidArgumentSnafu {
                reason: "value missing from the attribute mapping",
            })?;
        ensure!(
            ordinal >= 0,
            InvalidArgumentSnafu {
                reason: "value below the indexed range",
            }
        );
        self.insert_mapped_batch(&[(doc, ordinal as u64)]).await
    }

    async fn insert_batch(&mut self, values: &[(DocumentId, T)]) -> Result<()> {
        let mapped: Vec<(DocumentId, u64)> = if self.aux.use_value_mapping {
            let mapping = self.insert_value_mapping(values)?;
            values
                .iter()
                .map(|(doc, value)| {
                    let ordinal = mapping
                        .get(&ordered_bytes(value))
                        .context(InvalidArgumentSnafu {
                            reason: "value missing from the attribute mapping",
                        })?;
                    Ok((*doc, *ordinal as u64))
                })
                .collect::<Result<_>>()?
        } else {
            values
                .iter()
                .map(|(doc, value)| {
                    let raw = value.to_i64().context(InvalidArgumentSnafu {
                        reason: "attribute type requires value mapping",
                    })?;
                    Ok((*doc, (raw - self.aux.min_mapped_value) as u64))
                })
                .collect::<Result<_>>()?
        };
        self.insert_mapped_batch(&mapped).await
    }

    /// Sorts the distinct values, assigns ordinals by that order, and bulk
    /// inserts the mapping. Ordinal order therefore matches the byte order
    /// of the keys, which range cursors rely on.
    fn insert_value_mapping(&self, values: &[(DocumentId, T)]) -> Result<HashMap<Vec<u8>, u32>> {
        let mut distinct: Vec<Vec<u8>> = values
            .iter()
            .map(|(_, value)| ordered_bytes(value))
            .collect();
        distinct.sort_unstable();
        distinct.dedup();

        let prefix = column_prefix(self.rg_info.id, &self.column.dotted_path);
        let mut mapping = HashMap::with_capacity(distinct.len());
        let mut entries = Vec::with_capacity(distinct.len());
        for (ordinal, encoded) in distinct.into_iter().enumerate() {
            let ordinal = ordinal as u32;
            let mut key = prefix.clone();
            key.extend_from_slice(&encoded);
            entries.push((key, ordinal.to_le_bytes().to_vec()));
            mapping.insert(encoded, ordinal);
        }
        self.attr_values_kv.put_many(entries)?;
        Ok(mapping)
    }

    /// Stages document ids per target bitmap, then applies them in bulk.
    async fn insert_mapped_batch(&mut self, mapped: &[(DocumentId, u64)]) -> Result<()> {
        let counts = &self.aux.bitmap_counts;
        let basis = self.aux.decomposer.basis().to_vec();
        let half: Vec<u32> = basis.iter().map(|&b| (b / 2).saturating_sub(1)).collect();

        let mut staged: Vec<Vec<Vec<DocumentId>>> = counts
            .iter()
            .map(|&n| vec![Vec::new(); n as usize])
            .collect();
        let mut all_values = Vec::with_capacity(mapped.len());

        for &(doc, value) in mapped {
            let digits = self
                .aux
                .decomposer
                .decompose(value)
                .context(ValueOutOfRangeSnafu { value })?;
            all_values.push(doc);
            match self.aux.encoding {
                Encoding::Equality => {
                    for (component, &digit) in digits.iter().enumerate() {
                        staged[component][digit as usize].push(doc);
                    }
                }
                Encoding::Interval => {
                    for (component, &digit) in digits.iter().enumerate() {
                        let start = digit.saturating_sub(half[component]);
                        let end = digit.min(counts[component] - 1);
                        for slot in start..=end {
                            staged[component][slot as usize].push(doc);
                        }
                    }
                }
                Encoding::Range => {
                    // Bitmap j covers all digits <= j; the top digit is
                    // implicit in the all-values bitmap.
                    for (component, &digit) in digits.iter().enumerate() {
                        for slot in digit..basis[component].saturating_sub(1) {
                            staged[component][slot as usize].push(doc);
                        }
                    }
                }
            }
        }

        self.storage.add_many_to_all_values_bitmap(&all_values).await?;
        for (component, slots) in staged.iter().enumerate() {
            for (i, docs) in slots.iter().enumerate() {
                self.storage.add_many_to_bitmap(component, i, docs).await?;
            }
        }
        Ok(())
    }

    /// Documents whose value equals `value`. Unknown values yield the
    /// empty set.
    pub async fn lookup(&self, value: &T) -> Result<RoaringBitmap> {
        match self.ordinal_of(value)? {
            Some(ordinal) => self.lookup_mapped(ordinal).await,
            None => Ok(RoaringBitmap::new()),
        }
    }

    /// Documents whose value differs from `value` (nulls excluded).
    pub async fn not_equals(&self, value: &T) -> Result<RoaringBitmap> {
        let (matched, mut all) = try_join!(
            self.lookup(value),
            self.storage.load_all_values_bitmap()
        )?;
        all -= matched;
        Ok(all)
    }

    /// Every document with a non-null value.
    pub async fn get_not_null(&self) -> Result<RoaringBitmap> {
        self.storage.load_all_values_bitmap().await
    }

    /// Documents with `min <= value <= max`, endpoint inclusion governed by
    /// `flags`.
    pub async fn range_search(
        &self,
        min: &T,
        max: &T,
        flags: RangeFlags,
    ) -> Result<RoaringBitmap> {
        ensure!(
            ordered_bytes(min) <= ordered_bytes(max),
            InvalidArgumentSnafu {
                reason: "range lower bound exceeds upper bound",
            }
        );
        let v1 = self.min_ordinal(min, flags)?;
        if self.aux.use_value_mapping && v1 == self.aux.cardinality as i64 {
            // Every indexed value is below the lower bound.
            return Ok(RoaringBitmap::new());
        }
        let v2 = self.max_ordinal(max, flags)?;
        if self.aux.use_value_mapping && v2 == -1 {
            // Every indexed value is above the upper bound.
            return Ok(RoaringBitmap::new());
        }

        if v1 > v2 {
            return Ok(RoaringBitmap::new());
        }
        if v1 == v2 {
            return self.lookup_mapped(v1).await;
        }
        ensure!(
            self.aux.encoding != Encoding::Equality,
            UnsupportedEncodingSnafu {
                encoding: self.aux.encoding,
                operation: "range_search",
            }
        );
        self.range_search_internal(v1, v2).await
    }

    /// Documents with value below `max` (or equal, per `flags`).
    pub async fn lesser(&self, max: &T, flags: RangeFlags) -> Result<RoaringBitmap> {
        let v2 = self.max_ordinal(max, flags)?;
        if self.aux.use_value_mapping && v2 == -1 {
            return Ok(RoaringBitmap::new());
        }
        ensure!(
            self.aux.encoding != Encoding::Equality,
            UnsupportedEncodingSnafu {
                encoding: self.aux.encoding,
                operation: "lesser",
            }
        );
        self.less_or_equal(v2).await
    }

    /// Documents with value above `min` (or equal, per `flags`).
    pub async fn greater(&self, min: &T, flags: RangeFlags) -> Result<RoaringBitmap> {
        ensure!(
            self.aux.encoding != Encoding::Equality,
            UnsupportedEncodingSnafu {
                encoding: self.aux.encoding,
                operation: "greater",
            }
        );
        let v1 = self.min_ordinal(min, flags)?;
        if self.aux.use_value_mapping && v1 == self.aux.cardinality as i64 {
            return Ok(RoaringBitmap::new());
        }
        let below = if v1 == 0 {
            RoaringBitmap::new()
        } else {
            self.less_or_equal(v1 - 1).await?
        };
        let mut all = self.storage.load_all_values_bitmap().await?;
        all -= below;
        Ok(all)
    }

    /// Maps an attribute value to its ordinal: an attribute-table lookup
    /// when mapping is on, `value - min` otherwise. `None` means the value
    /// was never indexed. The unmapped result may lie outside
    /// `[0, cardinality)`; bound checks happen at the query layer.
    fn ordinal_of(&self, value: &T) -> Result<Option<i64>> {
        if !self.aux.use_value_mapping {
            let raw = value.to_i64().context(InvalidArgumentSnafu {
                reason: "attribute type requires value mapping",
            })?;
            return Ok(Some(raw.saturating_sub(self.aux.min_mapped_value)));
        }
        let key = attribute_key(self.rg_info.id, &self.column.dotted_path, value);
        self.attr_values_kv
            .get(&key)?
            .map(|payload| decode_ordinal(&payload).map(|ordinal| ordinal as i64))
            .transpose()
    }

    /// Lower bound of a range in ordinal space. On the mapped path this
    /// walks the attribute-table cursor confined to the column block and
    /// returns `cardinality` when every value is below the bound.
    fn min_ordinal(&self, min: &T, flags: RangeFlags) -> Result<i64> {
        if !self.aux.use_value_mapping {
            let mut bound = min.to_i64().context(InvalidArgumentSnafu {
                reason: "attribute type requires value mapping",
            })?;
            if !flags.includes_left() {
                bound = bound.saturating_add(1);
            }
            if bound < self.aux.min_mapped_value {
                return Ok(0);
            }
            return Ok(bound.saturating_sub(self.aux.min_mapped_value));
        }

        let key = attribute_key(self.rg_info.id, &self.column.dotted_path, min);
        let entry = if flags.includes_left() {
            self.attr_values_kv.first_at_or_after(&key)?
        } else {
            self.attr_values_kv.first_after(&key)?
        };
        let prefix = column_prefix(self.rg_info.id, &self.column.dotted_path);
        match entry {
            Some((found, payload)) if found.starts_with(&prefix) => {
                Ok(decode_ordinal(&payload)? as i64)
            }
            _ => Ok(self.aux.max_mapped_value),
        }
    }

    /// Upper bound of a range in ordinal space; -1 when every value is
    /// above the bound.
    fn max_ordinal(&self, max: &T, flags: RangeFlags) -> Result<i64> {
        if !self.aux.use_value_mapping {
            let mut bound = max.to_i64().context(InvalidArgumentSnafu {
                reason: "attribute type requires value mapping",
            })?;
            if !flags.includes_right() {
                bound = bound.saturating_sub(1);
            }
            if bound > self.aux.max_mapped_value {
                bound = self.aux.max_mapped_value;
            }
            return Ok(bound.saturating_sub(self.aux.min_mapped_value));
        }

        let key = attribute_key(self.rg_info.id, &self.column.dotted_path, max);
        let prefix = column_prefix(self.rg_info.id, &self.column.dotted_path);
        let found = self.attr_values_kv.first_at_or_after(&key)?;
        let found = match found {
            Some(entry) if entry.0.starts_with(&prefix) => entry,
            // The whole column block is below the bound; take its last
            // ordinal.
            _ => return Ok(self.aux.cardinality as i64 - 1),
        };
        if found.0 == key && flags.includes_right() {
            return Ok(decode_ordinal(&found.1)? as i64);
        }
        match self.attr_values_kv.last_before(&found.0)? {
            Some((previous, payload)) if previous.starts_with(&prefix) => {
                Ok(decode_ordinal(&payload)? as i64)
            }
            _ => Ok(-1),
        }
    }

    /// Equality over an ordinal: intersection of the per-component equality
    /// bitmaps of its digits.
    async fn lookup_mapped(&self, ordinal: i64) -> Result<RoaringBitmap> {
        if ordinal < 0 || ordinal > self.aux.mapped_span() {
            return Ok(RoaringBitmap::new());
        }
        let digits = self
            .aux
            .decomposer
            .decompose(ordinal as u64)
            .context(ValueOutOfRangeSnafu {
                value: ordinal as u64,
            })?;
        let futures: Vec<BoxFuture<'_, Result<RoaringBitmap>>> = digits
            .iter()
            .enumerate()
            .map(|(component, &digit)| self.equality_bitmap(component, digit).boxed())
            .collect();
        let mut parts = try_join_all(futures).await?.into_iter();
        let mut result = parts.next().unwrap_or_default();
        for part in parts {
            result &= part;
        }
        Ok(result)
    }

    async fn range_search_internal(&self, v1: i64, v2: i64) -> Result<RoaringBitmap> {
        if v1 == 0 {
            return self.less_or_equal(v2).await;
        }
        let (mut upper, lower) = try_join!(self.less_or_equal(v2), self.less_or_equal(v1 - 1))?;
        upper -= lower;
        Ok(upper)
    }

    /// Documents with ordinal <= `upper`, combining per-component lesser
    /// and equality bitmaps along the digit prefix.
    async fn less_or_equal(&self, upper: i64) -> Result<RoaringBitmap> {
        if upper < 0 {
            return Ok(RoaringBitmap::new());
        }
        if upper >= self.aux.mapped_span() {
            return self.storage.load_all_values_bitmap().await;
        }
        let digits = self
            .aux
            .decomposer
            .decompose(upper as u64)
            .context(ValueOutOfRangeSnafu {
                value: upper as u64,
            })?;

        let lesser_futures: Vec<BoxFuture<'_, Result<RoaringBitmap>>> = digits
            .iter()
            .enumerate()
            .map(|(component, &digit)| self.lesser_bitmap(component, digit).boxed())
            .collect();
        let equality_futures: Vec<BoxFuture<'_, Result<RoaringBitmap>>> = digits
            .iter()
            .enumerate()
            .map(|(component, &digit)| self.equality_bitmap(component, digit).boxed())
            .collect();
        let (lessers, equalities) = try_join!(
            try_join_all(lesser_futures),
            try_join_all(equality_futures)
        )?;

        let mut lessers = lessers.into_iter();
        let mut equalities = equalities.into_iter();
        let mut result = lessers.next().unwrap_or_default();
        let mut prefix = equalities.next().unwrap_or_default();
        for (mut lesser, equality) in lessers.zip(equalities) {
            lesser &= &prefix;
            result |= lesser;
            prefix &= equality;
        }
        result |= prefix;
        Ok(result)
    }

    /// Bitmap of documents whose digit at `component` equals `digit`.
    async fn equality_bitmap(&self, component: usize, digit: u32) -> Result<RoaringBitmap> {
        match self.aux.encoding {
            Encoding::Equality => self.storage.load_bitmap(component, digit as usize).await,
            Encoding::Interval => self.equality_bitmap_interval(component, digit).await,
            Encoding::Range => self.equality_bitmap_range(component, digit).await,
        }
    }

    async fn equality_bitmap_range(&self, component: usize, digit: u32) -> Result<RoaringBitmap> {
        let base = self.aux.decomposer.base(component);
        if base == 1 && digit == 0 {
            // A single possible value: everything matches.
            return self.storage.load_all_values_bitmap().await;
        }
        if digit == base - 1 {
            let last = self
                .storage
                .load_const_bitmap(component, (base - 2) as usize, false)
                .await?;
            let mut all = self.storage.load_all_values_bitmap().await?;
            all -= &*last;
            return Ok(all);
        }
        if digit == 0 {
            return self.storage.load_bitmap(component, 0).await;
        }
        let (current, previous) = try_join!(
            self.storage.load_const_bitmap(component, digit as usize, false),
            self.storage
                .load_const_bitmap(component, (digit - 1) as usize, false)
        )?;
        let mut result = (*current).clone();
        result -= &*previous;
        Ok(result)
    }

    // The rule order matters: the early branches resolve the ties at
    // base 1, 2 and 3 before the generic m-based rules apply.
    async fn equality_bitmap_interval(
        &self,
        component: usize,
        digit: u32,
    ) -> Result<RoaringBitmap> {
        let base = self.aux.decomposer.base(component);
        let m = (base / 2).saturating_sub(1);

        if base == 1 {
            return if digit == 0 {
                self.storage.load_all_values_bitmap().await
            } else {
                Ok(RoaringBitmap::new())
            };
        }
        if digit == 0 && m == 0 {
            return self.storage.load_bitmap(component, 0).await;
        }
        if base == 2 && digit == 1 {
            let first = self.storage.load_const_bitmap(component, 0, false).await?;
            let mut all = self.storage.load_all_values_bitmap().await?;
            all -= &*first;
            return Ok(all);
        }
        if base == 3 && digit == 1 {
            return self.storage.load_bitmap(component, 1).await;
        }
        if digit < m {
            let (current, next) = try_join!(
                self.storage.load_const_bitmap(component, digit as usize, false),
                self.storage
                    .load_const_bitmap(component, (digit + 1) as usize, false)
            )?;
            let mut result = (*current).clone();
            result -= &*next;
            return Ok(result);
        }
        if digit == m && m > 0 {
            let (current, first) = try_join!(
                self.storage.load_const_bitmap(component, digit as usize, false),
                self.storage.load_const_bitmap(component, 0, false)
            )?;
            let mut result = (*current).clone();
            result &= &*first;
            return Ok(result);
        }
        if digit > m && digit < base - 1 && m > 0 {
            let (current, previous) = try_join!(
                self.storage
                    .load_const_bitmap(component, (digit - m) as usize, false),
                self.storage
                    .load_const_bitmap(component, (digit - m - 1) as usize, false)
            )?;
            let mut result = (*current).clone();
            result -= &*previous;
            return Ok(result);
        }
        if digit == base - 1 {
            let middle = (base / 2 + base % 2 - 1) as usize;
            let (covering, first, all) = try_join!(
                self.storage.load_const_bitmap(component, middle, false),
                self.storage.load_const_bitmap(component, 0, false),
                self.storage.load_all_values_bitmap()
            )?;
            let mut excluded = (*covering).clone();
            excluded |= &*first;
            let mut result = all;
            result -= excluded;
            return Ok(result);
        }
        InvalidArgumentSnafu {
            reason: format!("no interval equality rule for base {base}, digit {digit}"),
        }
        .fail()
    }

    /// Bitmap of documents whose digit at `component` is strictly below
    /// `digit`.
    async fn lesser_bitmap(&self, component: usize, digit: u32) -> Result<RoaringBitmap> {
        if digit == 0 {
            return Ok(RoaringBitmap::new());
        }
        // Turn "strictly less than digit" into "at most digit - 1".
        let digit = digit - 1;
        match self.aux.encoding {
            Encoding::Range => {
                let base = self.aux.decomposer.base(component);
                if digit >= base - 1 {
                    return self.storage.load_all_values_bitmap().await;
                }
                self.storage.load_bitmap(component, digit as usize).await
            }
            Encoding::Interval => {
                let base = self.aux.decomposer.base(component);
                let m = (base / 2).saturating_sub(1);
                if digit == 0 {
                    return self.equality_bitmap(component, 0).await;
                }
                if digit < m {
                    let (first, next) = try_join!(
                        self.storage.load_const_bitmap(component, 0, false),
                        self.storage
                            .load_const_bitmap(component, (digit + 1) as usize, false)
                    )?;
                    let mut result = (*first).clone();
                    result -= &*next;
                    return Ok(result);
                }
                if digit == m {
                    return self.storage.load_bitmap(component, 0).await;
                }
                if digit < base - 1 {
                    let (first, covering) = try_join!(
                        self.storage.load_const_bitmap(component, 0, false),
                        self.storage
                            .load_const_bitmap(component, (digit - m) as usize, false)
                    )?;
                    let mut result = (*first).clone();
                    result |= &*covering;
                    return Ok(result);
                }
                self.storage.load_all_values_bitmap().await
            }
            Encoding::Equality => UnsupportedEncodingSnafu {
                encoding: self.aux.encoding,
                operation: "lesser_bitmap",
            }
            .fail(),
        }
    }
}

fn decode_ordinal(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .ok()
        .context(DecodeOrdinalSnafu { len: payload.len() })?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchIndexPaths;
    use crate::decompose::{bitmap_counts, select_basis, ValueDecomposer};
    use crate::io::IoPool;
    use crate::model::{IndexKind, ValueType};
    use std::fs::File;

    const MAP_SIZE: usize = 64 << 20;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: Arc<File>,
        io: Arc<IoPool>,
        attr_values_kv: Arc<Dictionary>,
        aux_data_kv: Arc<Dictionary>,
        bitmap_offsets_kv: Arc<Dictionary>,
        rg_info: Arc<RowGroupInfo>,
        column: Arc<ColumnReference>,
    }

    fn fixture(value_type: ValueType) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = BatchIndexPaths::under(dir.path());
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&paths.bitmaps)
            .unwrap();
        Fixture {
            file: Arc::new(file),
            io: Arc::new(IoPool::new(64)),
            attr_values_kv: Arc::new(
                Dictionary::open(&paths.attribute_mapping, MAP_SIZE).unwrap(),
            ),
            aux_data_kv: Arc::new(Dictionary::open(&paths.aux_data, MAP_SIZE).unwrap()),
            bitmap_offsets_kv: Arc::new(
                Dictionary::open(&paths.bitmap_offsets, MAP_SIZE).unwrap(),
            ),
            rg_info: Arc::new(RowGroupInfo::new(0, 100)),
            column: Arc::new(ColumnReference::new("col", value_type)),
            _dir: dir,
        }
    }

    fn configure<T: IndexValue>(
        values: &[(DocumentId, T)],
        encoding: Encoding,
        kind: IndexKind,
    ) -> AuxData {
        crate::batch::builder::configure(values, encoding, kind)
    }

    async fn build<T: IndexValue>(
        fx: &Fixture,
        values: &[(DocumentId, T)],
        encoding: Encoding,
        kind: IndexKind,
    ) -> BitmapIndex<T> {
        let aux = configure(values, encoding, kind);
        let storage = BitmapStorage::create(
            fx.rg_info.clone(),
            fx.column.clone(),
            fx.file.clone(),
            fx.io.clone(),
            aux.bitmap_counts.clone(),
            fx.bitmap_offsets_kv.clone(),
        );
        BitmapIndex::create(
            fx.rg_info.clone(),
            fx.column.clone(),
            storage,
            fx.attr_values_kv.clone(),
            &fx.aux_data_kv,
            aux,
            values,
        )
        .await
        .unwrap()
    }

    fn docs(bitmap: &RoaringBitmap) -> Vec<u32> {
        bitmap.iter().collect()
    }

    const ENCODINGS: [Encoding; 3] = [Encoding::Equality, Encoding::Interval, Encoding::Range];
    const KINDS: [IndexKind; 2] = [IndexKind::Bitmap, IndexKind::Bitsliced];

    #[tokio::test]
    async fn test_lookup_unmapped_integers() {
        for encoding in ENCODINGS {
            for kind in KINDS {
                let fx = fixture(ValueType::UInt32);
                let values: Vec<(DocumentId, u32)> = vec![
                    (15, 4),
                    (16, 5),
                    (17, 4),
                    (19, 5),
                    (25, 7),
                    (30, 4),
                    (40, 8),
                ];
                let index = build(&fx, &values, encoding, kind).await;
                assert!(!index.aux_data().use_value_mapping);
                assert_eq!(docs(&index.lookup(&4).await.unwrap()), vec![15, 17, 30]);
                assert_eq!(docs(&index.lookup(&8).await.unwrap()), vec![40]);
                assert_eq!(docs(&index.lookup(&6).await.unwrap()), Vec::<u32>::new());
                assert_eq!(docs(&index.lookup(&100).await.unwrap()), Vec::<u32>::new());
                assert_eq!(
                    docs(&index.not_equals(&4).await.unwrap()),
                    vec![16, 19, 25, 40]
                );
                assert_eq!(index.get_not_null().await.unwrap().len(), 7);
            }
        }
    }

    #[tokio::test]
    async fn test_greater_and_lesser() {
        for encoding in [Encoding::Interval, Encoding::Range] {
            for kind in KINDS {
                let fx = fixture(ValueType::UInt32);
                let values: Vec<(DocumentId, u32)> = vec![
                    (15, 4),
                    (16, 5),
                    (17, 4),
                    (19, 5),
                    (25, 7),
                    (30, 4),
                    (40, 8),
                ];
                let index = build(&fx, &values, encoding, kind).await;
                assert_eq!(
                    docs(&index.greater(&7, RangeFlags::Closed).await.unwrap()),
                    vec![25, 40]
                );
                assert_eq!(
                    docs(&index.greater(&7, RangeFlags::Open).await.unwrap()),
                    vec![40]
                );
                assert_eq!(
                    docs(&index.lesser(&5, RangeFlags::IncludeRight).await.unwrap()),
                    vec![15, 16, 17, 19, 30]
                );
                assert_eq!(
                    docs(&index.lesser(&5, RangeFlags::Open).await.unwrap()),
                    vec![15, 17, 30]
                );
                assert_eq!(
                    docs(&index.range_search(&5, &7, RangeFlags::Closed).await.unwrap()),
                    vec![16, 19, 25]
                );
                assert_eq!(
                    docs(&index.range_search(&5, &7, RangeFlags::Open).await.unwrap()),
                    Vec::<u32>::new()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_string_mapping() {
        for encoding in ENCODINGS {
            let fx = fixture(ValueType::String);
            let values: Vec<(DocumentId, String)> = [
                (15, "armenia"),
                (16, "india"),
                (17, "japan"),
                (19, "india"),
                (25, "korea"),
                (30, "USA"),
            ]
            .into_iter()
            .map(|(doc, s)| (doc, s.to_string()))
            .collect();
            let index = build(&fx, &values, encoding, IndexKind::Bitsliced).await;
            assert!(index.aux_data().use_value_mapping);
            assert_eq!(
                docs(&index.lookup(&"india".to_string()).await.unwrap()),
                vec![16, 19]
            );
            assert_eq!(
                docs(&index.lookup(&"armenia".to_string()).await.unwrap()),
                vec![15]
            );
            assert_eq!(
                docs(&index.lookup(&"france".to_string()).await.unwrap()),
                Vec::<u32>::new()
            );
        }
    }

    #[tokio::test]
    async fn test_mapped_range_bounds() {
        for encoding in [Encoding::Interval, Encoding::Range] {
            let fx = fixture(ValueType::String);
            let values: Vec<(DocumentId, String)> = [
                (15, "armenia"),
                (16, "india"),
                (17, "japan"),
                (19, "india"),
                (25, "korea"),
                (30, "USA"),
            ]
            .into_iter()
            .map(|(doc, s)| (doc, s.to_string()))
            .collect();
            let index = build(&fx, &values, encoding, IndexKind::Bitsliced).await;
            // Bounds that are not present fall to the nearest ordinals.
            assert_eq!(
                docs(
                    &index
                        .range_search(
                            &"b".to_string(),
                            &"jazz".to_string(),
                            RangeFlags::Closed
                        )
                        .await
                        .unwrap()
                ),
                vec![16, 17, 19]
            );
            assert_eq!(
                docs(&index.greater(&"japan".to_string(), RangeFlags::Open).await.unwrap()),
                vec![25]
            );
            assert_eq!(
                docs(
                    &index
                        .lesser(&"aaa".to_string(), RangeFlags::IncludeRight)
                        .await
                        .unwrap()
                ),
                vec![30]
            );
            // Everything below the smallest value.
            assert!(index
                .lesser(&"A".to_string(), RangeFlags::IncludeRight)
                .await
                .unwrap()
                .is_empty());
            // Everything above the largest value.
            assert!(index
                .greater(&"zzz".to_string(), RangeFlags::IncludeLeft)
                .await
                .unwrap()
                .is_empty());
        }
    }

    #[tokio::test]
    async fn test_signed_unmapped_range() {
        for encoding in [Encoding::Interval, Encoding::Range] {
            let fx = fixture(ValueType::Int64);
            let values: Vec<(DocumentId, i64)> = vec![
                (15, -40_000_000_000_000),
                (17, -50_000_000_000_000),
                (18, -80_000_000_000_000),
                (19, -80_000_000_000_000),
                (25, -100_000_000_000_000),
                (7, -10_000_000_000_000),
            ];
            let index = build(&fx, &values, encoding, IndexKind::Bitsliced).await;
            assert!(!index.aux_data().use_value_mapping);
            assert_eq!(
                docs(
                    &index
                        .greater(&-50_000_000_000_000, RangeFlags::Closed)
                        .await
                        .unwrap()
                ),
                vec![7, 15, 17]
            );
        }
    }

    #[tokio::test]
    async fn test_equality_encoding_rejects_ranges() {
        let fx = fixture(ValueType::UInt32);
        let values: Vec<(DocumentId, u32)> = (0..50).map(|i| (i, i)).collect();
        let index = build(&fx, &values, Encoding::Equality, IndexKind::Bitsliced).await;
        let err = index.greater(&10, RangeFlags::Closed).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::UnsupportedEncoding { .. }
        ));
        assert!(index
            .lesser(&10, RangeFlags::Closed)
            .await
            .is_err());
        assert!(index
            .range_search(&1, &10, RangeFlags::Closed)
            .await
            .is_err());
        // A degenerate range is still an equality lookup.
        assert_eq!(
            docs(&index.range_search(&10, &10, RangeFlags::Closed).await.unwrap()),
            vec![10]
        );
    }

    #[tokio::test]
    async fn test_invalid_range_rejected() {
        let fx = fixture(ValueType::UInt32);
        let values: Vec<(DocumentId, u32)> = vec![(0, 1), (1, 2)];
        let index = build(&fx, &values, Encoding::Interval, IndexKind::Bitsliced).await;
        let err = index
            .range_search(&5, &1, RangeFlags::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_single_value_cardinality() {
        for encoding in ENCODINGS {
            let fx = fixture(ValueType::String);
            let values: Vec<(DocumentId, String)> =
                vec![(3, "only".to_string()), (9, "only".to_string())];
            let index = build(&fx, &values, encoding, IndexKind::Bitsliced).await;
            assert_eq!(docs(&index.lookup(&"only".to_string()).await.unwrap()), vec![3, 9]);
            assert!(index
                .lookup(&"other".to_string())
                .await
                .unwrap()
                .is_empty());
        }
    }

    #[tokio::test]
    async fn test_equality_consistency_across_encodings() {
        let values: Vec<(DocumentId, u32)> = (0..200u32).map(|i| (i, i * 7 % 23)).collect();
        let mut baseline = Vec::new();
        for (nth, encoding) in ENCODINGS.into_iter().enumerate() {
            let fx = fixture(ValueType::UInt32);
            let index = build(&fx, &values, encoding, IndexKind::Bitmap).await;
            let mut results = Vec::new();
            for v in 0..23u32 {
                results.push(docs(&index.lookup(&v).await.unwrap()));
            }
            if nth == 0 {
                baseline = results;
            } else {
                assert_eq!(results, baseline, "{encoding:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_encoding_symmetry() {
        // equality(i, a) == lesser(i, a + 1) - lesser(i, a) over every
        // digit, and the union of equalities covers everything.
        let values: Vec<(DocumentId, u32)> = (0..100u32).map(|i| (i, i % 30)).collect();
        for encoding in [Encoding::Interval, Encoding::Range] {
            for kind in KINDS {
                let fx = fixture(ValueType::UInt32);
                let index = build(&fx, &values, encoding, kind).await;
                let all = index.get_not_null().await.unwrap();
                let mut union = RoaringBitmap::new();
                for component in 0..index.aux_data().decomposer.num_components() {
                    let base = index.aux_data().decomposer.base(component);
                    for digit in 0..base {
                        let equality =
                            index.equality_bitmap(component, digit).await.unwrap();
                        let below = index.lesser_bitmap(component, digit).await.unwrap();
                        let mut through =
                            index.lesser_bitmap(component, digit + 1).await.unwrap();
                        through -= below;
                        assert_eq!(
                            equality, through,
                            "{encoding:?}/{kind:?} component {component} digit {digit}"
                        );
                        if component == 0 {
                            union |= equality;
                        }
                    }
                }
                assert_eq!(union, all);
            }
        }
    }

    #[tokio::test]
    async fn test_incremental_insert() {
        let fx = fixture(ValueType::UInt32);
        let values: Vec<(DocumentId, u32)> = (0..100u32).map(|i| (i, i % 10)).collect();
        let mut index = build(&fx, &values, Encoding::Interval, IndexKind::Bitsliced).await;
        index.insert(500, &3).await.unwrap();
        assert!(index.lookup(&3).await.unwrap().contains(500));
        assert!(index.get_not_null().await.unwrap().contains(500));
    }

    #[tokio::test]
    async fn test_aux_data_presence() {
        let fx = fixture(ValueType::UInt32);
        assert!(matches!(
            BitmapIndex::<u32>::require_aux_data(0, "col", &fx.aux_data_kv),
            Err(crate::error::Error::IndexNotFound { .. })
        ));
        let values: Vec<(DocumentId, u32)> = (0..30).map(|i| (i, i % 3)).collect();
        let index = build(&fx, &values, Encoding::Interval, IndexKind::Bitsliced).await;
        let aux = BitmapIndex::<u32>::require_aux_data(0, "col", &fx.aux_data_kv).unwrap();
        assert_eq!(aux.cardinality, index.aux_data().cardinality);
        assert_eq!(aux.encoding, Encoding::Interval);
    }

    #[test]
    fn test_decode_ordinal() {
        assert_eq!(decode_ordinal(&7u32.to_le_bytes()).unwrap(), 7);
        assert!(decode_ordinal(&[1, 2]).is_err());
    }

    #[test]
    fn test_counts_follow_basis() {
        let basis = select_basis(100, IndexKind::Bitmap);
        let decomposer = ValueDecomposer::new(basis.clone());
        assert_eq!(decomposer.basis(), &basis[..]);
        assert_eq!(
            bitmap_counts(&basis, Encoding::Range).len(),
            basis.len()
        );
    }
}
