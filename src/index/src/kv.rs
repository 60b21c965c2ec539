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

//! Ordered key/value dictionary backed by one LMDB environment.
//!
//! Keys are raw bytes compared lexicographically; all cursor positioning
//! builds on that order. Transactions are short-lived: every operation
//! opens one, runs a single cursor scan or bulk put, and commits or drops
//! it before returning.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use snafu::ResultExt;

use crate::error::{IoSnafu, KvSnafu, Result};

/// One LMDB environment holding a single unnamed database.
#[derive(Debug)]
pub struct Dictionary {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
}

/// Attaches db path and operation context to a heed result.
macro_rules! kv_context {
    ($result:expr, $dict:expr, $op:literal) => {
        $result.with_context(|_| KvSnafu {
            path: $dict.path.display().to_string(),
            operation: $op,
        })
    };
}

impl Dictionary {
    /// Opens (creating if needed) the environment rooted at `path`.
    /// `map_size` bounds the address space reservation, not the file size.
    pub fn open(path: &Path, map_size: usize) -> Result<Dictionary> {
        std::fs::create_dir_all(path).context(IoSnafu)?;
        let ctx = |operation: &'static str| KvSnafu {
            path: path.display().to_string(),
            operation,
        };
        // Opening an environment is unsafe in heed because the same
        // directory must not be mapped twice within one process.
        let env = unsafe { EnvOpenOptions::new().map_size(map_size).open(path) }
            .context(ctx("open environment"))?;
        let mut wtxn = env.write_txn().context(ctx("begin write txn"))?;
        let db = env
            .create_database(&mut wtxn, None)
            .context(ctx("create database"))?;
        wtxn.commit().context(ctx("commit"))?;
        Ok(Dictionary {
            env,
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = kv_context!(self.env.read_txn(), self, "begin read txn")?;
        let value = kv_context!(self.db.get(&rtxn, key), self, "get")?;
        Ok(value.map(|v| v.to_vec()))
    }

    /// Inserts all entries within a single write transaction.
    pub fn put_many<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut wtxn = kv_context!(self.env.write_txn(), self, "begin write txn")?;
        for (key, value) in entries {
            kv_context!(self.db.put(&mut wtxn, &key, &value), self, "put")?;
        }
        kv_context!(wtxn.commit(), self, "commit")
    }

    /// First entry with key >= `key` (lower bound).
    pub fn first_at_or_after(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.first_in_range(Bound::Included(key))
    }

    /// First entry with key > `key` (upper bound).
    pub fn first_after(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.first_in_range(Bound::Excluded(key))
    }

    fn first_in_range(&self, start: Bound<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let rtxn = kv_context!(self.env.read_txn(), self, "begin read txn")?;
        let range = (start, Bound::Unbounded);
        let mut iter = kv_context!(self.db.range(&rtxn, &range), self, "seek")?;
        match iter.next() {
            Some(entry) => {
                let (k, v) = kv_context!(entry, self, "cursor next")?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
            None => Ok(None),
        }
    }

    /// Last entry with key strictly below `key`.
    pub fn last_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let rtxn = kv_context!(self.env.read_txn(), self, "begin read txn")?;
        let range = (Bound::Unbounded, Bound::Excluded(key));
        let mut iter = kv_context!(self.db.rev_range(&rtxn, &range), self, "seek back")?;
        match iter.next() {
            Some(entry) => {
                let (k, v) = kv_context!(entry, self, "cursor prev")?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
            None => Ok(None),
        }
    }

    /// Up to `count` consecutive entries starting at the lower bound of
    /// `start`. Callers are responsible for checking that yielded keys stay
    /// within their block.
    pub fn read_block(&self, start: &[u8], count: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtxn = kv_context!(self.env.read_txn(), self, "begin read txn")?;
        let range = (Bound::Included(start), Bound::Unbounded);
        let iter = kv_context!(self.db.range(&rtxn, &range), self, "seek")?;
        let mut entries = Vec::with_capacity(count);
        for entry in iter.take(count) {
            let (k, v) = kv_context!(entry, self, "cursor next")?;
            entries.push((k.to_vec(), v.to_vec()));
        }
        Ok(entries)
    }
}
