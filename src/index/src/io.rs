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

//! Bounded asynchronous positioned I/O over the shared bitmaps file.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;
use snafu::ResultExt;
use tokio::sync::Semaphore;

use crate::error::{IoSnafu, JoinSnafu, QueueFullSnafu, Result};

/// Storage blocks are written in whole disk blocks so the buffers stay
/// O_DIRECT friendly.
pub const DISK_BLOCK_SIZE: u32 = 4096;

/// Rounds `len` up to the next disk block boundary.
pub fn round_to_disk_block(len: u32) -> u32 {
    len.div_ceil(DISK_BLOCK_SIZE) * DISK_BLOCK_SIZE
}

/// Outcome of a completed write submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub bytes_written: u64,
}

/// Submission pool for positioned reads and writes.
///
/// The pool admits at most `queue_depth` in-flight requests; submissions
/// beyond that fail with the retriable `QueueFull`. Completions are driven
/// on the blocking executor, so a dropped future leaves its request running
/// to completion.
#[derive(Debug)]
pub struct IoPool {
    permits: Arc<Semaphore>,
    queue_depth: usize,
}

impl IoPool {
    pub fn new(queue_depth: usize) -> IoPool {
        IoPool {
            permits: Arc::new(Semaphore::new(queue_depth)),
            queue_depth,
        }
    }

    /// Reads exactly `len` bytes at `offset`. A short read fails the
    /// request.
    pub async fn submit_read(&self, file: Arc<File>, offset: u64, len: usize) -> Result<Bytes> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return QueueFullSnafu {
                depth: self.queue_depth,
            }
            .fail();
        };
        let buf = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .context(JoinSnafu)?
        .context(IoSnafu)?;
        Ok(Bytes::from(buf))
    }

    /// Writes the whole buffer at `offset`.
    pub async fn submit_write(
        &self,
        file: Arc<File>,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<WriteResult> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return QueueFullSnafu {
                depth: self.queue_depth,
            }
            .fail();
        };
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            file.write_all_at(&data, offset)?;
            Ok(WriteResult {
                bytes_written: data.len() as u64,
            })
        })
        .await
        .context(JoinSnafu)?
        .context(IoSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn scratch_file() -> (tempfile::TempDir, Arc<File>) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("blob"))
            .unwrap();
        (dir, Arc::new(file))
    }

    #[test]
    fn test_round_to_disk_block() {
        assert_eq!(round_to_disk_block(0), 0);
        assert_eq!(round_to_disk_block(1), 4096);
        assert_eq!(round_to_disk_block(4096), 4096);
        assert_eq!(round_to_disk_block(4097), 8192);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, file) = scratch_file();
        let pool = IoPool::new(4);

        let result = pool
            .submit_write(file.clone(), 4096, b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(result.bytes_written, 5);

        let read = pool.submit_read(file, 4096, 5).await.unwrap();
        assert_eq!(read.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_short_read_fails() {
        let (_dir, file) = scratch_file();
        let pool = IoPool::new(4);
        pool.submit_write(file.clone(), 0, b"abc".to_vec())
            .await
            .unwrap();
        let err = pool.submit_read(file, 0, 100).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn test_queue_depth_exhaustion() {
        let (_dir, file) = scratch_file();
        let pool = IoPool::new(0);
        let err = pool.submit_read(file, 0, 1).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull { depth: 0, .. }));
    }
}
