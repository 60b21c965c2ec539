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

use std::io::Error as IoError;

use snafu::{Location, Snafu};

use crate::model::Encoding;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Index not found for row group {rg_id}, column {column}"))]
    IndexNotFound {
        rg_id: u32,
        column: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Cannot perform {operation} over a {encoding:?}-encoded index"))]
    UnsupportedEncoding {
        encoding: Encoding,
        operation: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid argument: {reason}"))]
    InvalidArgument {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Mapped value {value} exceeds the decomposition range"))]
    ValueOutOfRange {
        value: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("KV store failure, db: {path}, operation: {operation}"))]
    Kv {
        #[snafu(source)]
        error: heed::Error,
        path: String,
        operation: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to perform IO operation"))]
    Io {
        #[snafu(source)]
        error: IoError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Expected to write {expected} bytes, wrote {actual}"))]
    WriteSizeMismatch {
        expected: u64,
        actual: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("IO submission queue is full, depth: {depth}"))]
    QueueFull {
        depth: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to serialize bitmap"))]
    SerializeBitmap {
        #[snafu(source)]
        error: IoError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to deserialize bitmap"))]
    DeserializeBitmap {
        #[snafu(source)]
        error: IoError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to decode index auxiliary data: {reason}"))]
    DecodeAuxData {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Unexpected attribute ordinal payload of {len} bytes"))]
    DecodeOrdinal {
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Unexpected offset range payload of {len} bytes"))]
    DecodeOffsetRange {
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Missing bitmap offsets for row group {rg_id}, column {column}, bitmap {number}"
    ))]
    MissingBitmapOffsets {
        rg_id: u32,
        column: String,
        number: u16,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to join index build task"))]
    Join {
        #[snafu(source)]
        error: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
