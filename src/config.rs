// Copyright 2024 Merge Streams Authors
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

//! Internal capacity constants.
//!
//! This crate is a library, not a service, so there is no configuration file to parse: the only
//! caller-controlled knobs are the arguments `wye`/`njoin` already take (`max_open`, `max_queued`)
//! plus the [`crate::strategy::Strategy`] implementation. The constant below sizes internal
//! plumbing that is never exposed as a tunable, because making it tunable would leak mailbox
//! implementation details into the public API for no behavioral benefit.

/// Inline capacity of [`crate::step::Chunk`], the small-vector type every `Emit` batch uses. Sized
/// for the common case (a handful of elements per step) so most batches never spill to the heap;
/// larger batches simply reallocate like any other `SmallVec`.
pub const INNER_CHUNK_HINT: usize = 8;
