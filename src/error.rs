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

//! Crate-level error surface.
//!
//! This is deliberately thin: almost every fault this crate deals with is an in-merge [`Cause`]
//! (see [`crate::cause`]) flowing through the normal termination channel, generic over the
//! caller's own error payload. [`MergeError`] only covers failures that happen *around* a running
//! merge, in the spirit of the host library's per-subsystem error enums.

use thiserror::Error;

pub type MergeResult<T> = Result<T, MergeError>;

#[derive(Error, Debug)]
pub enum MergeError {
    /// The task driving a `wye`/`njoin` mailbox panicked or was otherwise dropped without
    /// finishing its shutdown sequence.
    #[error("merge engine task terminated unexpectedly: {0}")]
    EngineTaskLost(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
