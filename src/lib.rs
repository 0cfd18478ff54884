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

//! Concurrent merge primitives for pull-based streams.
//!
//! This crate provides two combinators for merging asynchronous streams with non-deterministic
//! concurrency, plus the termination vocabulary they share:
//!
//! - [`wye`]: merge exactly two source streams, driven by a reusable, pure "merge program"
//!   ([`programs`]) that decides at each step which side(s) to read and what to emit. Every other
//!   concurrent combinator over two streams (zip, interleave, a boolean kill switch, ...) is just
//!   a different program fed to the same engine.
//! - [`njoin`]: merge a dynamic, potentially unbounded stream of inner streams into one output,
//!   bounded by caller-chosen limits on open inners and buffered output.
//!
//! Every stream here halts with a [`cause::Cause`]: normal exhaustion, forced cancellation, or an
//! opaque caller-supplied error. Neither combinator depends on a specific async runtime directly;
//! both are parameterized over a [`strategy::Strategy`] for spawning work, with
//! [`strategy::TokioStrategy`] as the default.
//!
//! The external stream abstraction both engines consume is [`step::Process`] — not a general
//! streaming library, just the minimal pull-based contract the engines need (see that module's
//! docs for why this crate doesn't depend on one of the broader stream ecosystems for it).

pub mod cause;
pub mod config;
pub mod error;
pub mod njoin;
pub mod program;
pub mod programs;
pub mod queue;
pub mod signal;
pub mod step;
pub mod strategy;
pub mod wye;

pub use cause::{caused_by, kill, Cause, Chain};
pub use error::{MergeError, MergeResult};
pub use njoin::{njoin, NjoinHandle};
pub use program::{disconnect_l, disconnect_r, feed_l, feed_r, MergeStep, Recv, ReceiveY};
pub use programs::{interrupt, merge, merge_same, yip};
pub use step::{Chunk, Process, Step};
pub use strategy::{Strategy, TokioStrategy};
pub use wye::{wye, WyeHandle};
