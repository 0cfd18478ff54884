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

//! The external stream abstraction consumed by both engines.
//!
//! This is deliberately small: a [`Process`] is a boxed, one-shot, `Send` async step function.
//! Stepping it with a [`Cause`] yields an [`Step::Emit`] (a finite batch plus the continuation) or
//! [`Step::Halt`] (terminal). Passing [`Cause::End`] means "continue normally"; passing
//! [`Cause::Kill`]/[`Cause::Error`] requests abrupt cleanup, and the process that comes back only
//! performs finalizers before halting.
//!
//! None of the five codebases this crate is modeled on expose a single, general "pull stream with
//! explicit cleanup continuations" type — each has its own executor/channel-shaped answer to the
//! same problem. This module is the minimal, from-scratch answer the two combinators need; it is
//! not meant to grow into a general-purpose streaming library.

use std::future::Future;
use std::pin::Pin;

use smallvec::SmallVec;

use crate::cause::Cause;
use crate::config::INNER_CHUNK_HINT;

/// A finite batch of elements emitted by one [`Step::Emit`].
pub type Chunk<T> = SmallVec<[T; INNER_CHUNK_HINT]>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The result of stepping a [`Process`].
pub enum Step<T, E> {
    /// A finite batch of elements, plus the process to step next.
    Emit(Chunk<T>, Process<T, E>),
    /// Terminal: no further `Emit`s will ever follow.
    Halt(Cause<E>),
}

/// A one-shot, boxed async step function: the external `Stream` contract from the design (§3.2 /
/// §6) that both `wye` and `njoin` treat as a black box.
pub struct Process<T, E> {
    step: Box<dyn FnOnce(Cause<E>) -> BoxFuture<Step<T, E>> + Send>,
}

impl<T, E> Process<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Build a process from a step function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Cause<E>) -> Fut + Send + 'static,
        Fut: Future<Output = Step<T, E>> + Send + 'static,
    {
        Process {
            step: Box::new(move |cause| Box::pin(f(cause))),
        }
    }

    /// A process that immediately halts with `cause`, regardless of what it is stepped with.
    pub fn halt(cause: Cause<E>) -> Self {
        Process::new(move |_: Cause<E>| async move { Step::Halt(cause) })
    }

    /// Step the process forward, consuming it.
    pub async fn step(self, cause: Cause<E>) -> Step<T, E> {
        (self.step)(cause).await
    }

    /// Transform every element this process ever emits through `f`, applied lazily chunk by chunk
    /// as the underlying process is stepped. One of the "simple transformations" outside the
    /// concurrent core proper (§6) — single-threaded, no suspension of its own beyond the wrapped
    /// process's.
    pub fn map<U, F>(self, f: F) -> Process<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        map_with(self, std::sync::Arc::new(f))
    }

    /// Sequential composition: run `self` to normal completion (`Cause::End`), then continue as
    /// `next`. If `self` is stepped with `Kill`/`Error` (abrupt cleanup) or halts with anything
    /// other than `End`, `next` never runs — there is nothing for it to continue from. One of the
    /// "sequential combinators" outside the concurrent core (§1): ordinary pull evaluation, not a
    /// concern of `wye`/`njoin`.
    pub fn then(self, next: Process<T, E>) -> Process<T, E> {
        Process::new(move |cause: Cause<E>| async move {
            let was_end = cause.is_end();
            match self.step(cause).await {
                Step::Emit(chunk, rest) => Step::Emit(chunk, rest.then(next)),
                Step::Halt(Cause::End) if was_end => next.step(Cause::End).await,
                Step::Halt(other) => Step::Halt(other),
            }
        })
    }
}

fn map_with<T, U, E, F>(proc: Process<T, E>, f: std::sync::Arc<F>) -> Process<U, E>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    Process::new(move |cause: Cause<E>| async move {
        match proc.step(cause).await {
            Step::Emit(chunk, next) => {
                let mapped: Chunk<U> = chunk.into_iter().map(|item| f(item)).collect();
                Step::Emit(mapped, map_with(next, f))
            }
            Step::Halt(cause) => Step::Halt(cause),
        }
    })
}

/// Constructors for small, in-memory test processes. Not part of the combinator surface proper —
/// real sources (network exchanges, table scans, timers, ...) build [`Process`] values directly.
pub mod testing {
    use super::*;

    /// Emit every item of `chunks` in order, one [`Step::Emit`] per inner `Vec`, then halt `End`.
    /// If stepped with `Kill`/`Error` before exhausting `chunks`, halts immediately with that
    /// cause instead (simulating a well-behaved finalizer).
    pub fn from_chunks<T, E>(chunks: Vec<Vec<T>>) -> Process<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        build(chunks)
    }

    fn build<T, E>(mut chunks: Vec<Vec<T>>) -> Process<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        if chunks.is_empty() {
            return Process::new(|cause: Cause<E>| async move {
                Step::Halt(if cause.is_end() { Cause::End } else { cause })
            });
        }
        let head = chunks.remove(0);
        Process::new(move |cause: Cause<E>| async move {
            if !cause.is_end() {
                return Step::Halt(cause);
            }
            Step::Emit(Chunk::from_vec(head), build(chunks))
        })
    }

    /// Emit `items` as a single chunk, then halt `End`.
    pub fn from_iter<T, E>(items: impl IntoIterator<Item = T>) -> Process<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        from_chunks(vec![items.into_iter().collect()])
    }

    /// Emit `before` as chunks, then halt with `Cause::Error(err)` instead of `End`.
    pub fn failing_after<T, E>(before: Vec<Vec<T>>, err: E) -> Process<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        fn chain<T, E>(mut chunks: Vec<Vec<T>>, err: E) -> Process<T, E>
        where
            T: Send + 'static,
            E: Send + 'static,
        {
            if chunks.is_empty() {
                return Process::new(move |cause: Cause<E>| async move {
                    Step::Halt(if cause.is_end() { Cause::Error(err) } else { cause })
                });
            }
            let head = chunks.remove(0);
            Process::new(move |cause: Cause<E>| async move {
                if !cause.is_end() {
                    return Step::Halt(cause);
                }
                Step::Emit(Chunk::from_vec(head), chain(chunks, err))
            })
        }
        chain(before, err)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn from_iter_emits_then_halts() {
        let p: Process<i32, String> = from_iter(vec![1, 2, 3]);
        match p.step(Cause::End).await {
            Step::Emit(chunk, next) => {
                assert_eq!(chunk.into_vec(), vec![1, 2, 3]);
                assert_matches!(next.step(Cause::End).await, Step::Halt(Cause::End));
            }
            Step::Halt(_) => panic!("expected emit"),
        }
    }

    #[tokio::test]
    async fn kill_short_circuits_pending_chunks() {
        let p: Process<i32, String> = from_chunks(vec![vec![1], vec![2]]);
        assert_matches!(p.step(Cause::Kill).await, Step::Halt(Cause::Kill));
    }

    #[tokio::test]
    async fn map_transforms_every_chunk() {
        let p: Process<i32, String> = from_chunks(vec![vec![1, 2], vec![3]]);
        let p = p.map(|x| x * 10);
        match p.step(Cause::End).await {
            Step::Emit(chunk, next) => {
                assert_eq!(chunk.into_vec(), vec![10, 20]);
                match next.step(Cause::End).await {
                    Step::Emit(chunk, next) => {
                        assert_eq!(chunk.into_vec(), vec![30]);
                        assert_matches!(next.step(Cause::End).await, Step::Halt(Cause::End));
                    }
                    Step::Halt(_) => panic!("expected second emit"),
                }
            }
            Step::Halt(_) => panic!("expected emit"),
        }
    }

    #[tokio::test]
    async fn then_chains_on_normal_end_only() {
        let first: Process<i32, String> = from_iter(vec![1, 2]);
        let second: Process<i32, String> = from_iter(vec![3, 4]);
        let chained = first.then(second);
        let Step::Emit(chunk, next) = chained.step(Cause::End).await else {
            panic!("expected first emit");
        };
        assert_eq!(chunk.into_vec(), vec![1, 2]);
        let Step::Emit(chunk, next) = next.step(Cause::End).await else {
            panic!("expected second emit");
        };
        assert_eq!(chunk.into_vec(), vec![3, 4]);
        assert_matches!(next.step(Cause::End).await, Step::Halt(Cause::End));
    }

    #[tokio::test]
    async fn then_does_not_run_next_after_kill() {
        let first: Process<i32, String> = from_chunks(vec![vec![1]]);
        let second: Process<i32, String> = from_iter(vec![99]);
        let chained = first.then(second);
        assert_matches!(chained.step(Cause::Kill).await, Step::Halt(Cause::Kill));
    }
}
