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

//! Merge programs: the pure, synchronous state machine that drives `wye`.
//!
//! A [`MergeStep`] is a *value*, not a `Future` — stepping it never does I/O and never suspends.
//! The `wye` engine interprets it (§4.2.3 of the design doc), and feeds it input through
//! [`feed_l`]/[`feed_r`]/[`disconnect_l`]/[`disconnect_r`], which are the only ways to advance a
//! program forward. Keeping the program pure is what lets the engine run its interpretation loop
//! synchronously inside a single mailbox message handler.

use crate::cause::Cause;
use crate::step::Chunk;

/// What arrived for a single-side await (`AwaitL`/`AwaitR`): either an element, or the side's
/// terminal cause.
pub enum Recv<T, E> {
    Recv(T),
    Halt(Cause<E>),
}

/// What arrived for an `AwaitBoth`: an element from either side, tagged, or a halt from either
/// side.
pub enum ReceiveY<L, R, E> {
    ReceiveL(L),
    ReceiveR(R),
    HaltL(Cause<E>),
    HaltR(Cause<E>),
}

type AwaitL<L, R, O, E> = Box<dyn FnOnce(Recv<L, E>) -> MergeStep<L, R, O, E> + Send>;
type AwaitR<L, R, O, E> = Box<dyn FnOnce(Recv<R, E>) -> MergeStep<L, R, O, E> + Send>;
type AwaitBoth<L, R, O, E> = Box<dyn FnOnce(ReceiveY<L, R, E>) -> MergeStep<L, R, O, E> + Send>;

/// A merge program's current step. See the module docs and design §3.3/§4.2.3.
pub enum MergeStep<L, R, O, E> {
    /// Emit a finite batch of output, then continue as `next`.
    Emit(Chunk<O>, Box<MergeStep<L, R, O, E>>),
    /// Suspended waiting for the left side only.
    AwaitL(AwaitL<L, R, O, E>),
    /// Suspended waiting for the right side only.
    AwaitR(AwaitR<L, R, O, E>),
    /// Suspended waiting for either side, whichever arrives first.
    AwaitBoth(AwaitBoth<L, R, O, E>),
    /// Terminal.
    Halt(Cause<E>),
}

impl<L, R, O, E> MergeStep<L, R, O, E>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    pub fn emit(chunk: Chunk<O>, next: MergeStep<L, R, O, E>) -> Self {
        MergeStep::Emit(chunk, Box::new(next))
    }

    pub fn await_l<F>(f: F) -> Self
    where
        F: FnOnce(Recv<L, E>) -> MergeStep<L, R, O, E> + Send + 'static,
    {
        MergeStep::AwaitL(Box::new(f))
    }

    pub fn await_r<F>(f: F) -> Self
    where
        F: FnOnce(Recv<R, E>) -> MergeStep<L, R, O, E> + Send + 'static,
    {
        MergeStep::AwaitR(Box::new(f))
    }

    pub fn await_both<F>(f: F) -> Self
    where
        F: FnOnce(ReceiveY<L, R, E>) -> MergeStep<L, R, O, E> + Send + 'static,
    {
        MergeStep::AwaitBoth(Box::new(f))
    }

    pub fn halt(cause: Cause<E>) -> Self {
        MergeStep::Halt(cause)
    }
}

/// Feed one left-side element to a program awaiting it (`AwaitL` or `AwaitBoth`). A program not
/// currently awaiting the left side is returned unchanged — the engine only calls this while the
/// program is in one of those two states.
pub fn feed_l<L, R, O, E>(step: MergeStep<L, R, O, E>, item: L) -> MergeStep<L, R, O, E> {
    match step {
        MergeStep::AwaitL(f) => f(Recv::Recv(item)),
        MergeStep::AwaitBoth(f) => f(ReceiveY::ReceiveL(item)),
        other => other,
    }
}

/// Feed one right-side element. Symmetric to [`feed_l`].
pub fn feed_r<L, R, O, E>(step: MergeStep<L, R, O, E>, item: R) -> MergeStep<L, R, O, E> {
    match step {
        MergeStep::AwaitR(f) => f(Recv::Recv(item)),
        MergeStep::AwaitBoth(f) => f(ReceiveY::ReceiveR(item)),
        other => other,
    }
}

/// Drive a program past every await on the left side, delivering `cause` to the first one and
/// [`Cause::Kill`] to any further one it performs (a well-behaved program halts on the first
/// delivery; this loop exists only so a program that keeps awaiting a dead side does not hang).
/// Implemented iteratively, not by recursion, so an arbitrarily patient program cannot blow the
/// stack.
pub fn disconnect_l<L, R, O, E>(mut step: MergeStep<L, R, O, E>, cause: Cause<E>) -> MergeStep<L, R, O, E> {
    let mut cause = Some(cause);
    loop {
        step = match step {
            MergeStep::AwaitL(f) => f(Recv::Halt(cause.take().unwrap_or(Cause::Kill))),
            MergeStep::AwaitBoth(f) => f(ReceiveY::HaltL(cause.take().unwrap_or(Cause::Kill))),
            other => return other,
        };
    }
}

/// Symmetric to [`disconnect_l`] for the right side.
pub fn disconnect_r<L, R, O, E>(mut step: MergeStep<L, R, O, E>, cause: Cause<E>) -> MergeStep<L, R, O, E> {
    let mut cause = Some(cause);
    loop {
        step = match step {
            MergeStep::AwaitR(f) => f(Recv::Halt(cause.take().unwrap_or(Cause::Kill))),
            MergeStep::AwaitBoth(f) => f(ReceiveY::HaltR(cause.take().unwrap_or(Cause::Kill))),
            other => return other,
        };
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn feed_l_ignores_program_not_awaiting_left() {
        let step: MergeStep<i32, i32, i32, String> = MergeStep::halt(Cause::End);
        let step = feed_l(step, 1);
        assert_matches!(step, MergeStep::Halt(Cause::End));
    }

    #[test]
    fn disconnect_l_delivers_once_then_kill() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let kills_seen = Arc::new(AtomicU32::new(0));

        // A pathological program that keeps awaiting the left side three times, recording
        // whether each delivery was the real cause (first) or the synthetic `Kill` (rest).
        fn awaiter(
            n: u32,
            kills_seen: Arc<AtomicU32>,
        ) -> MergeStep<i32, i32, i32, String> {
            if n == 0 {
                return MergeStep::halt(Cause::End);
            }
            MergeStep::await_l(move |recv: Recv<i32, String>| {
                if matches!(recv, Recv::Halt(Cause::Kill)) {
                    kills_seen.fetch_add(1, Ordering::SeqCst);
                }
                awaiter(n - 1, kills_seen)
            })
        }
        let step = awaiter(3, kills_seen.clone());
        let result = disconnect_l(step, Cause::End);
        assert_matches!(result, MergeStep::Halt(Cause::End));
        // first delivery carried the real `End`, the other two were synthetic `Kill`s.
        assert_eq!(kills_seen.load(Ordering::SeqCst), 2);
    }
}
