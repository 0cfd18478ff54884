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

//! A handful of library merge programs, fed to [`crate::wye::wye`].
//!
//! Every concurrent combinator besides `wye`/`njoin` themselves (interleave, zip, a boolean kill
//! switch, ...) is just one of these programs plugged into the same engine — that's the whole
//! point of separating the engine from the program (design §1).

use either::Either;

use crate::cause::{caused_by, Cause, Chain};
use crate::program::{MergeStep, Recv, ReceiveY};
use crate::step::Chunk;

fn one<O>(x: O) -> Chunk<O> {
    let mut c = Chunk::new();
    c.push(x);
    c
}

/// Zip elements pairwise from both sides. Halts as soon as either side halts, discarding any
/// value buffered from the other side while waiting for its partner.
pub fn yip<L, R, E>() -> MergeStep<L, R, (L, R), E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    yip_step(None, None)
}

fn yip_step<L, R, E>(l: Option<L>, r: Option<R>) -> MergeStep<L, R, (L, R), E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    match (l, r) {
        (Some(lv), Some(rv)) => MergeStep::emit(one((lv, rv)), yip_step(None, None)),
        // Holding a left value with no right partner yet: await the right side only. This matters
        // when the left source hands over several elements in one chunk before the right source
        // has produced anything — with a plain `AwaitBoth` here, the engine would keep feeding
        // left elements and each would silently overwrite `lv` before it ever got paired.
        (Some(lv), None) => MergeStep::await_r(move |recv| match recv {
            Recv::Recv(rv) => yip_step(Some(lv), Some(rv)),
            Recv::Halt(c) => MergeStep::halt(c),
        }),
        (None, Some(rv)) => MergeStep::await_l(move |recv| match recv {
            Recv::Recv(lv) => yip_step(Some(lv), Some(rv)),
            Recv::Halt(c) => MergeStep::halt(c),
        }),
        (None, None) => MergeStep::await_both(|recv| match recv {
            ReceiveY::ReceiveL(x) => yip_step(Some(x), None),
            ReceiveY::ReceiveR(y) => yip_step(None, Some(y)),
            ReceiveY::HaltL(c) => MergeStep::halt(c),
            ReceiveY::HaltR(c) => MergeStep::halt(c),
        }),
    }
}

/// Interleave both sides as they arrive, tagging each element with which side it came from. If a
/// side halts with `Error`, the whole program halts immediately with that error (propagated, not
/// masked by further output from the healthy side). If a side ends normally (`End`/`Kill`), the
/// program keeps draining the other side until it, too, completes, then halts with the combined
/// cause.
pub fn merge<L, R, E>() -> MergeStep<L, R, Either<L, R>, E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Chain + Send + 'static,
{
    both()
}

fn both<L, R, E>() -> MergeStep<L, R, Either<L, R>, E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_both(|recv| match recv {
        ReceiveY::ReceiveL(l) => MergeStep::emit(one(Either::Left(l)), both()),
        ReceiveY::ReceiveR(r) => MergeStep::emit(one(Either::Right(r)), both()),
        ReceiveY::HaltL(c) if c.is_error() => MergeStep::halt(c),
        ReceiveY::HaltL(c) => only_r(c),
        ReceiveY::HaltR(c) if c.is_error() => MergeStep::halt(c),
        ReceiveY::HaltR(c) => only_l(c),
    })
}

fn only_r<L, R, E>(left_cause: Cause<E>) -> MergeStep<L, R, Either<L, R>, E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_r(move |recv| match recv {
        Recv::Recv(r) => MergeStep::emit(one(Either::Right(r)), only_r(left_cause)),
        Recv::Halt(right_cause) => MergeStep::halt(caused_by(left_cause, right_cause)),
    })
}

fn only_l<L, R, E>(right_cause: Cause<E>) -> MergeStep<L, R, Either<L, R>, E>
where
    L: Send + 'static,
    R: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_l(move |recv| match recv {
        Recv::Recv(l) => MergeStep::emit(one(Either::Left(l)), only_l(right_cause)),
        Recv::Halt(left_cause) => MergeStep::halt(caused_by(left_cause, right_cause)),
    })
}

/// Like [`merge`], but both sides share one element type, so the output needs no tagging.
pub fn merge_same<T, E>() -> MergeStep<T, T, T, E>
where
    T: Send + 'static,
    E: Chain + Send + 'static,
{
    same_both()
}

fn same_both<T, E>() -> MergeStep<T, T, T, E>
where
    T: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_both(|recv| match recv {
        ReceiveY::ReceiveL(v) | ReceiveY::ReceiveR(v) => MergeStep::emit(one(v), same_both()),
        ReceiveY::HaltL(c) if c.is_error() => MergeStep::halt(c),
        ReceiveY::HaltL(c) => same_only_r(c),
        ReceiveY::HaltR(c) if c.is_error() => MergeStep::halt(c),
        ReceiveY::HaltR(c) => same_only_l(c),
    })
}

fn same_only_r<T, E>(left_cause: Cause<E>) -> MergeStep<T, T, T, E>
where
    T: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_r(move |recv| match recv {
        Recv::Recv(v) => MergeStep::emit(one(v), same_only_r(left_cause)),
        Recv::Halt(right_cause) => MergeStep::halt(caused_by(left_cause, right_cause)),
    })
}

fn same_only_l<T, E>(right_cause: Cause<E>) -> MergeStep<T, T, T, E>
where
    T: Send + 'static,
    E: Chain + Send + 'static,
{
    MergeStep::await_l(move |recv| match recv {
        Recv::Recv(v) => MergeStep::emit(one(v), same_only_l(right_cause)),
        Recv::Halt(left_cause) => MergeStep::halt(caused_by(left_cause, right_cause)),
    })
}

/// A boolean "kill switch" merge program: the left side carries `bool` control values, the right
/// side carries the real data. Emits every right-side element until the left side delivers
/// `true`, at which point the program halts `End` (driving the engine to kill the right side,
/// even mid-fetch) regardless of what the right side is doing.
pub fn interrupt<R, E>() -> MergeStep<bool, R, R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    MergeStep::await_both(|recv| match recv {
        ReceiveY::ReceiveL(true) => MergeStep::halt(Cause::End),
        ReceiveY::ReceiveL(false) => interrupt(),
        ReceiveY::ReceiveR(r) => MergeStep::emit(one(r), interrupt()),
        ReceiveY::HaltL(c) => MergeStep::halt(c),
        ReceiveY::HaltR(c) => MergeStep::halt(c),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::program::feed_l as apply_l;
    use crate::program::feed_r as apply_r;

    fn recv_step<L, R, O, E>(
        step: MergeStep<L, R, O, E>,
        y: ReceiveY<L, R, E>,
    ) -> MergeStep<L, R, O, E> {
        match step {
            MergeStep::AwaitBoth(f) => f(y),
            other => other,
        }
    }

    #[test]
    fn yip_pairs_then_halts() {
        let step: MergeStep<i32, i32, (i32, i32), String> = yip();
        let step = apply_l(step, 1);
        assert_matches!(step, MergeStep::AwaitR(_));
        let step = apply_r(step, 10);
        match step {
            MergeStep::Emit(chunk, next) => {
                assert_eq!(chunk.into_vec(), vec![(1, 10)]);
                assert_matches!(*next, MergeStep::AwaitBoth(_));
            }
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn yip_does_not_overwrite_buffered_left_with_a_second_left() {
        // Two left elements arrive before any right element: the second must not be silently
        // dropped or overwrite the first, and the program must still pair correctly once a right
        // element finally arrives.
        let step: MergeStep<i32, i32, (i32, i32), String> = yip();
        let step = apply_l(step, 1);
        // `yip` is now awaiting the right side only; a raw `ReceiveY::ReceiveL` can't even reach
        // it, so `apply_l` on an `AwaitR` step is a documented no-op (§ see `feed_l`), exactly the
        // property this test exists to pin down.
        let step = apply_l(step, 2);
        assert_matches!(step, MergeStep::AwaitR(_));
        let step = apply_r(step, 10);
        match step {
            MergeStep::Emit(chunk, _) => assert_eq!(chunk.into_vec(), vec![(1, 10)]),
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn merge_propagates_error_immediately() {
        let step: MergeStep<i32, i32, Either<i32, i32>, String> = merge();
        let step = recv_step(step, ReceiveY::HaltR(Cause::Error("boom".into())));
        assert_matches!(step, MergeStep::Halt(Cause::Error(_)));
    }

    #[test]
    fn merge_drains_remaining_side_after_normal_end() {
        let step: MergeStep<i32, i32, Either<i32, i32>, String> = merge();
        let step = recv_step(step, ReceiveY::HaltR(Cause::End));
        assert_matches!(step, MergeStep::AwaitL(_));
    }

    #[test]
    fn merge_same_interleaves_without_tagging() {
        let step: MergeStep<i32, i32, i32, String> = merge_same();
        let step = recv_step(step, ReceiveY::ReceiveL(1));
        match step {
            MergeStep::Emit(chunk, _) => assert_eq!(chunk.into_vec(), vec![1]),
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn merge_same_drains_remaining_side_after_normal_end() {
        let step: MergeStep<i32, i32, i32, String> = merge_same();
        let step = recv_step(step, ReceiveY::HaltL(Cause::End));
        assert_matches!(step, MergeStep::AwaitR(_));
    }

    #[test]
    fn interrupt_halts_on_true() {
        let step: MergeStep<bool, i32, i32, String> = interrupt();
        let step = recv_step(step, ReceiveY::ReceiveL(true));
        assert_matches!(step, MergeStep::Halt(Cause::End));
    }
}
