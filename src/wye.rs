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

//! `wye`: merge exactly two source streams, driven by a reusable merge program.
//!
//! The engine is a single-consumer mailbox task (design §4.1/§4.2), grounded on the same shape as
//! the host library's `LocalBarrierWorker`: a private message enum, channel receivers, and one
//! task that owns all mutable state and runs a `tokio::select!` loop. Two channels feed the
//! mailbox rather than one: side fetches post on a channel typed over `L`/`R`, while the
//! consumer-facing handle posts on a channel typed only over the output `O` and error `E` — the
//! handle never needs to know the side types, so it doesn't carry them in its own signature.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::cause::{caused_by, Cause, Chain};
use crate::error::MergeError;
use crate::program::{disconnect_l, disconnect_r, feed_l, feed_r, MergeStep};
use crate::step::{Chunk, Process, Step};
use crate::strategy::Strategy;

type SideResult<T, E> = Result<(Chunk<T>, Process<T, E>), Cause<E>>;

enum SideMsg<L, R, E> {
    ReadyL(SideResult<L, E>),
    ReadyR(SideResult<R, E>),
}

enum CtrlMsg<O, E> {
    Get(oneshot::Sender<GetReply<O, E>>),
    DownDone,
}

enum GetReply<O, E> {
    Chunk(Chunk<O>),
    Halt(Cause<E>),
}

/// Per-side fetch state (design §3.3). `Running` keeps the interrupt half of a oneshot so a kill
/// can reach an in-flight fetch; it's taken (not cloned) the first time a kill is requested, making
/// repeat kill attempts an idempotent no-op.
enum SideState<T, E> {
    Done(Cause<E>),
    Running(Option<oneshot::Sender<Cause<E>>>),
    Idle(Process<T, E>),
}

impl<T, E> SideState<T, E> {
    fn is_done(&self) -> bool {
        matches!(self, SideState::Done(_))
    }

    fn done_cause(&self) -> Option<&Cause<E>> {
        match self {
            SideState::Done(c) => Some(c),
            _ => None,
        }
    }
}

struct Engine<L, R, O, E, S> {
    program: MergeStep<L, R, O, E>,
    left: SideState<L, E>,
    right: SideState<R, E>,
    /// Items fed from a `Ready` chunk that the program hasn't yet been ready to accept (§4.2.4:
    /// "stops early if the program emits or halts partway through the chunk" — these are what's
    /// left over, fed again as soon as the program re-awaits this side).
    left_backlog: VecDeque<L>,
    right_backlog: VecDeque<R>,
    /// Chunks the program has emitted but the consumer hasn't pulled yet, FIFO.
    out_backlog: VecDeque<Chunk<O>>,
    pending_get: Option<oneshot::Sender<GetReply<O, E>>>,
    final_cause: Option<Cause<E>>,
    /// Set once `final_cause` has been handed to a consumer. Distinguishes "not computed yet" from
    /// "computed and already delivered", both of which leave `final_cause` as `None`.
    final_delivered: bool,
    /// Each side's contribution to the final cause, captured the moment the program transitions to
    /// `Halt` (§4.2.8): the side's own cause if it had already finished on its own, or `Cause::End`
    /// if it was still running and is only being force-killed as cleanup. Keeps a side's forced
    /// shutdown from masking a graceful program halt behind `Cause::Kill`.
    left_halt_contrib: Option<Cause<E>>,
    right_halt_contrib: Option<Cause<E>>,
    left_bias: bool,
    tx: UnboundedSender<SideMsg<L, R, E>>,
    strategy: S,
    /// Set once the consumer has dropped the output handle. No further `Get` will ever arrive, so
    /// the engine must not wait on `final_delivered` to decide it is drained.
    consumer_gone: bool,
}

impl<L, R, O, E, S> Engine<L, R, O, E, S>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    E: Chain + Clone + Send + 'static,
    S: Strategy,
{
    /// Drain any `Emit` chain at the front of `self.program` into `out_backlog`, stopping at the
    /// first suspension (`Await*`) or `Halt`. Never starts a new fetch — callers that still have
    /// backlog to feed for the side(s) the program is now awaiting get first refusal.
    fn settle_emits(&mut self) {
        loop {
            let step = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
            match step {
                MergeStep::Emit(chunk, next) => {
                    self.program = *next;
                    if !chunk.is_empty() {
                        self.out_backlog.push_back(chunk);
                    }
                }
                other => {
                    self.program = other;
                    return;
                }
            }
        }
    }

    /// Feed buffered backlog items into the program until it can accept no more of what's
    /// available, alternating sides by `left_bias` under `AwaitBoth` so that neither side starves
    /// the other when both have backlog (§4.2.7).
    fn drain_backlogs(&mut self) {
        loop {
            self.settle_emits();
            let fed = match &self.program {
                MergeStep::AwaitL(_) => self.feed_one_left(),
                MergeStep::AwaitR(_) => self.feed_one_right(),
                MergeStep::AwaitBoth(_) => {
                    if self.left_bias {
                        self.feed_one_left() || self.feed_one_right()
                    } else {
                        self.feed_one_right() || self.feed_one_left()
                    }
                }
                MergeStep::Halt(_) | MergeStep::Emit(_, _) => false,
            };
            if !fed {
                return;
            }
        }
    }

    fn feed_one_left(&mut self) -> bool {
        let Some(item) = self.left_backlog.pop_front() else {
            return false;
        };
        let program = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
        self.program = feed_l(program, item);
        true
    }

    fn feed_one_right(&mut self) -> bool {
        let Some(item) = self.right_backlog.pop_front() else {
            return false;
        };
        let program = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
        self.program = feed_r(program, item);
        true
    }

    /// Run the interpretation loop (design §4.2.3) to the point it must suspend on an external
    /// event: ensure the side(s) the program now awaits are fetching, or kill both sides once the
    /// program has halted.
    fn settle(&mut self) {
        self.drain_backlogs();
        match &self.program {
            MergeStep::AwaitL(_) => {
                self.left_bias = false;
                self.ensure_left_fetching();
            }
            MergeStep::AwaitR(_) => {
                self.left_bias = true;
                self.ensure_right_fetching();
            }
            MergeStep::AwaitBoth(_) => {
                if self.left_bias {
                    self.ensure_left_fetching();
                    self.ensure_right_fetching();
                } else {
                    self.ensure_right_fetching();
                    self.ensure_left_fetching();
                }
                self.left_bias = !self.left_bias;
            }
            MergeStep::Halt(_) => {
                if self.left_halt_contrib.is_none() {
                    let contrib = self.left.done_cause().cloned().unwrap_or(Cause::End);
                    self.left_halt_contrib = Some(contrib);
                }
                if self.right_halt_contrib.is_none() {
                    let contrib = self.right.done_cause().cloned().unwrap_or(Cause::End);
                    self.right_halt_contrib = Some(contrib);
                }
                self.kill_left();
                self.kill_right();
            }
            MergeStep::Emit(_, _) => unreachable!("settle_emits leaves no Emit behind"),
        }
    }

    fn ensure_left_fetching(&mut self) {
        if !matches!(self.left, SideState::Idle(_)) {
            return;
        }
        let SideState::Idle(proc) = std::mem::replace(&mut self.left, SideState::Done(Cause::Kill)) else {
            unreachable!()
        };
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        self.left = SideState::Running(Some(interrupt_tx));
        let tx = self.tx.clone();
        self.strategy.spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    cause = interrupt_rx => Err(cause.unwrap_or(Cause::Kill)),
                    step = proc.step(Cause::End) => match step {
                        Step::Emit(chunk, next) => Ok((chunk, next)),
                        Step::Halt(cause) => Err(cause),
                    },
                };
                let _ = tx.send(SideMsg::ReadyL(result));
            }
            .instrument(tracing::trace_span!("wye::await_left")),
        );
    }

    fn ensure_right_fetching(&mut self) {
        if !matches!(self.right, SideState::Idle(_)) {
            return;
        }
        let SideState::Idle(proc) = std::mem::replace(&mut self.right, SideState::Done(Cause::Kill)) else {
            unreachable!()
        };
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        self.right = SideState::Running(Some(interrupt_tx));
        let tx = self.tx.clone();
        self.strategy.spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    cause = interrupt_rx => Err(cause.unwrap_or(Cause::Kill)),
                    step = proc.step(Cause::End) => match step {
                        Step::Emit(chunk, next) => Ok((chunk, next)),
                        Step::Halt(cause) => Err(cause),
                    },
                };
                let _ = tx.send(SideMsg::ReadyR(result));
            }
            .instrument(tracing::trace_span!("wye::await_right")),
        );
    }

    fn kill_left(&mut self) {
        match &mut self.left {
            SideState::Done(_) => {}
            SideState::Running(interrupt) => {
                if let Some(interrupt) = interrupt.take() {
                    let _ = interrupt.send(Cause::Kill);
                }
            }
            SideState::Idle(_) => {
                let SideState::Idle(proc) = std::mem::replace(&mut self.left, SideState::Running(None)) else {
                    unreachable!()
                };
                let tx = self.tx.clone();
                self.strategy.spawn(
                    async move {
                        let result = match proc.step(Cause::Kill).await {
                            Step::Halt(cause) => Err(cause),
                            // A process shouldn't emit after being asked to clean up, but if it
                            // does, give it exactly one more chance before giving up on it.
                            Step::Emit(_, next) => match next.step(Cause::Kill).await {
                                Step::Halt(cause) => Err(cause),
                                Step::Emit(_, _) => Err(Cause::Kill),
                            },
                        };
                        let _ = tx.send(SideMsg::ReadyL(result));
                    }
                    .instrument(tracing::trace_span!("wye::kill_left")),
                );
            }
        }
    }

    fn kill_right(&mut self) {
        match &mut self.right {
            SideState::Done(_) => {}
            SideState::Running(interrupt) => {
                if let Some(interrupt) = interrupt.take() {
                    let _ = interrupt.send(Cause::Kill);
                }
            }
            SideState::Idle(_) => {
                let SideState::Idle(proc) = std::mem::replace(&mut self.right, SideState::Running(None)) else {
                    unreachable!()
                };
                let tx = self.tx.clone();
                self.strategy.spawn(
                    async move {
                        let result = match proc.step(Cause::Kill).await {
                            Step::Halt(cause) => Err(cause),
                            Step::Emit(_, next) => match next.step(Cause::Kill).await {
                                Step::Halt(cause) => Err(cause),
                                Step::Emit(_, _) => Err(Cause::Kill),
                            },
                        };
                        let _ = tx.send(SideMsg::ReadyR(result));
                    }
                    .instrument(tracing::trace_span!("wye::kill_right")),
                );
            }
        }
    }

    fn on_ready_l(&mut self, result: SideResult<L, E>) {
        match result {
            Ok((chunk, next)) => {
                self.left = SideState::Idle(next);
                self.left_backlog.extend(chunk);
            }
            Err(cause) => {
                self.left = SideState::Done(cause.clone());
                let program = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
                self.program = disconnect_l(program, cause);
            }
        }
        self.settle();
        self.finalize_if_ready();
    }

    fn on_ready_r(&mut self, result: SideResult<R, E>) {
        match result {
            Ok((chunk, next)) => {
                self.right = SideState::Idle(next);
                self.right_backlog.extend(chunk);
            }
            Err(cause) => {
                self.right = SideState::Done(cause.clone());
                let program = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
                self.program = disconnect_r(program, cause);
            }
        }
        self.settle();
        self.finalize_if_ready();
    }

    /// Once the program has halted and both sides are `Done`, combine all three causes exactly
    /// once (§4.2.8). Uses each side's halt-time contribution rather than its eventual `Done`
    /// cause, so a side merely force-killed as cleanup after a graceful halt can't turn a clean
    /// `End` into a `Kill`.
    fn finalize_if_ready(&mut self) {
        if self.final_cause.is_some() || self.final_delivered {
            return;
        }
        if !matches!(self.program, MergeStep::Halt(_)) {
            return;
        }
        if !self.left.is_done() || !self.right.is_done() {
            return;
        }
        let program = std::mem::replace(&mut self.program, MergeStep::Halt(Cause::Kill));
        let MergeStep::Halt(program_cause) = program else {
            unreachable!()
        };
        let left_cause = self.left_halt_contrib.take().unwrap_or(Cause::Kill);
        let right_cause = self.right_halt_contrib.take().unwrap_or(Cause::Kill);
        let cause = caused_by(program_cause, caused_by(left_cause, right_cause));
        tracing::debug!(is_error = cause.is_error(), is_kill = cause.is_kill(), "wye terminated");
        self.final_cause = Some(cause);
    }

    fn on_get(&mut self, reply: oneshot::Sender<GetReply<O, E>>) {
        if let Some(chunk) = self.out_backlog.pop_front() {
            let _ = reply.send(GetReply::Chunk(chunk));
            return;
        }
        if let Some(cause) = self.final_cause.take() {
            self.final_delivered = true;
            let _ = reply.send(GetReply::Halt(cause));
            return;
        }
        self.pending_get = Some(reply);
    }

    fn try_deliver_pending(&mut self) {
        let Some(reply) = self.pending_get.take() else {
            return;
        };
        if let Some(chunk) = self.out_backlog.pop_front() {
            let _ = reply.send(GetReply::Chunk(chunk));
        } else if let Some(cause) = self.final_cause.take() {
            self.final_delivered = true;
            let _ = reply.send(GetReply::Halt(cause));
        } else {
            self.pending_get = Some(reply);
        }
    }

    fn on_down_done(&mut self) {
        self.consumer_gone = true;
        // Nobody is left to read a reply; drop it rather than let it block `is_drained` forever.
        self.pending_get = None;
        self.kill_left();
        self.kill_right();
    }

    fn is_drained(&self) -> bool {
        matches!(self.program, MergeStep::Halt(_))
            && self.left.is_done()
            && self.right.is_done()
            && self.out_backlog.is_empty()
            && self.pending_get.is_none()
            && (self.final_delivered || self.consumer_gone)
    }
}

async fn run<L, R, O, E, S>(
    pl: Process<L, E>,
    pr: Process<R, E>,
    program: MergeStep<L, R, O, E>,
    strategy: S,
    side_tx: UnboundedSender<SideMsg<L, R, E>>,
    mut side_rx: UnboundedReceiver<SideMsg<L, R, E>>,
    mut ctrl_rx: UnboundedReceiver<CtrlMsg<O, E>>,
) where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    E: Chain + Clone + Send + 'static,
    S: Strategy,
{
    let mut engine = Engine {
        program,
        left: SideState::Idle(pl),
        right: SideState::Idle(pr),
        left_backlog: VecDeque::new(),
        right_backlog: VecDeque::new(),
        out_backlog: VecDeque::new(),
        pending_get: None,
        final_cause: None,
        final_delivered: false,
        left_halt_contrib: None,
        right_halt_contrib: None,
        left_bias: true,
        tx: side_tx,
        strategy,
        consumer_gone: false,
    };
    engine.settle();
    engine.finalize_if_ready();
    let mut ctrl_open = true;
    loop {
        if engine.is_drained() {
            break;
        }
        tokio::select! {
            biased;
            msg = side_rx.recv() => {
                match msg {
                    Some(SideMsg::ReadyL(result)) => engine.on_ready_l(result),
                    Some(SideMsg::ReadyR(result)) => engine.on_ready_r(result),
                    // The engine always keeps a clone of `side_tx` alive (in `engine.tx`), so the
                    // channel only closes once the engine itself is dropped at function exit.
                    None => break,
                }
                engine.try_deliver_pending();
            }
            msg = ctrl_rx.recv(), if ctrl_open => {
                match msg {
                    Some(CtrlMsg::Get(reply)) => engine.on_get(reply),
                    Some(CtrlMsg::DownDone) => engine.on_down_done(),
                    // The handle's `Drop` posts `DownDone` before the sender drops, so reaching
                    // `None` here means the consumer is already gone with nothing left to ask for.
                    None => {
                        ctrl_open = false;
                        engine.on_down_done();
                    }
                }
                engine.try_deliver_pending();
            }
        }
    }
}

/// The output of [`wye`]: a `futures::Stream<Item = O>` handle. Once the stream has yielded `None`,
/// [`WyeHandle::into_cause`] recovers the terminal [`Cause`] (design §7 "User-visible behavior").
pub struct WyeHandle<O, E> {
    tx: UnboundedSender<CtrlMsg<O, E>>,
    pending: Option<oneshot::Receiver<GetReply<O, E>>>,
    items: std::vec::IntoIter<O>,
    cause: Option<Cause<E>>,
}

impl<O, E> WyeHandle<O, E> {
    /// The terminal cause, once the stream has been fully drained. Returns `None` if called before
    /// the stream yields its last item.
    pub fn into_cause(self) -> Option<Cause<E>> {
        self.cause
    }
}

impl<O, E> futures::Stream for WyeHandle<O, E>
where
    O: Send + 'static,
    E: Send + 'static,
{
    type Item = O;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<O>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.items.next() {
                return Poll::Ready(Some(item));
            }
            if this.cause.is_some() {
                return Poll::Ready(None);
            }
            if this.pending.is_none() {
                let (reply_tx, reply_rx) = oneshot::channel();
                if this.tx.send(CtrlMsg::Get(reply_tx)).is_err() {
                    this.cause = Some(Cause::Kill);
                    return Poll::Ready(None);
                }
                this.pending = Some(reply_rx);
            }
            let reply = this.pending.as_mut().expect("just ensured pending is Some");
            match Pin::new(reply).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(_)) => {
                    this.pending = None;
                    this.cause = Some(Cause::Kill);
                    return Poll::Ready(None);
                }
                Poll::Ready(Ok(GetReply::Chunk(chunk))) => {
                    this.pending = None;
                    this.items = chunk.into_vec().into_iter();
                }
                Poll::Ready(Ok(GetReply::Halt(cause))) => {
                    this.pending = None;
                    this.cause = Some(cause);
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<O, E> Drop for WyeHandle<O, E> {
    fn drop(&mut self) {
        let _ = self.tx.send(CtrlMsg::DownDone);
    }
}

/// Merge `pl` and `pr` into one output stream, driven by `program` (design §4.2.1).
pub fn wye<L, R, O, E, S>(pl: Process<L, E>, pr: Process<R, E>, program: MergeStep<L, R, O, E>, strategy: S) -> WyeHandle<O, E>
where
    L: Send + 'static,
    R: Send + 'static,
    O: Send + 'static,
    E: Chain + Clone + Send + 'static,
    S: Strategy,
{
    let (side_tx, side_rx) = unbounded_channel();
    let (ctrl_tx, ctrl_rx) = unbounded_channel();
    let handle = WyeHandle {
        tx: ctrl_tx,
        pending: None,
        items: Vec::new().into_iter(),
        cause: None,
    };
    let engine_task = strategy.spawn(run(pl, pr, program, strategy.clone(), side_tx, side_rx, ctrl_rx));
    // Mirrors `njoin`'s watchdog: the mailbox closing on its own (a panic, not a merge-level fault)
    // already surfaces to `WyeHandle` as a closed channel (treated as `Cause::Kill`, see
    // `poll_next`); this just gives that case a named, logged cause instead of a silent one.
    strategy.spawn(async move {
        if let Err(join_err) = engine_task.await {
            let err = MergeError::EngineTaskLost(join_err.to_string());
            tracing::warn!(%err, "wye mailbox task ended unexpectedly");
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cause::Cause;
    use crate::programs::{interrupt, merge, yip};
    use crate::step::testing::{failing_after, from_iter};
    use crate::strategy::TokioStrategy;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn yip_pairs_then_ends() {
        let pl = from_iter::<i32, String>(vec![1, 2, 3]);
        let pr = from_iter::<i32, String>(vec![10, 20]);
        let mut out = wye(pl, pr, yip(), TokioStrategy);
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        assert_eq!(items, vec![(1, 10), (2, 20)]);
        assert_matches!(out.into_cause(), Some(Cause::End));
        assert!(logs_contain("wye terminated"));
    }

    #[tokio::test]
    async fn merge_propagates_error_from_either_side() {
        let pl = from_iter::<i32, String>(vec![1, 2, 3]);
        let pr = failing_after::<i32, String>(vec![vec![]], "boom".to_string());
        let mut out = wye(pl, pr, merge(), TokioStrategy);
        while out.next().await.is_some() {}
        match out.into_cause() {
            Some(Cause::Error(e)) => assert!(e.contains("boom")),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_stops_right_on_true() {
        let pl = from_iter::<bool, String>(vec![false, false, true]);
        let pr = from_iter::<i32, String>(vec![1, 2, 3, 4, 5]);
        let mut out = wye(pl, pr, interrupt(), TokioStrategy);
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        assert!(items.len() <= 5);
        assert_matches!(out.into_cause(), Some(Cause::End) | Some(Cause::Kill));
    }

    #[tokio::test]
    async fn dropping_the_output_kills_both_sides() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let finalized: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let fl = finalized.clone();
        let fr = finalized.clone();
        let pl = Process::<i32, String>::new(move |cause: Cause<String>| {
            let fl = fl.clone();
            async move {
                if !cause.is_end() {
                    fl.fetch_add(1, Ordering::SeqCst);
                }
                Step::Emit(Chunk::from_vec(vec![1]), Process::halt(Cause::End))
            }
        });
        let pr = Process::<i32, String>::new(move |cause: Cause<String>| {
            let fr = fr.clone();
            async move {
                if !cause.is_end() {
                    fr.fetch_add(1, Ordering::SeqCst);
                }
                Step::Emit(Chunk::from_vec(vec![2]), Process::halt(Cause::End))
            }
        });
        let out = wye(pl, pr, yip(), TokioStrategy);
        drop(out);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
