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

//! `njoin`: merge a dynamic, potentially unbounded stream of inner streams into one output,
//! bounded by caller limits on open inners and buffered output.
//!
//! Like [`crate::wye`], this is a single-consumer mailbox task (design §4.3), but unlike `wye` it
//! has only one upstream "side" (the outer source of inner streams) instead of two, so there is
//! no merge program to interpret — the engine's own logic plays that role directly. Data does not
//! flow back through the mailbox at all: inners enqueue straight into a shared [`crate::queue::Queue`],
//! and [`NjoinHandle`] dequeues from a clone of that same queue, bypassing the mailbox for the hot
//! path the way the host library keeps bulk data off its control-plane channels.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::Instrument;

use crate::cause::Cause;
use crate::error::MergeError;
use crate::queue::{bounded, Queue};
use crate::signal::{done_signal, DoneReason, DoneSignal, DoneWatch};
use crate::step::{Chunk, Process, Step};
use crate::strategy::Strategy;

type OuterResult<A, E> = Result<(Chunk<Process<A, E>>, Process<Process<A, E>, E>), Cause<E>>;

enum NjoinMsg<A, E> {
    /// An outer fetch returned a batch of inner streams plus the outer's continuation, or the
    /// outer's terminal cause. Chunked, unlike the design doc's one-`Offer`-per-item framing,
    /// because every other fetch in this crate already hands over a whole [`Chunk`] at a time —
    /// see `drain_outer_backlog` for the per-item dispatch this unpacks into.
    OuterReady(OuterResult<A, E>),
    /// One inner stream ran to completion. `Ok(())` covers `End`/`Kill`; `Err` carries its `Error`.
    Finished(Result<(), Cause<E>>),
    /// The consumer dropped the output stream.
    FinishedDown,
}

/// The outer source's fetch state. Collapses the design's four-state `Starting | Fetching |
/// Backoff(next) | Done(cause)` into the same three-state shape [`crate::wye`] uses for its sides:
/// `Backoff` is just `Idle` while the open-count cap holds `ensure_outer_fetching` back, so it
/// needs no variant of its own (see DESIGN.md).
enum OuterState<A, E> {
    Idle(Process<Process<A, E>, E>),
    Running,
    Done(Cause<E>),
}

struct Engine<A, E, S> {
    outer: OuterState<A, E>,
    /// Inner streams fetched but not yet launched because `open_count` was at `max_open`.
    outer_backlog: VecDeque<Process<A, E>>,
    open_count: usize,
    max_open: usize,
    queue: Queue<A, E>,
    done: DoneSignal,
    done_watch: DoneWatch,
    tx: UnboundedSender<NjoinMsg<A, E>>,
    strategy: S,
}

impl<A, E, S> Engine<A, E, S>
where
    A: Send + 'static,
    E: Send + 'static,
    S: Strategy,
{
    fn ensure_outer_fetching(&mut self) {
        if !matches!(self.outer, OuterState::Idle(_)) {
            return;
        }
        if self.max_open != 0 && self.open_count >= self.max_open {
            return;
        }
        let OuterState::Idle(proc) = std::mem::replace(&mut self.outer, OuterState::Running) else {
            unreachable!()
        };
        let tx = self.tx.clone();
        let mut done_watch = self.done_watch.clone();
        self.strategy.spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = done_watch.wait() => Err(Cause::Kill),
                    step = proc.step(Cause::End) => match step {
                        Step::Emit(chunk, next) => Ok((chunk, next)),
                        Step::Halt(cause) => Err(cause),
                    },
                };
                let _ = tx.send(NjoinMsg::OuterReady(result));
            }
            .instrument(tracing::trace_span!("njoin::outer_poll")),
        );
    }

    /// Launch as many backlogged inners as `max_open` allows; once the backlog is drained, resume
    /// fetching the outer for more (§4.3.3).
    fn drain_outer_backlog(&mut self) {
        while self.max_open == 0 || self.open_count < self.max_open {
            let Some(inner) = self.outer_backlog.pop_front() else {
                break;
            };
            self.launch_inner(inner);
        }
        if self.outer_backlog.is_empty() {
            self.ensure_outer_fetching();
        }
    }

    fn launch_inner(&mut self, inner: Process<A, E>) {
        self.open_count += 1;
        let tx = self.tx.clone();
        let queue = self.queue.clone();
        let mut done_watch = self.done_watch.clone();
        self.strategy.spawn(
            async move {
                let mut proc = inner;
                loop {
                    let stepped = tokio::select! {
                        biased;
                        _ = done_watch.wait() => Step::Halt(Cause::Kill),
                        step = proc.step(Cause::End) => step,
                    };
                    match stepped {
                        Step::Emit(chunk, next) => {
                            for item in chunk {
                                queue.enqueue(item).await;
                            }
                            proc = next;
                        }
                        Step::Halt(cause) => {
                            let result = if cause.is_error() { Err(cause) } else { Ok(()) };
                            let _ = tx.send(NjoinMsg::Finished(result));
                            return;
                        }
                    }
                }
            }
            .instrument(tracing::trace_span!("njoin::inner_poll")),
        );
    }

    fn kill_outer(&mut self) {
        if !matches!(self.outer, OuterState::Idle(_)) {
            // `Running` is already racing `done_watch` and will post `OuterReady(Err(Kill))` on
            // its own; `Done` has nothing left to kill.
            return;
        }
        let OuterState::Idle(proc) = std::mem::replace(&mut self.outer, OuterState::Running) else {
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
                let _ = tx.send(NjoinMsg::OuterReady(result));
            }
            .instrument(tracing::trace_span!("njoin::kill_outer")),
        );
    }

    /// Fatal shutdown path (§4.3.5): raise `done` so every running inner stops at its next
    /// suspension, fail the queue with the same cause, kill the outer, and drop any inner streams
    /// still waiting in the backlog — they were never stepped, so they need no finalizer.
    fn shutdown(&mut self, cause: Cause<E>) {
        let reason = if cause.is_error() { DoneReason::Error } else { DoneReason::Kill };
        self.done.raise(reason);
        self.outer_backlog.clear();
        self.queue.fail_with_cause(cause);
        self.kill_outer();
    }

    fn maybe_close_on_outer_end(&mut self) {
        if self.open_count == 0 && self.outer_backlog.is_empty() {
            self.queue.fail_with_cause(Cause::End);
        }
    }

    fn on_outer_ready(&mut self, result: OuterResult<A, E>) {
        match result {
            Ok((chunk, next)) => {
                self.outer = OuterState::Idle(next);
                self.outer_backlog.extend(chunk);
                self.drain_outer_backlog();
            }
            Err(cause) if cause.is_end() => {
                self.outer = OuterState::Done(cause);
                self.maybe_close_on_outer_end();
            }
            Err(cause) => {
                self.outer = OuterState::Done(Cause::Kill);
                self.shutdown(cause);
            }
        }
    }

    fn on_finished(&mut self, result: Result<(), Cause<E>>) {
        self.open_count -= 1;
        match result {
            Ok(()) => {
                self.drain_outer_backlog();
                if matches!(&self.outer, OuterState::Done(c) if c.is_end()) {
                    self.maybe_close_on_outer_end();
                }
            }
            Err(cause) => self.shutdown(cause),
        }
    }

    fn is_drained(&self) -> bool {
        matches!(self.outer, OuterState::Done(_)) && self.open_count == 0 && self.outer_backlog.is_empty()
    }
}

async fn run<A, E, S>(
    max_open: usize,
    source: Process<Process<A, E>, E>,
    queue: Queue<A, E>,
    done: DoneSignal,
    done_watch: DoneWatch,
    strategy: S,
    tx: UnboundedSender<NjoinMsg<A, E>>,
    mut rx: UnboundedReceiver<NjoinMsg<A, E>>,
) where
    A: Send + 'static,
    E: Send + 'static,
    S: Strategy,
{
    let mut engine = Engine {
        outer: OuterState::Idle(source),
        outer_backlog: VecDeque::new(),
        open_count: 0,
        max_open,
        queue,
        done,
        done_watch,
        tx,
        strategy,
    };
    engine.drain_outer_backlog();
    loop {
        if engine.is_drained() {
            tracing::debug!("njoin terminated");
            break;
        }
        let Some(msg) = rx.recv().await else { break };
        match msg {
            NjoinMsg::OuterReady(result) => engine.on_outer_ready(result),
            NjoinMsg::Finished(result) => engine.on_finished(result),
            NjoinMsg::FinishedDown => engine.shutdown(Cause::Kill),
        }
    }
}

/// The output of [`njoin`]: a `futures::Stream<Item = A>` handle backed directly by the engine's
/// output queue. [`NjoinHandle::into_cause`] recovers the terminal cause once the stream ends.
pub struct NjoinHandle<A, E> {
    queue: Queue<A, E>,
    tx: UnboundedSender<NjoinMsg<A, E>>,
    pending: Option<Pin<Box<dyn Future<Output = Result<A, Cause<E>>> + Send>>>,
    cause: Option<Cause<E>>,
}

impl<A, E> NjoinHandle<A, E> {
    /// The terminal cause, once the stream has been fully drained. Returns `None` if called
    /// before the stream yields its last item.
    pub fn into_cause(self) -> Option<Cause<E>> {
        self.cause
    }
}

impl<A, E> futures::Stream for NjoinHandle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    type Item = A;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<A>> {
        let this = self.get_mut();
        if this.cause.is_some() {
            return Poll::Ready(None);
        }
        if this.pending.is_none() {
            let queue = this.queue.clone();
            this.pending = Some(Box::pin(async move { queue.dequeue().await }));
        }
        let fut = this.pending.as_mut().expect("just ensured pending is Some");
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(item)) => {
                this.pending = None;
                Poll::Ready(Some(item))
            }
            Poll::Ready(Err(cause)) => {
                this.pending = None;
                this.cause = Some(cause);
                Poll::Ready(None)
            }
        }
    }
}

impl<A, E> Drop for NjoinHandle<A, E> {
    fn drop(&mut self) {
        let _ = self.tx.send(NjoinMsg::FinishedDown);
    }
}

/// Merge every inner stream `source` produces into one output stream (design §4.3.1). `max_open`
/// caps concurrently running inners (`0` = unbounded); `max_queued` caps buffered output elements
/// (`0` = unbounded).
pub fn njoin<A, E, S>(max_open: usize, max_queued: usize, source: Process<Process<A, E>, E>, strategy: S) -> NjoinHandle<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
    S: Strategy,
{
    let (tx, rx) = unbounded_channel();
    let queue = bounded(max_queued);
    let (done, done_watch) = done_signal();
    let handle = NjoinHandle {
        queue: queue.clone(),
        tx: tx.clone(),
        pending: None,
        cause: None,
    };
    let engine_task = strategy.spawn(run(max_open, source, queue.clone(), done, done_watch, strategy.clone(), tx, rx));
    // If the mailbox task itself panics (a bug, not a merge-level fault), nothing would otherwise
    // ever fail the queue and `NjoinHandle::poll_next` would hang forever. Watch the task and, on
    // an abnormal exit, surface it as `MergeError::EngineTaskLost` and fail the queue with `Kill` so
    // the consumer still observes termination.
    strategy.spawn(async move {
        if let Err(join_err) = engine_task.await {
            let err = MergeError::EngineTaskLost(join_err.to_string());
            tracing::warn!(%err, "njoin mailbox task ended unexpectedly");
            queue.fail_with_cause(Cause::Kill);
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::step::testing::from_iter;
    use crate::strategy::TokioStrategy;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn merges_elements_from_every_inner() {
        let inners = vec![
            from_iter::<i32, String>(vec![1, 2, 3]),
            from_iter::<i32, String>(vec![10, 20]),
        ];
        let source = from_iter::<Process<i32, String>, String>(inners);
        let mut out = njoin(0, 0, source, TokioStrategy);
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        items.sort();
        assert_eq!(items, vec![1, 2, 3, 10, 20]);
        assert_matches!(out.into_cause(), Some(Cause::End));
        assert!(logs_contain("njoin terminated"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_exceeds_max_open_concurrent_inners() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        fn slow_inner(running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>, value: i32) -> Process<i32, String> {
            Process::new(move |_cause: Cause<String>| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Step::Emit(Chunk::from_vec(vec![value]), Process::halt(Cause::End))
            })
        }

        let inners = (0..6).map(|i| slow_inner(running.clone(), peak.clone(), i)).collect::<Vec<_>>();
        let source = from_iter::<Process<i32, String>, String>(inners);
        let out = njoin(2, 0, source, TokioStrategy);
        let items: Vec<i32> = out.collect().await;
        assert_eq!(items.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn an_inner_error_terminates_the_whole_merge() {
        let inners = vec![
            from_iter::<i32, String>(vec![1, 2, 3]),
            crate::step::testing::failing_after::<i32, String>(vec![vec![]], "boom".to_string()),
        ];
        let source = from_iter::<Process<i32, String>, String>(inners);
        let mut out = njoin(0, 0, source, TokioStrategy);
        while out.next().await.is_some() {}
        match out.into_cause() {
            Some(Cause::Error(e)) => assert_eq!(e, "boom"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_the_output_stops_inners() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = finalized.clone();
        let inner = Process::<i32, String>::new(move |_cause: Cause<String>| async move {
            f.fetch_add(1, Ordering::SeqCst);
            Step::Emit(Chunk::from_vec(vec![1]), Process::halt(Cause::End))
        });
        let source = from_iter::<Process<i32, String>, String>(vec![inner]);
        let out = njoin(0, 0, source, TokioStrategy);
        drop(out);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
