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

//! The bounded output queue `njoin` buffers inner-stream elements into before the consumer pulls
//! them.
//!
//! A from-scratch, `Notify`-driven bounded MPSC buffer rather than `tokio::sync::mpsc`: `mpsc`'s
//! sender can't be "failed" with a terminal value after the fact (closing it loses the cause), and
//! `njoin` needs exactly that — every inner enqueues freely until the queue is full *or* a fatal
//! cause lands, at which point every future `enqueue`/`dequeue` observes that cause instead of
//! blocking. Built on `parking_lot::Mutex` + `tokio::sync::Notify`, the same low-level pairing the
//! host library reaches for in its own hand-rolled bounded buffers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cause::Cause;

struct Inner<T, E> {
    items: Mutex<VecDeque<T>>,
    /// `Some` once the queue has a terminal cause not yet handed out. Taken (not cloned) by the
    /// first `dequeue` that observes it — see module docs for why this crate never needs `E: Clone`
    /// here. `closed` stays `true` after the take so later polls still see a terminal result.
    cause: Mutex<Option<Cause<E>>>,
    closed: AtomicBool,
    /// Capacity 0 means unbounded.
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

/// A bounded, multi-producer, single-consumer queue with a terminal [`Cause`].
pub struct Queue<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Queue<T, E> {
    fn clone(&self) -> Self {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

/// Build a fresh queue. `capacity == 0` means unbounded: `enqueue` never suspends.
pub fn bounded<T, E>(capacity: usize) -> Queue<T, E> {
    Queue {
        inner: Arc::new(Inner {
            items: Mutex::new(VecDeque::new()),
            cause: Mutex::new(None),
            closed: AtomicBool::new(false),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }),
    }
}

impl<T, E> Queue<T, E> {
    /// Push `item`, suspending while the queue is at capacity. Once the queue has failed, returns
    /// immediately without enqueuing (the item is dropped — a producer racing a fatal shutdown has
    /// nothing useful left to do with it).
    pub async fn enqueue(&self, item: T) {
        let mut item = Some(item);
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return;
            }
            {
                let mut items = self.inner.items.lock();
                if self.inner.capacity == 0 || items.len() < self.inner.capacity {
                    items.push_back(item.take().expect("enqueue polled after completion"));
                    drop(items);
                    self.inner.not_empty.notify_one();
                    return;
                }
            }
            self.inner.not_full.notified().await;
        }
    }

    /// Pop the next item, suspending while the queue is empty. Once empty and failed, returns the
    /// terminal cause exactly once; any call after that synthesizes [`Cause::Kill`], since a
    /// well-behaved consumer never polls again after seeing a terminal value.
    pub async fn dequeue(&self) -> Result<T, Cause<E>> {
        loop {
            {
                let mut items = self.inner.items.lock();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.inner.not_full.notify_one();
                    return Ok(item);
                }
            }
            {
                let mut cause = self.inner.cause.lock();
                if let Some(c) = cause.take() {
                    return Err(c);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return Err(Cause::Kill);
                }
            }
            self.inner.not_empty.notified().await;
        }
    }

    /// Record the merge's terminal cause, waking any suspended `enqueue`/`dequeue`. First cause
    /// wins; a queue that already failed ignores later calls (mirrors [`crate::signal::DoneSignal`]
    /// sticky-`Error` semantics).
    pub fn fail_with_cause(&self, cause: Cause<E>) {
        let mut slot = self.inner.cause.lock();
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            *slot = Some(cause);
        }
        drop(slot);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dequeue_preserves_order() {
        let q: Queue<i32, String> = bounded(0);
        q.enqueue(1).await;
        q.enqueue(2).await;
        assert_eq!(q.dequeue().await.unwrap(), 1);
        assert_eq!(q.dequeue().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dequeue_on_empty_waits_for_enqueue() {
        let q: Queue<i32, String> = bounded(0);
        let q2 = q.clone();
        let reader = tokio::spawn(async move { q2.dequeue().await });
        tokio::task::yield_now().await;
        q.enqueue(42).await;
        assert_eq!(reader.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn bounded_enqueue_suspends_until_space_freed() {
        let q: Queue<i32, String> = bounded(1);
        q.enqueue(1).await;
        let q2 = q.clone();
        let writer = tokio::spawn(async move { q2.enqueue(2).await });
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());
        assert_eq!(q.dequeue().await.unwrap(), 1);
        writer.await.unwrap();
        assert_eq!(q.dequeue().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fail_with_cause_is_observed_once_then_drained() {
        let q: Queue<i32, String> = bounded(0);
        q.enqueue(1).await;
        q.fail_with_cause(Cause::Error("boom".to_string()));
        assert_eq!(q.dequeue().await.unwrap(), 1);
        match q.dequeue().await {
            Err(Cause::Error(e)) => assert_eq!(e, "boom"),
            Err(other) => panic!("expected Error, got {other}"),
            Ok(_) => panic!("expected Error, got an item"),
        }
    }
}
