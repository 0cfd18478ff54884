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

//! The `njoin` cancellation broadcast: a cheap, `Clone`-able "stop now" signal shared by every
//! running inner stream plus the outer source.
//!
//! Grounded on the host library's `tokio::sync::watch`-backed observer/catalog-version signals
//! (e.g. `ObserverManager`'s version watch): a single writer, many cheap readers, each of which can
//! either poll the current value or await the next change.

use tokio::sync::watch;

/// Why the signal was raised. Carries no error payload — inners only need to know *that* they
/// must stop, not *why*; the real `Cause::Error(e)` payload is recorded separately, on the queue
/// and on the engine's own terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Consumer cancellation or a healthy outer/inner completion path.
    Kill,
    /// A fatal error occurred somewhere in the merge.
    Error,
}

/// The write half, held by the `njoin` engine task only.
#[derive(Debug)]
pub struct DoneSignal {
    tx: watch::Sender<Option<DoneReason>>,
}

/// The read half, cloned into every running inner's spawned task.
#[derive(Debug, Clone)]
pub struct DoneWatch {
    rx: watch::Receiver<Option<DoneReason>>,
}

/// Construct a fresh, not-yet-done signal pair.
pub fn done_signal() -> (DoneSignal, DoneWatch) {
    let (tx, rx) = watch::channel(None);
    (DoneSignal { tx }, DoneWatch { rx })
}

impl DoneSignal {
    /// Raise the signal with `reason`, unless it has already been raised (first raise wins, as
    /// `Error` should never be demoted back to `Kill` by a later, merely-cancelled inner).
    pub fn raise(&self, reason: DoneReason) {
        self.tx.send_if_modified(|current| match current {
            Some(DoneReason::Error) => false,
            Some(DoneReason::Kill) if reason == DoneReason::Kill => false,
            _ => {
                *current = Some(reason);
                true
            }
        });
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl DoneWatch {
    /// Current value without waiting.
    pub fn peek(&self) -> Option<DoneReason> {
        *self.rx.borrow()
    }

    /// Resolve as soon as the signal is raised; resolves immediately if it already has been.
    /// Returns `Kill` if the write half was dropped without ever raising the signal (should not
    /// happen in practice: the engine task owns the write half for the merge's whole lifetime).
    pub async fn wait(&mut self) -> DoneReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return DoneReason::Kill;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_immediately_if_already_raised() {
        let (tx, mut rx) = done_signal();
        tx.raise(DoneReason::Kill);
        assert_eq!(rx.wait().await, DoneReason::Kill);
    }

    #[tokio::test]
    async fn error_is_sticky_over_a_later_kill() {
        let (tx, rx) = done_signal();
        tx.raise(DoneReason::Error);
        tx.raise(DoneReason::Kill);
        assert_eq!(rx.peek(), Some(DoneReason::Error));
    }

    #[tokio::test]
    async fn wait_blocks_until_raised() {
        let (tx, mut rx) = done_signal();
        assert!(rx.peek().is_none());
        let task = tokio::spawn(async move { rx.wait().await });
        tokio::task::yield_now().await;
        tx.raise(DoneReason::Kill);
        assert_eq!(task.await.unwrap(), DoneReason::Kill);
    }
}
