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

//! Pluggable "spawn a unit of work" capability.
//!
//! The engines never call `tokio::spawn` directly; every fetch, kill, and inner-stream launch
//! goes through a [`Strategy`] so that a caller embedding this crate in a different runtime, or a
//! test wanting deterministic single-threaded scheduling, can swap the executor out from under
//! the merge core without touching engine logic.

use std::future::Future;

use tokio::task::JoinHandle;

/// Schedules side-effecting async work. Implementations must be stack-safe: spawned work runs on
/// its own task/stack rather than recursing into the caller's.
pub trait Strategy: Clone + Send + Sync + 'static {
    /// Spawn `fut`, returning a handle the caller may use to await or abort it.
    fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

/// The default [`Strategy`], backed by the ambient `tokio` runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioStrategy;

impl Strategy for TokioStrategy {
    fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_strategy_runs_spawned_work() {
        let strategy = TokioStrategy;
        let handle = strategy.spawn(async { 1 + 1 });
        assert_eq!(handle.await.unwrap(), 2);
    }
}
