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

//! The termination algebra shared by `wye` and `njoin`.
//!
//! Every stream in this crate halts with a [`Cause`]: normal exhaustion (`End`), forced
//! cancellation (`Kill`), or failure (`Error`). The engines never throw out of band — every fault
//! becomes a `Cause` flowing through the same channel as normal termination.

use std::fmt;

/// Terminal reason carried by every stream halt.
///
/// A stream that has produced a terminal `Cause` must never produce elements thereafter; both
/// engines rely on this to decide when a side/inner is truly done.
#[derive(Debug)]
pub enum Cause<E> {
    /// Source exhausted normally.
    End,
    /// Forced cancellation: finalizers must still run, but no new work starts.
    Kill,
    /// An await or cleanup evaluation failed.
    Error(E),
}

impl<E> Cause<E> {
    pub fn is_end(&self) -> bool {
        matches!(self, Cause::End)
    }

    pub fn is_kill(&self) -> bool {
        matches!(self, Cause::Kill)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Cause::Error(_))
    }

    pub fn map_err<F, U>(self, f: F) -> Cause<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Cause::End => Cause::End,
            Cause::Kill => Cause::Kill,
            Cause::Error(e) => Cause::Error(f(e)),
        }
    }
}

impl<E: Clone> Clone for Cause<E> {
    fn clone(&self) -> Self {
        match self {
            Cause::End => Cause::End,
            Cause::Kill => Cause::Kill,
            Cause::Error(e) => Cause::Error(e.clone()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::End => write!(f, "end"),
            Cause::Kill => write!(f, "kill"),
            Cause::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Promote `End` to `Kill`; leave `Kill` and `Error` unchanged.
///
/// Used whenever a graceful shutdown (consumer cancellation, the other side of a `wye` dying)
/// needs to turn an otherwise-normal completion into an abrupt one.
pub fn kill<E>(c: Cause<E>) -> Cause<E> {
    match c {
        Cause::End => Cause::Kill,
        other => other,
    }
}

/// Payload types that can be folded together when two sides of a merge fail independently.
///
/// `caused_by` needs this only for the `Error`/`Error` case; `End` and `Kill` combine by the fixed
/// dominance rules below with no need to inspect the payload.
pub trait Chain: Sized {
    /// Fold two error payloads, recorded on two different sides, into one. No information may be
    /// dropped: implementations should retain both the original error and its companion.
    fn chain(self, other: Self) -> Self;
}

impl Chain for anyhow::Error {
    fn chain(self, other: Self) -> Self {
        self.context(other)
    }
}

impl Chain for String {
    fn chain(self, other: Self) -> Self {
        format!("{self}; and also: {other}")
    }
}

/// Combine two terminal causes into one.
///
/// Dominance: `Error` dominates non-`Error`. `Kill` dominates `End`. Two `Error`s fold into a
/// single `Error` via [`Chain::chain`] so no information is lost. `End` with `End` is `End`.
pub fn caused_by<E: Chain>(a: Cause<E>, b: Cause<E>) -> Cause<E> {
    use Cause::*;
    match (a, b) {
        (Error(e1), Error(e2)) => Error(e1.chain(e2)),
        (Error(e), _) | (_, Error(e)) => Error(e),
        (Kill, _) | (_, Kill) => Kill,
        (End, End) => End,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn kill_promotes_end_only() {
        assert!(kill::<String>(Cause::End).is_kill());
        assert!(kill::<String>(Cause::Kill).is_kill());
        assert_matches!(kill(Cause::Error("boom".to_string())), Cause::Error(e) if e == "boom");
    }

    #[test]
    fn caused_by_is_commutative_on_end_and_kill() {
        assert!(caused_by::<String>(Cause::End, Cause::End).is_end());
        assert!(caused_by::<String>(Cause::End, Cause::Kill).is_kill());
        assert!(caused_by::<String>(Cause::Kill, Cause::End).is_kill());
        assert!(caused_by::<String>(Cause::Kill, Cause::Kill).is_kill());
    }

    #[test]
    fn caused_by_error_dominates_and_chains() {
        let c = caused_by(Cause::End, Cause::Error("a".to_string()));
        assert_matches!(c, Cause::Error(ref e) if e == "a");

        let c = caused_by(
            Cause::Error("a".to_string()),
            Cause::Error("b".to_string()),
        );
        match c {
            Cause::Error(e) => {
                assert!(e.contains('a'));
                assert!(e.contains('b'));
            }
            _ => panic!("expected Error"),
        }
    }
}
