/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use crate::cause::Cause;
use crate::cause::Exit;

/// The outcome of one pull invocation: exactly one of three disjoint
/// channels.
///
/// A halt is normal termination and carries the producer's done value. It
/// is not an element and it is not a cause, so error combinators pass it
/// through unmodified; consuming a halt is a pattern match on
/// [`Step::Halt`].
#[derive(Debug)]
pub enum Step<A, D = ()> {
    /// One more value is available.
    Emit(A),
    /// Normal termination with a done value.
    Halt(D),
    /// Abnormal termination.
    Fail(Cause),
}

impl<A, D> Step<A, D> {
    /// A failing step.
    pub fn fail(err: impl Into<anyhow::Error>) -> Self {
        Step::Fail(Cause::fail(err))
    }

    /// A step carrying a defect.
    pub fn die(err: impl Into<anyhow::Error>) -> Self {
        Step::Fail(Cause::die(err))
    }

    /// An interrupted step.
    pub fn interrupt() -> Self {
        Step::Fail(Cause::Interrupt)
    }

    /// Lift an effect result into a step.
    pub fn from_exit(exit: Exit<A>) -> Self {
        match exit {
            Ok(value) => Step::Emit(value),
            Err(cause) => Step::Fail(cause),
        }
    }

    /// Apply a function to the emitted value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Step<B, D> {
        match self {
            Step::Emit(value) => Step::Emit(f(value)),
            Step::Halt(done) => Step::Halt(done),
            Step::Fail(cause) => Step::Fail(cause),
        }
    }

    /// Apply a function to the done value.
    pub fn map_halt<D2>(self, f: impl FnOnce(D) -> D2) -> Step<A, D2> {
        match self {
            Step::Emit(value) => Step::Emit(value),
            Step::Halt(done) => Step::Halt(f(done)),
            Step::Fail(cause) => Step::Fail(cause),
        }
    }

    /// True for [`Step::Emit`].
    pub fn is_emit(&self) -> bool {
        matches!(self, Step::Emit(_))
    }

    /// True for [`Step::Halt`].
    pub fn is_halt(&self) -> bool {
        matches!(self, Step::Halt(_))
    }

    /// True for [`Step::Fail`].
    pub fn is_fail(&self) -> bool {
        matches!(self, Step::Fail(_))
    }

    /// The emitted value, if any.
    pub fn into_emit(self) -> Option<A> {
        match self {
            Step::Emit(value) => Some(value),
            _ => None,
        }
    }

    /// The done value, if this is a halt.
    pub fn into_halt(self) -> Option<D> {
        match self {
            Step::Halt(done) => Some(done),
            _ => None,
        }
    }

    /// The cause, if this is a failure.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Step::Fail(cause) => Some(cause),
            _ => None,
        }
    }

    /// The terminal exit of this step: a halt maps to success, a failure
    /// to its cause, an emit to `None`.
    pub fn terminal_exit(self) -> Option<Exit<D>> {
        match self {
            Step::Emit(_) => None,
            Step::Halt(done) => Some(Ok(done)),
            Step::Fail(cause) => Some(Err(cause)),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn map_leaves_terminals_alone() {
        assert_matches!(Step::<u32, ()>::Emit(2).map(|a| a * 2), Step::Emit(4));
        assert_matches!(Step::<u32, u32>::Halt(7).map(|a| a * 2), Step::Halt(7));
        assert_matches!(
            Step::<u32, ()>::interrupt().map(|a| a * 2),
            Step::Fail(Cause::Interrupt)
        );
    }

    #[test]
    fn terminal_exit_distinguishes_halt_and_fail() {
        assert_matches!(Step::<u32, u32>::Halt(3).terminal_exit(), Some(Ok(3)));
        assert_matches!(
            Step::<u32, u32>::interrupt().terminal_exit(),
            Some(Err(Cause::Interrupt))
        );
        assert_matches!(Step::<u32, u32>::Emit(1).terminal_exit(), None);
    }
}
