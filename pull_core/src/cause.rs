/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::fmt;
use std::sync::Arc;

/// A clonable, shareable error.
///
/// Terminal exits are observed by every consumer of a queue or a shared
/// pull, so the error inside a [`Cause`] must be clonable. `SharedError`
/// wraps an [`anyhow::Error`] in an [`Arc`] and forwards `Display`,
/// `Debug` and `source` to it.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    /// Wrap an error.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        SharedError(Arc::new(err.into()))
    }

    /// Attempt to downcast the underlying error to a concrete type.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<T>()
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(err: anyhow::Error) -> Self {
        SharedError::new(err)
    }
}

/// Why a pull, a queue, or a scope terminated abnormally.
///
/// Halts are deliberately *not* causes: normal termination is the
/// [`Halt`](crate::Step::Halt) arm of [`Step`](crate::Step), so failure
/// combinators pass halts through untouched and "catching a halt" is
/// ordinary pattern matching.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Cause {
    /// A failure raised by user code or a failing effect. Recoverable by
    /// the `catch*` combinators.
    #[error(transparent)]
    Fail(SharedError),
    /// A programming error. Never caught by `catch`; terminates the
    /// pipeline.
    #[error("defect: {0}")]
    Die(SharedError),
    /// The fiber driving the pipeline was interrupted.
    #[error("interrupted")]
    Interrupt,
}

impl Cause {
    /// A recoverable failure.
    pub fn fail(err: impl Into<anyhow::Error>) -> Self {
        Cause::Fail(SharedError::new(err))
    }

    /// An unrecoverable defect.
    pub fn die(err: impl Into<anyhow::Error>) -> Self {
        Cause::Die(SharedError::new(err))
    }

    /// True for [`Cause::Fail`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Cause::Fail(_))
    }

    /// True for [`Cause::Die`].
    pub fn is_defect(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    /// True for [`Cause::Interrupt`].
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Cause::Interrupt)
    }

    /// The recoverable failure, if this is one.
    pub fn failure(&self) -> Option<&SharedError> {
        match self {
            Cause::Fail(err) => Some(err),
            _ => None,
        }
    }

    /// The error carried by this cause, failure or defect.
    pub fn error(&self) -> Option<&SharedError> {
        match self {
            Cause::Fail(err) | Cause::Die(err) => Some(err),
            Cause::Interrupt => None,
        }
    }

    /// Downcast the carried error, failure or defect.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error().and_then(|err| err.downcast_ref::<T>())
    }

    /// Convert a failure into a defect, leaving defects and interrupts
    /// untouched.
    pub fn or_die(self) -> Self {
        match self {
            Cause::Fail(err) => Cause::Die(err),
            other => other,
        }
    }
}

/// The result of running a pipeline, an effect, or closing a scope.
pub type Exit<T> = Result<T, Cause>;

/// Forget the success value of an exit, keeping the cause.
///
/// Scopes close with `Exit<()>`; this adapts any run result into a scope
/// exit.
pub fn unit_exit<T>(exit: &Exit<T>) -> Exit<()> {
    match exit {
        Ok(_) => Ok(()),
        Err(cause) => Err(cause.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn downcast_recovers_typed_errors() {
        let cause = Cause::fail(Boom(7));
        assert_eq!(cause.downcast_ref::<Boom>(), Some(&Boom(7)));
        assert!(cause.downcast_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn or_die_only_promotes_failures() {
        assert!(Cause::fail(Boom(1)).or_die().is_defect());
        assert!(Cause::die(Boom(1)).or_die().is_defect());
        assert!(Cause::Interrupt.or_die().is_interrupt());
    }

    #[test]
    fn shared_error_display_matches_inner() {
        let cause = Cause::fail(Boom(3));
        assert_eq!(cause.to_string(), "boom 3");
    }

    #[test]
    fn clones_share_the_same_error() {
        let cause = Cause::fail(Boom(9));
        let copy = cause.clone();
        assert_eq!(copy.downcast_ref::<Boom>(), Some(&Boom(9)));
    }
}
