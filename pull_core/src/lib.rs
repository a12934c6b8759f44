/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

#![warn(missing_docs)]

//! The pull protocol: one-step lazy producers over three disjoint outcomes.
//!
//! A [`Pull`] is a lazy, restartable computation that yields at most one
//! outcome per invocation: one more value ([`Step::Emit`]), a stream-level
//! failure ([`Step::Fail`]), or normal termination with a done value
//! ([`Step::Halt`]). Once a pull halts it stays halted: the first halt is
//! memoized and replayed on every later invocation.
//!
//! Elements travel in [`Chunk`]s, non-empty batches that keep "has data"
//! and "non-empty array" equivalent throughout the engine.

mod cause;
mod chunk;
mod pull;
mod step;

pub use crate::cause::unit_exit;
pub use crate::cause::Cause;
pub use crate::cause::Exit;
pub use crate::cause::SharedError;
pub use crate::chunk::Chunk;
pub use crate::pull::halt_void;
pub use crate::pull::Pull;
pub use crate::pull::PullSource;
pub use crate::pull::SharedPull;
pub use crate::step::Step;
