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

//! Channels, streams and sinks: a pull-based, chunked, effectful dataflow
//! engine.
//!
//! A [`Channel`] describes a producer or transducer as a *transform*: a
//! closure from an upstream pull and a scope to a downstream pull.
//! Constructors and combinators only build closures; nothing runs until a
//! `run_*` method drives the pull loop against a fresh root scope, and
//! every forked branch of a pipeline finalizes its own resources exactly
//! once regardless of how it terminates.
//!
//! A [`Stream`] is a channel specialized to non-empty chunks of elements
//! with a unit done value, and a [`Sink`] is the dual: a consumer that
//! produces one result plus at most one chunk of leftover input.

pub mod backoff;
mod channel;
mod sink;
mod stdio;
mod stream;
#[cfg(test)]
mod tests;

pub use crate::channel::CallbackOptions;
pub use crate::channel::Channel;
pub use crate::channel::FlatMapOptions;
pub use crate::channel::HaltStrategy;
pub use crate::channel::MapEffectOptions;
pub use crate::channel::MergeAllOptions;
pub use crate::channel::MergeOptions;
pub use crate::sink::End;
pub use crate::sink::Sink;
pub use crate::stdio::stdio;
pub use crate::stdio::Stdio;
pub use crate::stream::GroupByOptions;
pub use crate::stream::Share;
pub use crate::stream::ShareOptions;
pub use crate::stream::Stream;
pub use crate::stream::ThrottleOptions;
pub use crate::stream::ThrottleStrategy;

/// Default number of elements batched into one chunk by chunking
/// constructors.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default buffer size of the shared queue behind `merge` / `merge_all`.
pub const DEFAULT_MERGE_BUFFER: usize = 16;

/// Default per-key buffer size of `group_by`.
pub const DEFAULT_GROUP_BUFFER: usize = 4096;
