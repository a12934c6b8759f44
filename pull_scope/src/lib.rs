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

//! Scopes: trees of resource lifetimes with ordered finalization.
//!
//! A [`Scope`] owns an ordered stack of finalizers and closes exactly
//! once, running them in reverse insertion order with the observed exit.
//! Child scopes forked from a parent are closed when the parent closes,
//! unless they were already closed on their own. [`Task`]s are tokio
//! tasks tied to a scope so that closing the scope interrupts them.

mod close_on_cancel;
mod scope;
mod task;

pub use crate::close_on_cancel::CloseOnCancel;
pub use crate::scope::Scope;
pub use crate::task::Task;
