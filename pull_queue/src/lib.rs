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

//! Queues with completion signaling, and a PubSub layered on top.
//!
//! A [`Queue`] is a bounded or unbounded MPMC channel with a distinct
//! terminal state carrying an exit: once ended, readers drain the
//! remaining elements and then observe the terminal. Back-pressure
//! follows the queue's [`Strategy`]. Because [`Queue::take`] returns a
//! [`Step`](pull_core::Step), a queue is directly usable as a pull
//! source.

mod latch;
mod pubsub;
mod queue;

pub use crate::latch::Latch;
pub use crate::pubsub::PubSub;
pub use crate::pubsub::Subscription;
pub use crate::queue::Queue;
pub use crate::queue::Strategy;

use tokio::sync::Notify;

/// Wait until `check` produces a value, sleeping on `notify` in between.
///
/// Uses the enable-then-recheck discipline so a notification arriving
/// between the check and the await is never lost. State changes must wake
/// with `notify_waiters`.
pub(crate) async fn wait_on<T>(notify: &Notify, mut check: impl FnMut() -> Option<T>) -> T {
    let mut notified = std::pin::pin!(notify.notified());
    loop {
        if let Some(value) = check() {
            return value;
        }
        notified.as_mut().enable();
        if let Some(value) = check() {
            return value;
        }
        notified.as_mut().await;
        notified.set(notify.notified());
    }
}
