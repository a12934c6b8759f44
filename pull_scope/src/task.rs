/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::future::Future;

use pull_core::Cause;
use pull_core::Exit;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;

/// A fiber: a tokio task with structured interruption.
///
/// Dropping an unjoined `Task` aborts it, so a task handle buried in a
/// torn-down queue or combinator cannot leak its fiber. Call
/// [`Task::detach`] to opt out.
pub struct Task<T> {
    handle: JoinHandle<T>,
    abort_on_drop: bool,
}

impl<T: Send + 'static> Task<T> {
    /// Spawn a future onto the runtime.
    pub fn spawn<Fut>(fut: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Task {
            handle: tokio::spawn(fut),
            abort_on_drop: true,
        }
    }

    /// A handle that can interrupt this task from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Interrupt the task.
    pub fn interrupt(&self) {
        self.handle.abort();
    }

    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Let the task keep running after this handle is dropped.
    pub fn detach(mut self) {
        self.abort_on_drop = false;
    }

    /// Wait for the task.
    ///
    /// Interruption surfaces as [`Cause::Interrupt`]; a panic in the task
    /// surfaces as a defect.
    pub async fn join(mut self) -> Exit<T> {
        let result = (&mut self.handle).await;
        self.abort_on_drop = false;
        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_cancelled() => Err(Cause::Interrupt),
            Err(err) => Err(Cause::die(anyhow::anyhow!("task panicked: {}", err))),
        }
    }
}

impl<T: Send + 'static> Task<Exit<T>> {
    /// Wait for a task whose output is itself an exit, flattening the two
    /// layers.
    pub async fn join_exit(self) -> Exit<T> {
        self.join().await.and_then(|exit| exit)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.abort_on_drop {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn join_returns_the_value() {
        let task = Task::spawn(async { 5 });
        assert_matches!(task.join().await, Ok(5));
    }

    #[tokio::test]
    async fn interrupt_surfaces_as_interrupt_cause() {
        let task = Task::spawn(futures::future::pending::<()>());
        task.interrupt();
        assert_matches!(task.join().await, Err(Cause::Interrupt));
    }

    #[tokio::test]
    async fn panic_surfaces_as_defect() {
        let task = Task::spawn(async { panic!("kaboom") });
        let cause = task.join().await.expect_err("panic propagates");
        assert!(cause.is_defect());
    }

    #[tokio::test]
    async fn dropping_aborts() {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (started2, finished2) = (Arc::clone(&started), Arc::clone(&finished));
        let task = Task::spawn(async move {
            started2.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            finished2.store(true, Ordering::SeqCst);
        });
        // Give the task a chance to start.
        tokio::task::yield_now().await;
        drop(task);
        tokio::task::yield_now().await;
        assert!(started.load(Ordering::SeqCst));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn join_exit_flattens() {
        let task = Task::spawn(async { Exit::Ok(3) });
        assert_matches!(task.join_exit().await, Ok(3));
    }
}
