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
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use futures::future::BoxFuture;
use pull_core::Exit;
use slog::warn;
use slog::Logger;

use crate::task::Task;

type Finalizer = Box<dyn FnOnce(Exit<()>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

enum State {
    Open {
        finalizers: Vec<(u64, Finalizer)>,
        next_id: u64,
    },
    Closed {
        exit: Exit<()>,
    },
}

struct ParentLink {
    parent: Weak<Inner>,
    id: u64,
}

struct Inner {
    state: Mutex<State>,
    parent: Mutex<Option<ParentLink>>,
    logger: Logger,
}

/// A node in the tree of resource lifetimes.
///
/// The handle is cheap to clone; all clones refer to the same node.
/// Mutation (adding finalizers, forking, closing) is serialized per node,
/// and the lock is never held across a suspension point.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// A fresh root scope with a discard logger.
    pub fn root() -> Scope {
        Scope::root_with_logger(Logger::root(slog::Discard, slog::o!()))
    }

    /// A fresh root scope logging finalizer failures to `logger`.
    pub fn root_with_logger(logger: Logger) -> Scope {
        Scope {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Open {
                    finalizers: Vec::new(),
                    next_id: 0,
                }),
                parent: Mutex::new(None),
                logger,
            }),
        }
    }

    /// Whether this scope has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("lock poisoned"),
            State::Closed { .. }
        )
    }

    /// The exit this scope was closed with, if it is closed.
    pub fn exit(&self) -> Option<Exit<()>> {
        match &*self.inner.state.lock().expect("lock poisoned") {
            State::Open { .. } => None,
            State::Closed { exit } => Some(exit.clone()),
        }
    }

    /// The logger carried by this scope.
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Register a finalizer, or hand it back with the recorded exit when
    /// the scope is already closed.
    fn register(&self, finalizer: Finalizer) -> Result<u64, (Finalizer, Exit<()>)> {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        match &mut *state {
            State::Open {
                finalizers,
                next_id,
            } => {
                let id = *next_id;
                *next_id += 1;
                finalizers.push((id, finalizer));
                Ok(id)
            }
            State::Closed { exit } => Err((finalizer, exit.clone())),
        }
    }

    fn deregister(&self, id: u64) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        if let State::Open { finalizers, .. } = &mut *state {
            finalizers.retain(|(fid, _)| *fid != id);
        }
    }

    /// Push a finalizer onto this scope.
    ///
    /// Finalizers run in reverse insertion order when the scope closes and
    /// receive the exit the scope was closed with. On an already-closed
    /// scope the finalizer runs immediately with the recorded exit. A
    /// failing finalizer is logged and never interferes with the other
    /// finalizers.
    pub async fn add_finalizer<F, Fut>(&self, f: F)
    where
        F: FnOnce(Exit<()>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Finalizer =
            Box::new(move |exit| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(exit)) });
        if let Err((finalizer, exit)) = self.register(boxed) {
            if let Err(err) = finalizer(exit).await {
                warn!(self.inner.logger, "scope finalizer failed: {:#}", err);
            }
        }
    }

    /// Run an effect when this scope closes, ignoring the exit.
    pub async fn defer<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_finalizer(move |_exit| async move {
            fut.await;
            Ok(())
        })
        .await;
    }

    /// Close this scope with `exit`.
    ///
    /// The first close wins: finalizers run exactly once, in reverse
    /// insertion order, and later closes are no-ops.
    pub async fn close(&self, exit: Exit<()>) {
        let finalizers = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            let prior = std::mem::replace(
                &mut *state,
                State::Closed {
                    exit: exit.clone(),
                },
            );
            match prior {
                State::Open { finalizers, .. } => finalizers,
                State::Closed { exit: recorded } => {
                    *state = State::Closed { exit: recorded };
                    return;
                }
            }
        };
        for (_, finalizer) in finalizers.into_iter().rev() {
            if let Err(err) = finalizer(exit.clone()).await {
                warn!(self.inner.logger, "scope finalizer failed: {:#}", err);
            }
        }
        // Drop our entry in the parent so a long-lived parent does not
        // accumulate finalizers for children that already closed.
        let link = self.inner.parent.lock().expect("lock poisoned").take();
        if let Some(link) = link {
            if let Some(parent) = link.parent.upgrade() {
                Scope { inner: parent }.deregister(link.id);
            }
        }
    }

    /// Fork a child scope tied to this one.
    ///
    /// The child is registered as a finalizer on the parent: closing the
    /// parent closes the child with the parent's exit. The child may be
    /// closed independently first, in which case the parent close is a
    /// no-op for it. Forking from an already-closed parent returns a child
    /// that is closed with the recorded exit.
    pub async fn fork(&self) -> Scope {
        let child = Scope::root_with_logger(self.inner.logger.clone());
        let handle = child.clone();
        let finalizer: Finalizer =
            Box::new(move |exit| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(async move {
                    handle.close(exit).await;
                    Ok(())
                })
            });
        match self.register(finalizer) {
            Ok(id) => {
                *child.inner.parent.lock().expect("lock poisoned") = Some(ParentLink {
                    parent: Arc::downgrade(&self.inner),
                    id,
                });
            }
            Err((_, exit)) => child.close(exit).await,
        }
        child
    }

    /// Spawn a task whose lifetime is bound to this scope: closing the
    /// scope interrupts the task.
    pub async fn spawn<T, Fut>(&self, fut: Fut) -> Task<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let task = Task::spawn(fut);
        let abort = task.abort_handle();
        self.add_finalizer(move |_exit| async move {
            abort.abort();
            Ok(())
        })
        .await;
        task
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pull_core::Cause;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> BoxFuture<'static, anyhow::Result<()>>)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::clone(&log);
        let record = move |n: u32| -> BoxFuture<'static, anyhow::Result<()>> {
            let probe = Arc::clone(&probe);
            Box::pin(async move {
                probe.lock().expect("lock poisoned").push(n);
                Ok(())
            })
        };
        (log, record)
    }

    #[tokio::test]
    async fn finalizers_run_in_reverse_order() {
        let (log, record) = recorder();
        let scope = Scope::root();
        for n in 1..=3 {
            let fut = record(n);
            scope.add_finalizer(move |_| fut).await;
        }
        scope.close(Ok(())).await;
        assert_eq!(*log.lock().expect("lock poisoned"), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn close_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let scope = Scope::root();
        scope
            .add_finalizer(move |_| async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        scope.close(Ok(())).await;
        scope.close(Err(Cause::Interrupt)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_matches!(scope.exit(), Some(Ok(())));
    }

    #[tokio::test]
    async fn add_finalizer_after_close_runs_immediately_with_recorded_exit() {
        let scope = Scope::root();
        scope.close(Err(Cause::Interrupt)).await;

        let seen = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&seen);
        scope
            .add_finalizer(move |exit| async move {
                *probe.lock().expect("lock poisoned") = Some(exit);
                Ok(())
            })
            .await;
        assert_matches!(
            seen.lock().expect("lock poisoned").clone(),
            Some(Err(Cause::Interrupt))
        );
    }

    #[tokio::test]
    async fn closing_the_parent_closes_forked_children() {
        let (log, record) = recorder();
        let parent = Scope::root();
        let child = parent.fork().await;
        let fut = record(7);
        child.add_finalizer(move |_| fut).await;
        parent.close(Ok(())).await;
        assert!(child.is_closed());
        assert_eq!(*log.lock().expect("lock poisoned"), vec![7]);
    }

    #[tokio::test]
    async fn child_closed_early_is_skipped_by_the_parent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let parent = Scope::root();
        let child = parent.fork().await;
        child
            .add_finalizer(move |_| async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        child.close(Ok(())).await;
        parent.close(Ok(())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forking_a_closed_parent_yields_a_closed_child() {
        let parent = Scope::root();
        parent.close(Ok(())).await;
        let child = parent.fork().await;
        assert!(child.is_closed());
    }

    #[tokio::test]
    async fn closing_a_scope_interrupts_spawned_tasks() {
        let scope = Scope::root();
        let task = scope.spawn(futures::future::pending::<()>()).await;
        scope.close(Ok(())).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            assert_matches!(task.join().await, Err(Cause::Interrupt));
        })
        .await
        .expect("aborted task joins promptly");
    }

    #[tokio::test]
    async fn failing_finalizers_do_not_stop_the_others() {
        let (log, record) = recorder();
        let scope = Scope::root();
        let fut = record(1);
        scope.add_finalizer(move |_| fut).await;
        scope
            .add_finalizer(|_| async { Err(anyhow::anyhow!("finalizer broke")) })
            .await;
        scope.close(Ok(())).await;
        assert_eq!(*log.lock().expect("lock poisoned"), vec![1]);
    }
}
