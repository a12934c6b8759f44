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
use std::pin::Pin;

use futures::ready;
use futures::task::Context;
use futures::task::Poll;
use pin_project::pin_project;
use pin_project::pinned_drop;
use pull_core::Cause;

use crate::scope::Scope;

/// Future combinator that closes a scope with an interrupt exit if the
/// inner future is cancelled (dropped before completion).
///
/// Run loops wrap their pull loop in this so that interrupting the
/// driving fiber still runs every finalizer registered against the root
/// scope. The close runs on a freshly spawned task because `Drop` cannot
/// await.
#[pin_project(PinnedDrop)]
pub struct CloseOnCancel<Fut> {
    #[pin]
    inner: Fut,

    scope: Option<Scope>,
}

impl<Fut> CloseOnCancel<Fut>
where
    Fut: Future,
{
    /// Construct a `CloseOnCancel` combinator that will close `scope` if
    /// `inner` is cancelled.
    pub fn new(inner: Fut, scope: Scope) -> Self {
        Self {
            inner,
            scope: Some(scope),
        }
    }
}

impl<Fut> Future for CloseOnCancel<Fut>
where
    Fut: Future,
{
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let v = ready!(this.inner.poll(cx));
        *this.scope = None;
        Poll::Ready(v)
    }
}

#[pinned_drop]
impl<Fut> PinnedDrop for CloseOnCancel<Fut> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(scope) = this.scope.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    scope.close(Err(Cause::Interrupt)).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pull_core::Exit;

    use super::*;

    #[tokio::test]
    async fn closes_with_interrupt_when_cancelled() {
        let scope = Scope::root();
        let seen: Arc<Mutex<Option<Exit<()>>>> = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&seen);
        scope
            .add_finalizer(move |exit| async move {
                *probe.lock().expect("lock poisoned") = Some(exit);
                Ok(())
            })
            .await;

        let fut = CloseOnCancel::new(futures::future::pending::<()>(), scope.clone());
        drop(fut);
        // The close runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scope.is_closed());
        assert_matches!(
            seen.lock().expect("lock poisoned").clone(),
            Some(Err(Cause::Interrupt))
        );
    }

    #[tokio::test]
    async fn does_not_close_when_complete() {
        let counter = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&counter);
        let scope = Scope::root();
        scope
            .add_finalizer(move |_| async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        CloseOnCancel::new(async {}, scope.clone()).await;
        assert!(!scope.is_closed());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
