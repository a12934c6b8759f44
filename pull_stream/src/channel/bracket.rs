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

use futures::future::BoxFuture;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_scope::Scope;

use crate::channel::Channel;

/// The bracket shared by every resourceful combinator: fork a child
/// scope, build a pull against it, and close the child with the pull's
/// own terminal exit.
///
/// The child is also registered on the parent, so a branch abandoned
/// before reaching its terminal is still finalized when the parent
/// closes. If building fails, the child is closed with that failure
/// immediately.
pub async fn scoped_pull<OA, OD, F, Fut>(scope: &Scope, build: F) -> Exit<Pull<OA, OD>>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Exit<Pull<OA, OD>>>,
{
    let child = scope.fork().await;
    match build(child.clone()).await {
        Ok(pull) => Ok(Pull::new(CloseOnTerminal {
            pull,
            scope: Some(child),
        })),
        Err(cause) => {
            child.close(Err(cause.clone())).await;
            Err(cause)
        }
    }
}

/// Wraps a pull so that the first terminal step closes the given scope
/// with the matching exit.
pub(crate) struct CloseOnTerminal<OA, OD> {
    pub(crate) pull: Pull<OA, OD>,
    pub(crate) scope: Option<Scope>,
}

impl<OA, OD> PullSource<OA, OD> for CloseOnTerminal<OA, OD>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, OD>>
    where
        OA: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            let step = self.pull.next().await;
            match &step {
                Step::Emit(_) => {}
                Step::Halt(_) => {
                    if let Some(scope) = self.scope.take() {
                        scope.close(Ok(())).await;
                    }
                }
                Step::Fail(cause) => {
                    if let Some(scope) = self.scope.take() {
                        scope.close(Err(cause.clone())).await;
                    }
                }
            }
            step
        })
    }
}

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Run `f` with this channel's own exit when its pull terminates,
    /// independent of when the surrounding scope eventually closes.
    pub fn on_exit<F, Fut>(self, f: F) -> Self
    where
        F: FnOnce(Exit<()>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                child
                    .add_finalizer(move |exit| async move {
                        f(exit).await;
                        Ok(())
                    })
                    .await;
                self.into_pull(upstream, child).await
            })
            .await
        })
    }

    /// Run an effect when this channel terminates, whatever the exit.
    pub fn ensuring<Fut>(self, effect: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_exit(move |_exit| effect)
    }
}
