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
use pull_core::Cause;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Latch;

use crate::channel::scoped_pull;
use crate::channel::Channel;

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Interrupt this channel when `trigger` completes: an in-progress
    /// pull is abandoned and the channel fails with an interrupt (or with
    /// the trigger's own failure).
    pub fn interrupt_when<Fut>(self, trigger: Fut) -> Self
    where
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let latch = Latch::new();
                let signal = latch.clone();
                child
                    .spawn(async move {
                        signal.set(trigger.await);
                    })
                    .await
                    .detach();
                let pull = self.into_pull(upstream, child).await?;
                Ok(Pull::new(InterruptWhenSource { pull, latch }))
            })
            .await
        })
    }
}

impl<OA, IA, ID> Channel<OA, (), IA, ID>
where
    OA: Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// End this channel cleanly when `trigger` completes. A pull that is
    /// already in flight is allowed to deliver first; a failing trigger
    /// fails the channel.
    pub fn halt_when<Fut>(self, trigger: Fut) -> Self
    where
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let latch = Latch::new();
                let signal = latch.clone();
                child
                    .spawn(async move {
                        signal.set(trigger.await);
                    })
                    .await
                    .detach();
                let pull = self.into_pull(upstream, child).await?;
                Ok(Pull::new(HaltWhenSource { pull, latch }))
            })
            .await
        })
    }
}

struct InterruptWhenSource<OA, OD> {
    pull: Pull<OA, OD>,
    latch: Latch,
}

impl<OA, OD> PullSource<OA, OD> for InterruptWhenSource<OA, OD>
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
            tokio::select! {
                biased;
                step = self.pull.next() => step,
                exit = self.latch.wait() => match exit {
                    Ok(()) => Step::Fail(Cause::Interrupt),
                    Err(cause) => Step::Fail(cause),
                },
            }
        })
    }
}

struct HaltWhenSource<OA> {
    pull: Pull<OA, ()>,
    latch: Latch,
}

impl<OA> PullSource<OA, ()> for HaltWhenSource<OA>
where
    OA: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, ()>>
    where
        OA: 'a,
        (): 'a,
    {
        Box::pin(async move {
            // The in-flight pull is preferred, so a ready chunk still
            // goes out before the halt is observed.
            tokio::select! {
                biased;
                step = self.pull.next() => step,
                exit = self.latch.wait() => match exit {
                    Ok(()) => Step::Halt(()),
                    Err(cause) => Step::Fail(cause),
                },
            }
        })
    }
}
