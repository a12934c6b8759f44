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

use pull_core::unit_exit;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::SharedPull;
use pull_core::Step;
use pull_queue::PubSub;
use pull_queue::Queue;
use pull_scope::CloseOnCancel;
use pull_scope::Scope;

use crate::channel::Channel;

/// Drive `work` against `scope`, closing the scope exactly once with the
/// observed exit: the work's own result on completion, or an interrupt if
/// the driving future is dropped mid-flight.
pub(crate) async fn drive<T, Fut>(scope: Scope, work: Fut) -> Exit<T>
where
    Fut: Future<Output = Exit<T>>,
{
    let result = CloseOnCancel::new(work, scope.clone()).await;
    scope.close(unit_exit(&result)).await;
    result
}

impl<OA, OD> Channel<OA, OD>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
{
    /// Run the channel, folding every output into an accumulator.
    pub async fn run_fold<S, F>(self, init: S, mut f: F) -> Exit<S>
    where
        S: Send + 'static,
        F: FnMut(S, OA) -> S + Send,
    {
        let scope = Scope::root();
        let work = {
            let scope = scope.clone();
            async move {
                let mut pull = self.into_pull(Pull::halt(()), scope).await?;
                let mut acc = init;
                loop {
                    match pull.next().await {
                        Step::Emit(value) => acc = f(acc, value),
                        Step::Halt(_) => return Ok(acc),
                        Step::Fail(cause) => return Err(cause),
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the channel, collecting every output.
    pub async fn run_collect(self) -> Exit<Vec<OA>> {
        self.run_fold(Vec::new(), |mut acc, value| {
            acc.push(value);
            acc
        })
        .await
    }

    /// Run the channel, counting its outputs.
    pub async fn run_count(self) -> Exit<usize> {
        self.run_fold(0usize, |acc, _| acc + 1).await
    }

    /// Run the channel for its terminal value, discarding outputs.
    pub async fn run_drain(self) -> Exit<OD> {
        let scope = Scope::root();
        let work = {
            let scope = scope.clone();
            async move {
                let mut pull = self.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(_) => {}
                        Step::Halt(done) => return Ok(done),
                        Step::Fail(cause) => return Err(cause),
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the channel, binding an effect to every output.
    pub async fn run_for_each<F, Fut>(self, mut f: F) -> Exit<OD>
    where
        F: FnMut(OA) -> Fut + Send,
        Fut: Future<Output = Exit<()>> + Send,
    {
        let scope = Scope::root();
        let work = {
            let scope = scope.clone();
            async move {
                let mut pull = self.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(value) => f(value).await?,
                        Step::Halt(done) => return Ok(done),
                        Step::Fail(cause) => return Err(cause),
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the channel, offering every output to a queue. The queue ends
    /// with the channel's terminal.
    pub async fn run_into_queue(self, queue: Queue<OA, OD>) -> Exit<()> {
        let scope = Scope::root();
        let work = {
            let scope = scope.clone();
            let queue = queue.clone();
            async move {
                let mut pull = self.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(value) => {
                            if !queue.offer(value).await {
                                return Ok(());
                            }
                        }
                        Step::Halt(done) => {
                            queue.end(done);
                            return Ok(());
                        }
                        Step::Fail(cause) => {
                            queue.fail_cause(cause.clone());
                            return Err(cause);
                        }
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the channel, publishing every output to a pubsub. The pubsub
    /// is marked done with the channel's terminal exit.
    pub async fn run_into_pubsub(self, pubsub: PubSub<OA>) -> Exit<()>
    where
        OA: Clone,
    {
        let scope = Scope::root();
        let work = {
            let scope = scope.clone();
            let pubsub = pubsub.clone();
            async move {
                let mut pull = self.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(value) => {
                            if !pubsub.publish(value).await {
                                return Ok(());
                            }
                        }
                        Step::Halt(_) => {
                            pubsub.done(Ok(()));
                            return Ok(());
                        }
                        Step::Fail(cause) => {
                            pubsub.done(Err(cause.clone()));
                            return Err(cause);
                        }
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Produce this channel's pull against the given scope without
    /// driving it, shared behind a one-permit mutex so external code can
    /// pace emission.
    pub async fn into_shared_pull(self, scope: &Scope) -> Exit<SharedPull<OA, OD>> {
        Ok(self.into_pull(Pull::halt(()), scope.clone()).await?.shared())
    }
}
