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

use futures::future::BoxFuture;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Task;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::channel::scoped_pull;
use crate::channel::Channel;

/// Options of `map_effect`: effect concurrency and whether completion
/// order may replace input order.
#[derive(Copy, Clone, Debug)]
pub struct MapEffectOptions {
    /// Number of effects run at once; 1 binds the effect sequentially
    /// after each pull.
    pub concurrency: usize,
    /// When true, results are emitted as their effects complete instead
    /// of in input order.
    pub unordered: bool,
}

impl Default for MapEffectOptions {
    fn default() -> Self {
        MapEffectOptions {
            concurrency: 1,
            unordered: false,
        }
    }
}

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Bind an effect to every output value.
    ///
    /// Ordered concurrency forks one fiber per input and joins their
    /// results in input order through a bounded hand-off queue of
    /// capacity `concurrency - 2` (one slot is the in-flight offer, one
    /// the result currently being joined), so concurrency 1 and 2
    /// degrade to (near-)sequential hand-off. Unordered concurrency uses
    /// a semaphore of `concurrency` permits and emits results as they
    /// complete.
    pub fn map_effect<OB, F, Fut>(self, f: F, options: MapEffectOptions) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<OB>> + Send + 'static,
    {
        if options.concurrency <= 1 {
            return self.map_effect_sequential(f);
        }
        if options.unordered {
            self.map_effect_unordered(f, options.concurrency)
        } else {
            self.map_effect_ordered(f, options.concurrency)
        }
    }

    fn map_effect_sequential<OB, F, Fut>(self, f: F) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<OB>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope).await?;
            Ok(Pull::new(SequentialSource { pull, f }))
        })
    }

    fn map_effect_ordered<OB, F, Fut>(self, f: F, concurrency: usize) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<OB>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                let awaits: Queue<Task<Exit<OB>>, OD> =
                    Queue::bounded(concurrency.saturating_sub(2), Strategy::Suspend);
                let teardown = awaits.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let feed = awaits.clone();
                let mut pull = pull;
                let mut f = f;
                child
                    .spawn(async move {
                        loop {
                            match pull.next().await {
                                Step::Emit(value) => {
                                    let task = Task::spawn(f(value));
                                    if !feed.offer(task).await {
                                        break;
                                    }
                                }
                                Step::Halt(done) => {
                                    feed.end(done);
                                    break;
                                }
                                Step::Fail(cause) => {
                                    feed.fail_cause(cause);
                                    break;
                                }
                            }
                        }
                    })
                    .await
                    .detach();
                Ok(Pull::new(OrderedSource { awaits }))
            })
            .await
        })
    }

    fn map_effect_unordered<OB, F, Fut>(
        self,
        f: F,
        concurrency: usize,
    ) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<OB>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                let out: Queue<OB, OD> = Queue::bounded(concurrency, Strategy::Suspend);
                let teardown = out.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let queue = out.clone();
                let mut pull = pull;
                let mut f = f;
                child
                    .spawn(async move {
                        let permits = Arc::new(Semaphore::new(concurrency));
                        let mut workers = JoinSet::new();
                        loop {
                            while workers.try_join_next().is_some() {}
                            match pull.next().await {
                                Step::Emit(value) => {
                                    let permit = match permits.clone().acquire_owned().await {
                                        Ok(permit) => permit,
                                        Err(_) => break,
                                    };
                                    let effect = f(value);
                                    let out = queue.clone();
                                    workers.spawn(async move {
                                        match effect.await {
                                            Ok(result) => {
                                                out.offer(result).await;
                                            }
                                            Err(cause) => {
                                                out.fail_cause(cause);
                                            }
                                        }
                                        drop(permit);
                                    });
                                }
                                Step::Halt(done) => {
                                    // Wait for every in-flight effect before
                                    // ending the output.
                                    let _ = permits.acquire_many(concurrency as u32).await;
                                    queue.end(done);
                                    break;
                                }
                                Step::Fail(cause) => {
                                    queue.fail_cause(cause);
                                    break;
                                }
                            }
                        }
                    })
                    .await
                    .detach();
                Ok(out.pull())
            })
            .await
        })
    }
}

struct SequentialSource<OA, OD, F> {
    pull: Pull<OA, OD>,
    f: F,
}

impl<OA, OB, OD, F, Fut> PullSource<OB, OD> for SequentialSource<OA, OD, F>
where
    OA: Send + 'static,
    OB: Send + 'static,
    OD: Clone + Send + 'static,
    F: FnMut(OA) -> Fut + Send,
    Fut: Future<Output = Exit<OB>> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OB, OD>>
    where
        OB: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            match self.pull.next().await {
                Step::Emit(value) => Step::from_exit((self.f)(value).await),
                Step::Halt(done) => Step::Halt(done),
                Step::Fail(cause) => Step::Fail(cause),
            }
        })
    }
}

struct OrderedSource<OB, OD> {
    awaits: Queue<Task<Exit<OB>>, OD>,
}

impl<OB, OD> PullSource<OB, OD> for OrderedSource<OB, OD>
where
    OB: Send + 'static,
    OD: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OB, OD>>
    where
        OB: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            match self.awaits.take().await {
                Step::Emit(task) => match task.join_exit().await {
                    Ok(value) => Step::Emit(value),
                    Err(cause) => {
                        // Outstanding fibers are dropped (and thereby
                        // aborted) with the queue.
                        self.awaits.shutdown();
                        Step::Fail(cause)
                    }
                },
                Step::Halt(done) => Step::Halt(done),
                Step::Fail(cause) => Step::Fail(cause),
            }
        })
    }
}
