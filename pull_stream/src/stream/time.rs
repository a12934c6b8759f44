/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::time::Duration;

use futures::future::BoxFuture;
use pull_core::Chunk;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use tokio::time::Instant;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::stream::Stream;

/// What `throttle` does when a chunk exceeds the available tokens.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThrottleStrategy {
    /// Sleep in proportion to the missing tokens before emitting. A chunk
    /// costing more than the bucket holds still goes out after its
    /// proportional wait, leaving the balance in debt.
    Shape,
    /// Drop chunks whose cost exceeds the available tokens.
    Enforce,
}

/// Options of [`Stream::throttle`]: a token bucket refilling `units`
/// tokens per `duration`, holding at most `units + burst`.
#[derive(Copy, Clone, Debug)]
pub struct ThrottleOptions {
    /// Tokens gained per `duration`.
    pub units: u64,
    /// Refill period.
    pub duration: Duration,
    /// Extra capacity above `units`.
    pub burst: u64,
    /// Shaping or enforcing.
    pub strategy: ThrottleStrategy,
}

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Limit throughput with a token bucket, charging each chunk the
    /// cost computed by `cost`.
    pub fn throttle<F>(self, cost: F, options: ThrottleOptions) -> Stream<A>
    where
        F: FnMut(&Chunk<A>) -> u64 + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(ThrottleSource {
                pull,
                cost,
                options,
                tokens: options.units as f64 + options.burst as f64,
                refilled: Instant::now(),
            }))
        }))
    }

    /// Emit only the last element seen before the stream goes quiet for
    /// `duration`; a pending element is flushed when upstream halts.
    pub fn debounce(self, duration: Duration) -> Stream<A> {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let mut pull = channel.into_pull(Pull::halt(()), scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                // Capacity one, sliding: only the newest element matters.
                let latest: Queue<A, ()> = Queue::bounded(1, Strategy::Sliding);
                let teardown = latest.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let feed = latest.clone();
                child
                    .spawn(async move {
                        loop {
                            match pull.next().await {
                                Step::Emit(chunk) => {
                                    let mut values = chunk.into_vec();
                                    if let Some(last) = values.pop() {
                                        if !feed.offer(last).await {
                                            break;
                                        }
                                    }
                                }
                                Step::Halt(()) => {
                                    feed.end(());
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
                Ok(Pull::new(DebounceSource {
                    queue: latest,
                    pending: None,
                    upstream_done: false,
                    duration,
                }))
            })
            .await
        }))
    }

    /// End the stream cleanly when no chunk arrives for `duration`.
    pub fn timeout(self, duration: Duration) -> Stream<A> {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(TimeoutSource { pull, duration }))
        }))
    }
}

struct ThrottleSource<A, F> {
    pull: Pull<Chunk<A>, ()>,
    cost: F,
    options: ThrottleOptions,
    tokens: f64,
    refilled: Instant,
}

impl<A, F> ThrottleSource<A, F> {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled);
        self.refilled = now;
        let gained = self.options.units as f64 * elapsed.as_secs_f64()
            / self.options.duration.as_secs_f64().max(f64::EPSILON);
        let cap = self.options.units as f64 + self.options.burst as f64;
        self.tokens = (self.tokens + gained).min(cap);
    }
}

impl<A, F> PullSource<Chunk<A>, ()> for ThrottleSource<A, F>
where
    A: Send + 'static,
    F: FnMut(&Chunk<A>) -> u64 + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                match self.pull.next().await {
                    Step::Emit(chunk) => {
                        let cost = (self.cost)(&chunk) as f64;
                        self.refill();
                        match self.options.strategy {
                            ThrottleStrategy::Enforce => {
                                if self.tokens >= cost {
                                    self.tokens -= cost;
                                    return Step::Emit(chunk);
                                }
                                continue;
                            }
                            ThrottleStrategy::Shape => {
                                if self.tokens < cost {
                                    let missing = cost - self.tokens;
                                    let wait = self.options.duration.mul_f64(
                                        missing / (self.options.units as f64).max(f64::EPSILON),
                                    );
                                    tokio::time::sleep(wait).await;
                                    self.refill();
                                }
                                // A chunk costing more than the bucket
                                // holds runs the balance into debt after
                                // its proportional wait; later refills
                                // pay the debt off before the next chunk
                                // is admitted.
                                self.tokens -= cost;
                                return Step::Emit(chunk);
                            }
                        }
                    }
                    step => return step,
                }
            }
        })
    }
}

struct DebounceSource<A> {
    queue: Queue<A, ()>,
    pending: Option<A>,
    upstream_done: bool,
    duration: Duration,
}

impl<A> PullSource<Chunk<A>, ()> for DebounceSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                if self.upstream_done {
                    return match self.pending.take() {
                        Some(value) => Step::Emit(Chunk::of(value)),
                        None => Step::Halt(()),
                    };
                }
                if self.pending.is_none() {
                    match self.queue.take().await {
                        Step::Emit(value) => self.pending = Some(value),
                        Step::Halt(()) => self.upstream_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                    continue;
                }
                tokio::select! {
                    step = self.queue.take() => match step {
                        Step::Emit(value) => self.pending = Some(value),
                        Step::Halt(()) => self.upstream_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    },
                    _ = tokio::time::sleep(self.duration) => {
                        if let Some(value) = self.pending.take() {
                            return Step::Emit(Chunk::of(value));
                        }
                    }
                }
            }
        })
    }
}

struct TimeoutSource<A> {
    pull: Pull<Chunk<A>, ()>,
    duration: Duration,
}

impl<A> PullSource<Chunk<A>, ()> for TimeoutSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            tokio::select! {
                step = self.pull.next() => step,
                _ = tokio::time::sleep(self.duration) => Step::Halt(()),
            }
        })
    }
}
