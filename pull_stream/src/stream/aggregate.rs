/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use pull_core::Chunk;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::SharedPull;
use pull_core::Step;
use pull_scope::Scope;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::sink::Sink;
use crate::stream::Stream;

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Repeatedly run a sink over this stream, emitting each sink result.
    ///
    /// Leftover input from one sink run is fed to the next before fresh
    /// upstream data. The sink must consume at least one element per run
    /// for the aggregation to make progress.
    pub fn aggregate<B, F>(self, make_sink: F) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut() -> Sink<B, A> + Send + 'static,
    {
        self.aggregate_inner(make_sink, None)
    }

    /// Like [`Stream::aggregate`], but each sink run is raced against a
    /// timer: when the timer fires first, the sink's input ends early and
    /// the current accumulator value is emitted.
    pub fn aggregate_within<B, F>(self, make_sink: F, period: Duration) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut() -> Sink<B, A> + Send + 'static,
    {
        self.aggregate_inner(make_sink, Some(period))
    }

    fn aggregate_inner<B, F>(self, make_sink: F, period: Option<Duration>) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut() -> Sink<B, A> + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let pull = channel.into_pull(Pull::halt(()), scope.clone()).await?;
            Ok(Pull::new(AggregateSource {
                upstream: pull.shared(),
                upstream_done: Arc::new(AtomicBool::new(false)),
                leftover: None,
                make_sink,
                parent: scope,
                period,
            }))
        }))
    }
}

struct AggregateSource<A, F> {
    upstream: SharedPull<Chunk<A>, ()>,
    upstream_done: Arc<AtomicBool>,
    leftover: Option<Chunk<A>>,
    make_sink: F,
    parent: Scope,
    period: Option<Duration>,
}

impl<A, B, F> PullSource<Chunk<B>, ()> for AggregateSource<A, F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut() -> Sink<B, A> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<B>, ()>>
    where
        Chunk<B>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                if self.upstream_done.load(Ordering::SeqCst) && self.leftover.is_none() {
                    return Step::Halt(());
                }
                let consumed = Arc::new(AtomicBool::new(false));
                // Innermost: mark genuine upstream exhaustion.
                let watched: Pull<Chunk<A>, ()> = Pull::new(MarkHaltSource {
                    pull: self.upstream.to_pull(),
                    flag: Arc::clone(&self.upstream_done),
                });
                // A timer halt ends this run's input without marking the
                // upstream as done.
                let gated = match self.period {
                    Some(period) => Pull::new(DeadlineSource {
                        pull: watched,
                        deadline: Instant::now() + period,
                    }),
                    None => watched,
                };
                let prefixed = match self.leftover.take() {
                    Some(chunk) => gated.with_prefix(vec![chunk]),
                    None => gated,
                };
                let input = Pull::new(MarkEmitSource {
                    pull: prefixed,
                    flag: Arc::clone(&consumed),
                });

                let child = self.parent.fork().await;
                match (self.make_sink)().run(input, child.clone()).await {
                    Ok(end) => {
                        child.close(Ok(())).await;
                        self.leftover = end.leftover;
                        if !consumed.load(Ordering::SeqCst)
                            && self.upstream_done.load(Ordering::SeqCst)
                            && self.leftover.is_none()
                        {
                            // The run saw nothing at all; its value is
                            // not an aggregate of anything.
                            return Step::Halt(());
                        }
                        return Step::Emit(Chunk::of(end.value));
                    }
                    Err(cause) => {
                        child.close(Err(cause.clone())).await;
                        return Step::Fail(cause);
                    }
                }
            }
        })
    }
}

struct MarkHaltSource<A> {
    pull: Pull<Chunk<A>, ()>,
    flag: Arc<AtomicBool>,
}

impl<A> PullSource<Chunk<A>, ()> for MarkHaltSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            let step = self.pull.next().await;
            if step.is_halt() {
                self.flag.store(true, Ordering::SeqCst);
            }
            step
        })
    }
}

struct MarkEmitSource<A> {
    pull: Pull<Chunk<A>, ()>,
    flag: Arc<AtomicBool>,
}

impl<A> PullSource<Chunk<A>, ()> for MarkEmitSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            let step = self.pull.next().await;
            if step.is_emit() {
                self.flag.store(true, Ordering::SeqCst);
            }
            step
        })
    }
}

struct DeadlineSource<A> {
    pull: Pull<Chunk<A>, ()>,
    deadline: Instant,
}

impl<A> PullSource<Chunk<A>, ()> for DeadlineSource<A>
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
                _ = tokio::time::sleep_until(self.deadline) => Step::Halt(()),
            }
        })
    }
}
