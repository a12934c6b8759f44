/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use futures::future::BoxFuture;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Scope;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::channel::MergeAllOptions;
use crate::channel::MergeOptions;
use crate::stream::Stream;
use crate::DEFAULT_MERGE_BUFFER;

enum RaceEvent<A> {
    Chunk(usize, Chunk<A>),
    Halt(usize),
}

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Interleave two streams. No cross-source ordering is guaranteed.
    pub fn merge(self, that: Stream<A>, options: MergeOptions) -> Stream<A> {
        Stream::from_channel(self.channel.merge(that.channel, options))
    }

    /// Interleave many streams with bounded concurrency.
    pub fn merge_all<I>(streams: I, options: MergeAllOptions) -> Stream<A>
    where
        I: IntoIterator<Item = Stream<A>>,
    {
        let channels: Vec<Channel<Chunk<A>>> = streams
            .into_iter()
            .map(|stream| stream.into_channel())
            .collect();
        Stream::from_channel(Channel::from_iter(channels).merge_all(options))
    }

    /// Race two streams: the first to emit wins, and the loser's scope is
    /// closed.
    pub fn race(self, that: Stream<A>) -> Stream<A> {
        Stream::race_all(vec![self, that])
    }

    /// Race many streams: the first to emit a chunk wins; every other
    /// source is interrupted and closed.
    pub fn race_all(streams: Vec<Stream<A>>) -> Stream<A> {
        if streams.is_empty() {
            return Stream::empty();
        }
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let entrants = streams.len();
                let queue: Queue<RaceEvent<A>, ()> =
                    Queue::bounded(DEFAULT_MERGE_BUFFER, Strategy::Suspend);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let mut branches = Vec::with_capacity(entrants);
                for (index, stream) in streams.into_iter().enumerate() {
                    let branch = child.fork().await;
                    branches.push(Some(branch.clone()));
                    let out = queue.clone();
                    child
                        .spawn(async move {
                            race_entrant(stream.into_channel(), branch, out, index).await;
                        })
                        .await
                        .detach();
                }
                Ok(Pull::new(RaceSource {
                    queue,
                    branches,
                    winner: None,
                    halted: 0,
                    entrants,
                }))
            })
            .await
        }))
    }
}

async fn race_entrant<A>(
    channel: Channel<Chunk<A>>,
    scope: Scope,
    queue: Queue<RaceEvent<A>, ()>,
    index: usize,
) where
    A: Send + 'static,
{
    let mut exit = Ok(());
    match channel.into_pull(Pull::halt(()), scope.clone()).await {
        Ok(mut pull) => loop {
            match pull.next().await {
                Step::Emit(chunk) => {
                    if !queue.offer(RaceEvent::Chunk(index, chunk)).await {
                        break;
                    }
                }
                Step::Halt(()) => {
                    queue.offer(RaceEvent::Halt(index)).await;
                    break;
                }
                Step::Fail(cause) => {
                    queue.fail_cause(cause.clone());
                    exit = Err(cause);
                    break;
                }
            }
        },
        Err(cause) => {
            queue.fail_cause(cause.clone());
            exit = Err(cause);
        }
    }
    scope.close(exit).await;
}

struct RaceSource<A> {
    queue: Queue<RaceEvent<A>, ()>,
    branches: Vec<Option<Scope>>,
    winner: Option<usize>,
    halted: usize,
    entrants: usize,
}

impl<A> RaceSource<A> {
    async fn settle(&mut self, winner: usize) {
        self.winner = Some(winner);
        for (index, slot) in self.branches.iter_mut().enumerate() {
            if index != winner {
                if let Some(scope) = slot.take() {
                    scope.close(Err(Cause::Interrupt)).await;
                }
            }
        }
    }
}

impl<A> PullSource<Chunk<A>, ()> for RaceSource<A>
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
                match self.queue.take().await {
                    Step::Emit(RaceEvent::Chunk(index, chunk)) => match self.winner {
                        None => {
                            self.settle(index).await;
                            return Step::Emit(chunk);
                        }
                        Some(winner) if winner == index => return Step::Emit(chunk),
                        // A stray chunk from a loser that raced the
                        // interrupt; drop it.
                        Some(_) => {}
                    },
                    Step::Emit(RaceEvent::Halt(index)) => {
                        if self.winner == Some(index) {
                            return Step::Halt(());
                        }
                        if self.winner.is_none() {
                            self.halted += 1;
                            if self.halted == self.entrants {
                                // Everybody ended without emitting.
                                return Step::Halt(());
                            }
                        }
                    }
                    Step::Halt(()) => return Step::Halt(()),
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}
