/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::collections::VecDeque;

use futures::future::BoxFuture;
use pull_core::Chunk;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_scope::Scope;

use crate::channel::scoped_pull;
use crate::channel::Channel;
use crate::stream::Stream;
use crate::DEFAULT_MERGE_BUFFER;

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Pair this stream with another, element by element. Ends when
    /// either side ends; unpaired elements are discarded.
    pub fn zip<B>(self, that: Stream<B>) -> Stream<(A, B)>
    where
        B: Send + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Combine this stream with another, element by element.
    ///
    /// Both upstreams are pulled concurrently when neither side has
    /// buffered elements; the shorter side's leftovers are fed back
    /// before its next pull, and the i-th result is emitted only after
    /// both sides' i-th element arrived.
    pub fn zip_with<B, C, F>(self, that: Stream<B>, f: F) -> Stream<C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnMut(A, B) -> C + Send + 'static,
    {
        let left = self.channel;
        let right = that.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let left = left.into_pull(Pull::halt(()), scope.clone()).await?;
            let right = right.into_pull(Pull::halt(()), scope).await?;
            Ok(Pull::new(ZipSource {
                left,
                right,
                left_buf: VecDeque::new(),
                right_buf: VecDeque::new(),
                left_done: false,
                right_done: false,
                f,
            }))
        }))
    }

    /// Emit the latest pair every time either side advances, once both
    /// sides have produced at least one element.
    ///
    /// A source that halts after emitting keeps contributing its last
    /// value; a source that halts before its first emission makes a pair
    /// impossible, so the combined stream halts.
    pub fn zip_latest<B>(self, that: Stream<B>) -> Stream<(A, B)>
    where
        A: Clone,
        B: Clone + Send + 'static,
    {
        let left = self.channel;
        let right = that.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<LatestEvent<A, B>, ()> =
                    Queue::bounded(DEFAULT_MERGE_BUFFER, Strategy::Suspend);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                spawn_latest_side(&child, left, queue.clone(), LatestEvent::Left as fn(A) -> _, LatestEvent::LeftHalt).await;
                spawn_latest_side(&child, right, queue.clone(), LatestEvent::Right as fn(B) -> _, LatestEvent::RightHalt).await;
                Ok(Pull::new(ZipLatestSource {
                    queue,
                    last_left: None,
                    last_right: None,
                    left_done: false,
                    right_done: false,
                }))
            })
            .await
        }))
    }

    /// Combine many streams, emitting the full row of latest values on
    /// every advance once each source has produced at least once.
    ///
    /// Termination follows the same policy as [`Stream::zip_latest`]: a
    /// source that halts with no prior emission halts the whole stream.
    pub fn zip_latest_all(sources: Vec<Stream<A>>) -> Stream<Vec<A>>
    where
        A: Clone,
    {
        if sources.is_empty() {
            return Stream::empty();
        }
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let width = sources.len();
                let queue: Queue<(usize, Option<A>), ()> =
                    Queue::bounded(DEFAULT_MERGE_BUFFER, Strategy::Suspend);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                for (index, source) in sources.into_iter().enumerate() {
                    let branch = child.fork().await;
                    let out = queue.clone();
                    child
                        .spawn(async move {
                            pump_indexed(source.into_channel(), branch, out, index).await;
                        })
                        .await
                        .detach();
                }
                Ok(Pull::new(ZipLatestAllSource {
                    queue,
                    lasts: vec![None; width],
                    halted: vec![false; width],
                }))
            })
            .await
        }))
    }
}

enum LatestEvent<A, B> {
    Left(A),
    Right(B),
    LeftHalt,
    RightHalt,
}

async fn spawn_latest_side<T, A, B>(
    scope: &Scope,
    channel: Channel<Chunk<T>>,
    queue: Queue<LatestEvent<A, B>, ()>,
    wrap: fn(T) -> LatestEvent<A, B>,
    halt: LatestEvent<A, B>,
) where
    T: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    LatestEvent<A, B>: Send + 'static,
{
    let branch = scope.fork().await;
    scope
        .spawn(async move {
            let mut exit = Ok(());
            match channel.into_pull(Pull::halt(()), branch.clone()).await {
                Ok(mut pull) => loop {
                    match pull.next().await {
                        Step::Emit(chunk) => {
                            let mut rejected = false;
                            for value in chunk {
                                if !queue.offer(wrap(value)).await {
                                    rejected = true;
                                    break;
                                }
                            }
                            if rejected {
                                break;
                            }
                        }
                        Step::Halt(()) => {
                            queue.offer(halt).await;
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
            branch.close(exit).await;
        })
        .await
        .detach();
}

async fn pump_indexed<A>(
    channel: Channel<Chunk<A>>,
    scope: Scope,
    queue: Queue<(usize, Option<A>), ()>,
    index: usize,
) where
    A: Send + 'static,
{
    let mut exit = Ok(());
    match channel.into_pull(Pull::halt(()), scope.clone()).await {
        Ok(mut pull) => loop {
            match pull.next().await {
                Step::Emit(chunk) => {
                    let mut rejected = false;
                    for value in chunk {
                        if !queue.offer((index, Some(value))).await {
                            rejected = true;
                            break;
                        }
                    }
                    if rejected {
                        break;
                    }
                }
                Step::Halt(()) => {
                    queue.offer((index, None)).await;
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

struct ZipSource<A, B, F> {
    left: Pull<Chunk<A>, ()>,
    right: Pull<Chunk<B>, ()>,
    left_buf: VecDeque<A>,
    right_buf: VecDeque<B>,
    left_done: bool,
    right_done: bool,
    f: F,
}

impl<A, B, C, F> PullSource<Chunk<C>, ()> for ZipSource<A, B, F>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: FnMut(A, B) -> C + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<C>, ()>>
    where
        Chunk<C>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                if !self.left_buf.is_empty() && !self.right_buf.is_empty() {
                    let n = self.left_buf.len().min(self.right_buf.len());
                    let mut out = Vec::with_capacity(n);
                    for _ in 0..n {
                        if let (Some(a), Some(b)) =
                            (self.left_buf.pop_front(), self.right_buf.pop_front())
                        {
                            out.push((self.f)(a, b));
                        }
                    }
                    return Step::Emit(Chunk::from_vec(out).expect("zipped at least one pair"));
                }
                // A drained side that already halted can never pair again.
                if self.left_done && self.left_buf.is_empty() {
                    return Step::Halt(());
                }
                if self.right_done && self.right_buf.is_empty() {
                    return Step::Halt(());
                }
                if self.left_buf.is_empty() && self.right_buf.is_empty() {
                    // Fork-join tick: pull both sides at once.
                    let (left_step, right_step) =
                        tokio::join!(self.left.next(), self.right.next());
                    match left_step {
                        Step::Emit(chunk) => self.left_buf.extend(chunk),
                        Step::Halt(()) => self.left_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                    match right_step {
                        Step::Emit(chunk) => self.right_buf.extend(chunk),
                        Step::Halt(()) => self.right_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                } else if self.left_buf.is_empty() {
                    match self.left.next().await {
                        Step::Emit(chunk) => self.left_buf.extend(chunk),
                        Step::Halt(()) => self.left_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                } else {
                    match self.right.next().await {
                        Step::Emit(chunk) => self.right_buf.extend(chunk),
                        Step::Halt(()) => self.right_done = true,
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                }
            }
        })
    }
}

struct ZipLatestSource<A, B> {
    queue: Queue<LatestEvent<A, B>, ()>,
    last_left: Option<A>,
    last_right: Option<B>,
    left_done: bool,
    right_done: bool,
}

impl<A, B> PullSource<Chunk<(A, B)>, ()> for ZipLatestSource<A, B>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<(A, B)>, ()>>
    where
        Chunk<(A, B)>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                match self.queue.take().await {
                    Step::Emit(LatestEvent::Left(a)) => {
                        self.last_left = Some(a);
                        if let (Some(a), Some(b)) = (&self.last_left, &self.last_right) {
                            return Step::Emit(Chunk::of((a.clone(), b.clone())));
                        }
                    }
                    Step::Emit(LatestEvent::Right(b)) => {
                        self.last_right = Some(b);
                        if let (Some(a), Some(b)) = (&self.last_left, &self.last_right) {
                            return Step::Emit(Chunk::of((a.clone(), b.clone())));
                        }
                    }
                    Step::Emit(LatestEvent::LeftHalt) => {
                        self.left_done = true;
                        if self.last_left.is_none() || self.right_done {
                            return Step::Halt(());
                        }
                    }
                    Step::Emit(LatestEvent::RightHalt) => {
                        self.right_done = true;
                        if self.last_right.is_none() || self.left_done {
                            return Step::Halt(());
                        }
                    }
                    Step::Halt(()) => return Step::Halt(()),
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}

struct ZipLatestAllSource<A> {
    queue: Queue<(usize, Option<A>), ()>,
    lasts: Vec<Option<A>>,
    halted: Vec<bool>,
}

impl<A> PullSource<Chunk<Vec<A>>, ()> for ZipLatestAllSource<A>
where
    A: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<Vec<A>>, ()>>
    where
        Chunk<Vec<A>>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                match self.queue.take().await {
                    Step::Emit((index, Some(value))) => {
                        self.lasts[index] = Some(value);
                        if self.lasts.iter().all(Option::is_some) {
                            let row: Vec<A> = self
                                .lasts
                                .iter()
                                .filter_map(|slot| slot.clone())
                                .collect();
                            return Step::Emit(Chunk::of(row));
                        }
                    }
                    Step::Emit((index, None)) => {
                        self.halted[index] = true;
                        if self.lasts[index].is_none() {
                            // This source can never contribute; no row
                            // will ever be complete.
                            return Step::Halt(());
                        }
                        if self.halted.iter().all(|halted| *halted) {
                            return Step::Halt(());
                        }
                    }
                    Step::Halt(()) => return Step::Halt(()),
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}
