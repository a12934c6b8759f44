/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

mod aggregate;
mod broadcast;
mod group_by;
mod merge;
mod retry;
mod time;
mod transform;
mod zip;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::SharedError;
use pull_core::SharedPull;
use pull_core::Step;
use pull_queue::PubSub;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_queue::Subscription;
use pull_scope::Scope;

use crate::channel::drive;
use crate::channel::scoped_pull;
use crate::channel::CallbackOptions;
use crate::channel::Channel;
use crate::sink::End;
use crate::sink::Sink;
use crate::DEFAULT_CHUNK_SIZE;

pub use self::broadcast::Share;
pub use self::broadcast::ShareOptions;
pub use self::group_by::GroupByOptions;
pub use self::time::ThrottleOptions;
pub use self::time::ThrottleStrategy;

/// A lazy, chunked producer of `A` values: a [`Channel`] specialized to
/// non-empty [`Chunk`]s with a unit done value and an unused input side.
///
/// Streams are one-shot values; nothing runs until one of the `run_*`
/// methods drives the pipeline.
pub struct Stream<A> {
    channel: Channel<Chunk<A>>,
}

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// View a chunk channel as a stream.
    pub fn from_channel(channel: Channel<Chunk<A>>) -> Self {
        Stream { channel }
    }

    /// The underlying chunk channel.
    pub fn into_channel(self) -> Channel<Chunk<A>> {
        self.channel
    }

    /// A stream with no elements.
    pub fn empty() -> Self {
        Stream::from_channel(Channel::end(()))
    }

    /// A stream that never produces and never halts.
    pub fn never() -> Self {
        Stream::from_channel(Channel::never())
    }

    /// A stream holding one element.
    pub fn once(value: A) -> Self {
        Stream::from_channel(Channel::succeed(Chunk::of(value)))
    }

    /// A failing stream.
    pub fn fail(err: impl Into<anyhow::Error> + Send + 'static) -> Self {
        Stream::from_channel(Channel::fail(err))
    }

    /// A stream failing with the given cause.
    pub fn fail_cause(cause: Cause) -> Self {
        Stream::from_channel(Channel::fail_cause(cause))
    }

    /// A stream dying with the given defect.
    pub fn die(err: impl Into<anyhow::Error> + Send + 'static) -> Self {
        Stream::from_channel(Channel::die(err))
    }

    /// A stream emitting exactly this chunk.
    pub fn from_chunk(chunk: Chunk<A>) -> Self {
        Stream::from_channel(Channel::succeed(chunk))
    }

    /// A stream emitting the given chunks.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Chunk<A>>,
        I::IntoIter: Send + 'static,
    {
        Stream::from_channel(Channel::from_iter(chunks))
    }

    /// A stream over an iterator, batched into chunks of the default
    /// size.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        Stream::from_iter_chunked(iter, DEFAULT_CHUNK_SIZE)
    }

    /// A stream over an iterator with an explicit chunk size.
    pub fn from_iter_chunked<I>(iter: I, chunk_size: usize) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        let iter = iter.into_iter();
        Stream::from_channel(Channel::new(move |_upstream, _scope| async move {
            Ok(Pull::new(ChunkedIterSource {
                iter,
                chunk_size: chunk_size.max(1),
            }))
        }))
    }

    /// A stream produced by repeatedly running an effectful step
    /// function, one element per step, until it returns `None`.
    pub fn unfold<S, F, Fut>(state: S, f: F) -> Self
    where
        S: Send + 'static,
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<Option<(A, S)>>> + Send + 'static,
    {
        Stream::from_channel(Channel::new(move |_upstream, _scope| async move {
            Ok(Pull::new(UnfoldSource { state: Some(state), f }))
        }))
    }

    /// A stream reading an existing queue in drained batches, halting
    /// with the queue's terminal.
    pub fn from_queue(queue: Queue<A, ()>) -> Self {
        Stream::from_channel(Channel::new(move |_upstream, _scope| async move {
            Ok(queue.chunk_pull())
        }))
    }

    /// A stream over the values delivered to a pubsub subscription.
    pub fn from_subscription(subscription: Subscription<A>) -> Self {
        Stream::from_channel(Channel::new(move |_upstream, _scope| async move {
            Ok(subscription.chunk_pull())
        }))
    }

    /// Hand a scoped queue to user code and stream whatever it offers.
    pub fn callback<F, Fut>(f: F, options: CallbackOptions) -> Self
    where
        F: FnOnce(Queue<A, ()>) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<A, ()> = Queue::with_capacity(options.capacity, options.strategy);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let handle = queue.clone();
                child
                    .spawn(async move {
                        if let Err(cause) = f(handle.clone()).await {
                            handle.fail_cause(cause);
                        }
                    })
                    .await
                    .detach();
                Ok(queue.chunk_pull())
            })
            .await
        }))
    }

    /// Acquire a resource, stream with it, release it exactly once with
    /// the exit observed when the stream's pull terminates.
    pub fn acquire_release<R, AFut, U, Rel, RFut>(acquire: AFut, use_fn: U, release: Rel) -> Self
    where
        R: Send + Sync + 'static,
        AFut: Future<Output = Exit<R>> + Send + 'static,
        U: FnOnce(Arc<R>) -> Stream<A> + Send + 'static,
        Rel: FnOnce(Arc<R>, Exit<()>) -> RFut + Send + 'static,
        RFut: Future<Output = ()> + Send + 'static,
    {
        Stream::from_channel(Channel::acquire_release(
            acquire,
            move |resource| use_fn(resource).into_channel(),
            release,
        ))
    }

    /// Defer building the stream until it is run.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Stream::from_channel(Channel::suspend(move || thunk().into_channel()))
    }

    /// Reify an effect producing a stream.
    pub fn unwrap<Fut>(effect: Fut) -> Self
    where
        Fut: Future<Output = Exit<Self>> + Send + 'static,
    {
        Stream::from_channel(Channel::unwrap(async move {
            Ok(effect.await?.into_channel())
        }))
    }

    /// Emit everything from this stream, then everything from `that`.
    pub fn concat(self, that: Stream<A>) -> Stream<A> {
        Stream::from_channel(self.channel.concat(that.channel))
    }

    /// Convert failures into defects.
    pub fn or_die(self) -> Self {
        Stream::from_channel(self.channel.or_die())
    }

    /// Recover from a failure with a replacement stream.
    pub fn catch<F>(self, f: F) -> Self
    where
        F: FnOnce(SharedError) -> Stream<A> + Send + 'static,
    {
        Stream::from_channel(self.channel.catch(move |err| f(err).into_channel()))
    }

    /// Recover from any cause with a replacement stream.
    pub fn catch_cause<F>(self, f: F) -> Self
    where
        F: FnOnce(Cause) -> Stream<A> + Send + 'static,
    {
        Stream::from_channel(self.channel.catch_cause(move |cause| f(cause).into_channel()))
    }

    /// Recover only from failures whose error downcasts to `E`.
    pub fn catch_tag<E, F>(self, f: F) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
        F: FnOnce(SharedError) -> Stream<A> + Send + 'static,
    {
        Stream::from_channel(self.channel.catch_tag::<E, _>(move |err| f(err).into_channel()))
    }

    /// Run `f` with this stream's own exit when it terminates.
    pub fn on_exit<F, Fut>(self, f: F) -> Self
    where
        F: FnOnce(Exit<()>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Stream::from_channel(self.channel.on_exit(f))
    }

    /// Run an effect when this stream terminates, whatever the exit.
    pub fn ensuring<Fut>(self, effect: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Stream::from_channel(self.channel.ensuring(effect))
    }

    /// Interrupt the stream when `trigger` completes.
    pub fn interrupt_when<Fut>(self, trigger: Fut) -> Self
    where
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Stream::from_channel(self.channel.interrupt_when(trigger))
    }

    /// End the stream cleanly when `trigger` completes, after the chunk
    /// currently in flight.
    pub fn halt_when<Fut>(self, trigger: Fut) -> Self
    where
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Stream::from_channel(self.channel.halt_when(trigger))
    }

    /// Decouple producer and consumer through a queue of chunks.
    pub fn buffer(self, capacity: usize, strategy: Strategy) -> Stream<A> {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let mut pull = channel.into_pull(Pull::halt(()), scope.clone()).await?;
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<Chunk<A>, ()> = Queue::bounded(capacity, strategy);
                let teardown = queue.clone();
                child
                    .defer(async move {
                        teardown.shutdown();
                    })
                    .await;
                let out = queue.clone();
                child
                    .spawn(async move {
                        loop {
                            match pull.next().await {
                                Step::Emit(chunk) => {
                                    if !out.offer(chunk).await {
                                        break;
                                    }
                                }
                                Step::Halt(()) => {
                                    out.end(());
                                    break;
                                }
                                Step::Fail(cause) => {
                                    out.fail_cause(cause);
                                    break;
                                }
                            }
                        }
                    })
                    .await
                    .detach();
                Ok(queue.pull())
            })
            .await
        }))
    }

    /// Run the stream, collecting every element.
    pub async fn run_collect(self) -> Exit<Vec<A>> {
        self.channel
            .run_fold(Vec::new(), |mut acc, chunk| {
                acc.extend(chunk);
                acc
            })
            .await
    }

    /// Run the stream, discarding elements.
    pub async fn run_drain(self) -> Exit<()> {
        self.channel.run_drain().await
    }

    /// Run the stream, counting elements.
    pub async fn run_count(self) -> Exit<usize> {
        self.channel
            .run_fold(0usize, |acc, chunk| acc + chunk.len())
            .await
    }

    /// Run the stream, folding every element into an accumulator.
    pub async fn run_fold<S, F>(self, init: S, mut f: F) -> Exit<S>
    where
        S: Send + 'static,
        F: FnMut(S, A) -> S + Send,
    {
        self.channel
            .run_fold(init, move |acc, chunk| chunk.into_iter().fold(acc, &mut f))
            .await
    }

    /// Run the stream, binding an effect to every element.
    pub async fn run_for_each<F, Fut>(self, mut f: F) -> Exit<()>
    where
        F: FnMut(A) -> Fut + Send,
        Fut: Future<Output = Exit<()>> + Send,
    {
        let scope = Scope::root();
        let channel = self.channel;
        let work = {
            let scope = scope.clone();
            async move {
                let mut pull = channel.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(chunk) => {
                            for value in chunk {
                                f(value).await?;
                            }
                        }
                        Step::Halt(()) => return Ok(()),
                        Step::Fail(cause) => return Err(cause),
                    }
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the stream for its first element, if any.
    pub async fn run_head(self) -> Exit<Option<A>> {
        let scope = Scope::root();
        let channel = self.channel;
        let work = {
            let scope = scope.clone();
            async move {
                let mut pull = channel.into_pull(Pull::halt(()), scope).await?;
                match pull.next().await {
                    Step::Emit(chunk) => Ok(Some(chunk.into_iter().next().expect(
                        "chunks are never empty",
                    ))),
                    Step::Halt(()) => Ok(None),
                    Step::Fail(cause) => Err(cause),
                }
            }
        };
        drive(scope, work).await
    }

    /// Run the stream into a sink, producing the sink's result. Leftover
    /// input the sink did not consume is discarded at this outermost
    /// boundary.
    pub async fn run<B, L>(self, sink: Sink<B, A, L>) -> Exit<B>
    where
        B: Send + 'static,
        L: Send + 'static,
    {
        let scope = Scope::root();
        let channel = self.channel;
        let work = {
            let scope = scope.clone();
            async move {
                let pull = channel.into_pull(Pull::halt(()), scope.clone()).await?;
                let End { value, .. } = sink.run(pull, scope).await?;
                Ok(value)
            }
        };
        drive(scope, work).await
    }

    /// Run the stream, offering every element to a queue. The queue ends
    /// with the stream's terminal.
    pub async fn run_into_queue(self, queue: Queue<A, ()>) -> Exit<()> {
        let scope = Scope::root();
        let channel = self.channel;
        let work = {
            let scope = scope.clone();
            let queue = queue.clone();
            async move {
                let mut pull = channel.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(chunk) => {
                            for value in chunk {
                                if !queue.offer(value).await {
                                    return Ok(());
                                }
                            }
                        }
                        Step::Halt(()) => {
                            queue.end(());
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

    /// Run the stream, publishing every element to a pubsub.
    pub async fn run_into_pubsub(self, pubsub: PubSub<A>) -> Exit<()>
    where
        A: Clone,
    {
        let scope = Scope::root();
        let channel = self.channel;
        let work = {
            let scope = scope.clone();
            let pubsub = pubsub.clone();
            async move {
                let mut pull = channel.into_pull(Pull::halt(()), scope).await?;
                loop {
                    match pull.next().await {
                        Step::Emit(chunk) => {
                            for value in chunk {
                                if !pubsub.publish(value).await {
                                    return Ok(());
                                }
                            }
                        }
                        Step::Halt(()) => {
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

    /// Produce this stream's chunk pull against the given scope without
    /// driving it, shared behind a one-permit mutex.
    pub async fn into_shared_pull(self, scope: &Scope) -> Exit<SharedPull<Chunk<A>, ()>> {
        self.channel.into_shared_pull(scope).await
    }
}

struct ChunkedIterSource<I> {
    iter: I,
    chunk_size: usize,
}

impl<A, I> PullSource<Chunk<A>, ()> for ChunkedIterSource<I>
where
    A: Send + 'static,
    I: Iterator<Item = A> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            let mut batch = Vec::new();
            for value in self.iter.by_ref().take(self.chunk_size) {
                batch.push(value);
            }
            match Chunk::from_vec(batch) {
                Some(chunk) => {
                    // A tight synchronous producer still yields between
                    // chunks.
                    tokio::task::yield_now().await;
                    Step::Emit(chunk)
                }
                None => Step::Halt(()),
            }
        })
    }
}

struct UnfoldSource<S, F> {
    state: Option<S>,
    f: F,
}

impl<A, S, F, Fut> PullSource<Chunk<A>, ()> for UnfoldSource<S, F>
where
    A: Send + 'static,
    S: Send + 'static,
    F: FnMut(S) -> Fut + Send,
    Fut: Future<Output = Exit<Option<(A, S)>>> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            let state = match self.state.take() {
                Some(state) => state,
                None => return Step::Halt(()),
            };
            match (self.f)(state).await {
                Ok(Some((value, next))) => {
                    self.state = Some(next);
                    Step::Emit(Chunk::of(value))
                }
                Ok(None) => Step::Halt(()),
                Err(cause) => Step::Fail(cause),
            }
        })
    }
}
