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
use std::future::Future;

use futures::future::BoxFuture;
use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;

use crate::channel::Channel;
use crate::channel::FlatMapOptions;
use crate::channel::MapEffectOptions;
use crate::stream::Stream;

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Apply a function to every element, chunk by chunk.
    pub fn map<B, F>(self, mut f: F) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> B + Send + 'static,
    {
        Stream::from_channel(self.channel.map(move |chunk| chunk.map(&mut f)))
    }

    /// Keep only the elements matching a predicate. Chunks left empty by
    /// the filter are dropped entirely.
    pub fn filter<F>(self, mut pred: F) -> Stream<A>
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        self.map_chunks_filter(move |chunk| chunk.filter(&mut pred))
    }

    /// Filter and map in one pass.
    pub fn filter_map<B, F>(self, mut f: F) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> Option<B> + Send + 'static,
    {
        self.map_chunks_filter(move |chunk| chunk.filter_map(&mut f))
    }

    /// Apply a function to every chunk.
    pub fn map_chunks<B, F>(self, f: F) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(Chunk<A>) -> Chunk<B> + Send + 'static,
    {
        Stream::from_channel(self.channel.map(f))
    }

    /// The workhorse behind `filter` and friends: apply a chunk function
    /// that may drop the whole chunk, re-pulling until something
    /// survives.
    fn map_chunks_filter<B, F>(self, f: F) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(Chunk<A>) -> Option<Chunk<B>> + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(FilterChunksSource { pull, f }))
        }))
    }

    /// Thread a state through the stream, element-wise.
    pub fn map_accum<S, B, F>(self, init: S, f: F) -> Stream<B>
    where
        S: Send + 'static,
        B: Send + 'static,
        F: FnMut(S, A) -> (S, B) + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(MapAccumSource {
                pull,
                state: Some(init),
                f,
            }))
        }))
    }

    /// Take the first `n` elements, splitting a chunk when the boundary
    /// falls inside it; the remainder is discarded and upstream is not
    /// pulled again.
    pub fn take(self, n: usize) -> Stream<A> {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(TakeSource { pull, remaining: n }))
        }))
    }

    /// Emit elements while the predicate holds, then halt.
    pub fn take_while<F>(self, pred: F) -> Stream<A>
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(TakeWhileSource {
                pull,
                pred,
                done: false,
            }))
        }))
    }

    /// Emit elements up to and including the first one matching the
    /// predicate, then halt.
    pub fn take_until<F>(self, pred: F) -> Stream<A>
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(TakeUntilSource {
                pull,
                pred,
                done: false,
            }))
        }))
    }

    /// Skip the first `n` elements.
    pub fn drop(self, n: usize) -> Stream<A> {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(DropSource { pull, remaining: n }))
        }))
    }

    /// Skip elements while the predicate holds, then emit everything.
    pub fn drop_while<F>(self, pred: F) -> Stream<A>
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(DropWhileSource {
                pull,
                pred: Some(pred),
            }))
        }))
    }

    /// Repartition the stream into chunks of exactly `size` elements,
    /// flushing the remainder when upstream halts.
    pub fn rechunk(self, size: usize) -> Stream<A> {
        let size = size.max(1);
        let channel = self.channel;
        Stream::from_channel(Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(RechunkSource {
                pull,
                buffer: Vec::new(),
                ready: VecDeque::new(),
                size,
                upstream_done: false,
            }))
        }))
    }

    /// For every element, build an inner stream and emit its elements.
    /// Sequential by default; concurrent when the options say so.
    pub fn flat_map<B, F>(self, mut f: F, options: FlatMapOptions) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> Stream<B> + Send + 'static,
    {
        let elements = self.into_element_channel();
        Stream::from_channel(
            elements.flat_map(move |value| f(value).into_channel(), options),
        )
    }

    /// Bind an effect to every element. Results are emitted as singleton
    /// chunks; ordered concurrency preserves input order.
    pub fn map_effect<B, F, Fut>(self, f: F, options: MapEffectOptions) -> Stream<B>
    where
        B: Send + 'static,
        F: FnMut(A) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<B>> + Send + 'static,
    {
        Stream::from_channel(
            self.into_element_channel()
                .map_effect(f, options)
                .map(Chunk::of),
        )
    }

    /// Flatten this stream's chunks into a channel of bare elements.
    pub(crate) fn into_element_channel(self) -> Channel<A> {
        let channel = self.channel;
        Channel::new(move |upstream, scope| async move {
            let pull = channel.into_pull(upstream, scope).await?;
            Ok(Pull::new(FlattenChunksSource {
                pull,
                pending: VecDeque::new(),
            }))
        })
    }
}

pub(crate) struct FlattenChunksSource<A> {
    pull: Pull<Chunk<A>, ()>,
    pending: VecDeque<A>,
}

impl<A> PullSource<A, ()> for FlattenChunksSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, ()>>
    where
        A: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                if let Some(value) = self.pending.pop_front() {
                    return Step::Emit(value);
                }
                match self.pull.next().await {
                    Step::Emit(chunk) => self.pending.extend(chunk),
                    Step::Halt(()) => return Step::Halt(()),
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}

struct FilterChunksSource<A, F> {
    pull: Pull<Chunk<A>, ()>,
    f: F,
}

impl<A, B, F> PullSource<Chunk<B>, ()> for FilterChunksSource<A, F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnMut(Chunk<A>) -> Option<Chunk<B>> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<B>, ()>>
    where
        Chunk<B>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                match self.pull.next().await {
                    Step::Emit(chunk) => {
                        if let Some(kept) = (self.f)(chunk) {
                            return Step::Emit(kept);
                        }
                    }
                    Step::Halt(()) => return Step::Halt(()),
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}

struct MapAccumSource<A, S, F> {
    pull: Pull<Chunk<A>, ()>,
    state: Option<S>,
    f: F,
}

impl<A, B, S, F> PullSource<Chunk<B>, ()> for MapAccumSource<A, S, F>
where
    A: Send + 'static,
    B: Send + 'static,
    S: Send + 'static,
    F: FnMut(S, A) -> (S, B) + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<B>, ()>>
    where
        Chunk<B>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            match self.pull.next().await {
                Step::Emit(chunk) => {
                    let mut state = self.state.take().expect("accumulator state present");
                    let mut out = Vec::with_capacity(chunk.len());
                    for value in chunk {
                        let (next, mapped) = (self.f)(state, value);
                        state = next;
                        out.push(mapped);
                    }
                    self.state = Some(state);
                    Step::Emit(Chunk::from_vec(out).expect("mapped a non-empty chunk"))
                }
                Step::Halt(()) => Step::Halt(()),
                Step::Fail(cause) => Step::Fail(cause),
            }
        })
    }
}

struct TakeSource<A> {
    pull: Pull<Chunk<A>, ()>,
    remaining: usize,
}

impl<A> PullSource<Chunk<A>, ()> for TakeSource<A>
where
    A: Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            if self.remaining == 0 {
                return Step::Halt(());
            }
            match self.pull.next().await {
                Step::Emit(chunk) => {
                    if chunk.len() <= self.remaining {
                        self.remaining -= chunk.len();
                        Step::Emit(chunk)
                    } else {
                        let (head, _rest) = chunk.split_at(self.remaining);
                        self.remaining = 0;
                        match head {
                            Some(head) => Step::Emit(head),
                            None => Step::Halt(()),
                        }
                    }
                }
                step => step,
            }
        })
    }
}

struct TakeWhileSource<A, F> {
    pull: Pull<Chunk<A>, ()>,
    pred: F,
    done: bool,
}

impl<A, F> PullSource<Chunk<A>, ()> for TakeWhileSource<A, F>
where
    A: Send + 'static,
    F: FnMut(&A) -> bool + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            if self.done {
                return Step::Halt(());
            }
            match self.pull.next().await {
                Step::Emit(chunk) => {
                    let boundary = chunk.iter().position(|value| !(self.pred)(value));
                    match boundary {
                        None => Step::Emit(chunk),
                        Some(0) => {
                            self.done = true;
                            Step::Halt(())
                        }
                        Some(index) => {
                            self.done = true;
                            let (head, _rest) = chunk.split_at(index);
                            match head {
                                Some(head) => Step::Emit(head),
                                None => Step::Halt(()),
                            }
                        }
                    }
                }
                step => step,
            }
        })
    }
}

struct TakeUntilSource<A, F> {
    pull: Pull<Chunk<A>, ()>,
    pred: F,
    done: bool,
}

impl<A, F> PullSource<Chunk<A>, ()> for TakeUntilSource<A, F>
where
    A: Send + 'static,
    F: FnMut(&A) -> bool + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            if self.done {
                return Step::Halt(());
            }
            match self.pull.next().await {
                Step::Emit(chunk) => {
                    let boundary = chunk.iter().position(|value| (self.pred)(value));
                    match boundary {
                        None => Step::Emit(chunk),
                        Some(index) => {
                            self.done = true;
                            let (head, _rest) = chunk.split_at(index + 1);
                            match head {
                                Some(head) => Step::Emit(head),
                                None => Step::Halt(()),
                            }
                        }
                    }
                }
                step => step,
            }
        })
    }
}

struct DropSource<A> {
    pull: Pull<Chunk<A>, ()>,
    remaining: usize,
}

impl<A> PullSource<Chunk<A>, ()> for DropSource<A>
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
                match self.pull.next().await {
                    Step::Emit(chunk) => {
                        if self.remaining == 0 {
                            return Step::Emit(chunk);
                        }
                        if chunk.len() <= self.remaining {
                            self.remaining -= chunk.len();
                            continue;
                        }
                        let skip = self.remaining;
                        self.remaining = 0;
                        let (_head, rest) = chunk.split_at(skip);
                        if let Some(rest) = rest {
                            return Step::Emit(rest);
                        }
                    }
                    step => return step,
                }
            }
        })
    }
}

struct DropWhileSource<A, F> {
    pull: Pull<Chunk<A>, ()>,
    pred: Option<F>,
}

impl<A, F> PullSource<Chunk<A>, ()> for DropWhileSource<A, F>
where
    A: Send + 'static,
    F: FnMut(&A) -> bool + Send,
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
                        let Some(pred) = &mut self.pred else {
                            return Step::Emit(chunk);
                        };
                        match chunk.iter().position(|value| !pred(value)) {
                            None => continue,
                            Some(index) => {
                                self.pred = None;
                                let (_head, rest) = chunk.split_at(index);
                                if let Some(rest) = rest {
                                    return Step::Emit(rest);
                                }
                            }
                        }
                    }
                    step => return step,
                }
            }
        })
    }
}

struct RechunkSource<A> {
    pull: Pull<Chunk<A>, ()>,
    buffer: Vec<A>,
    ready: VecDeque<Chunk<A>>,
    size: usize,
    upstream_done: bool,
}

impl<A> PullSource<Chunk<A>, ()> for RechunkSource<A>
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
                if let Some(chunk) = self.ready.pop_front() {
                    return Step::Emit(chunk);
                }
                if self.upstream_done {
                    // Flush the remainder.
                    let rest = std::mem::take(&mut self.buffer);
                    return match Chunk::from_vec(rest) {
                        Some(chunk) => Step::Emit(chunk),
                        None => Step::Halt(()),
                    };
                }
                match self.pull.next().await {
                    Step::Emit(chunk) => {
                        self.buffer.extend(chunk);
                        while self.buffer.len() >= self.size {
                            let tail = self.buffer.split_off(self.size);
                            let full = std::mem::replace(&mut self.buffer, tail);
                            self.ready.push_back(
                                Chunk::from_vec(full).expect("a full rechunk buffer"),
                            );
                        }
                    }
                    Step::Halt(()) => self.upstream_done = true,
                    Step::Fail(cause) => return Step::Fail(cause),
                }
            }
        })
    }
}
