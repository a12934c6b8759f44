/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::Step;
use pull_scope::Scope;

/// What a sink run produces: the result value, plus at most one
/// non-empty chunk of input it consumed from its final chunk but did not
/// use.
///
/// Composition feeds the leftover to the next sink before pulling fresh
/// upstream data; the outermost `run` discards it.
#[derive(Debug)]
pub struct End<A, L> {
    /// The sink's result.
    pub value: A,
    /// Unused tail of the final input chunk.
    pub leftover: Option<Chunk<L>>,
}

impl<A, L> End<A, L> {
    /// An end with no leftover.
    pub fn of(value: A) -> Self {
        End {
            value,
            leftover: None,
        }
    }
}

type BoxSinkRun<A, In, L> =
    Box<dyn FnOnce(Pull<Chunk<In>, ()>, Scope) -> BoxFuture<'static, Exit<End<A, L>>> + Send>;

/// A consumer of chunked input producing a single result plus leftovers.
///
/// Like a channel, a sink is a one-shot lazy value: nothing runs until it
/// is driven against an upstream pull, typically by
/// [`Stream::run`](crate::Stream::run) or an aggregation.
pub struct Sink<A, In, L = In> {
    run: BoxSinkRun<A, In, L>,
}

impl<A, In, L> Sink<A, In, L>
where
    A: Send + 'static,
    In: Send + 'static,
    L: Send + 'static,
{
    /// Build a sink from its run function.
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: FnOnce(Pull<Chunk<In>, ()>, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<End<A, L>>> + Send + 'static,
    {
        Sink {
            run: Box::new(move |upstream, scope| run(upstream, scope).boxed()),
        }
    }

    /// Drive this sink against an upstream pull.
    pub async fn run(self, upstream: Pull<Chunk<In>, ()>, scope: Scope) -> Exit<End<A, L>> {
        (self.run)(upstream, scope).await
    }

    /// Apply a function to the result value.
    pub fn map<B, F>(self, f: F) -> Sink<B, In, L>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Sink::new(move |upstream, scope| async move {
            let end = self.run(upstream, scope).await?;
            Ok(End {
                value: f(end.value),
                leftover: end.leftover,
            })
        })
    }
}

impl<A, In> Sink<A, In, In>
where
    A: Send + 'static,
    In: Send + 'static,
{
    /// Run this sink, then the sink built from its result. Leftover input
    /// of the first sink is fed to the second before fresh upstream data.
    pub fn flat_map<B, F>(self, f: F) -> Sink<B, In, In>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Sink<B, In, In> + Send + 'static,
    {
        Sink::new(move |upstream, scope| async move {
            let shared = upstream.shared();
            let first = self.run(shared.to_pull(), scope.clone()).await?;
            let input = match first.leftover {
                Some(chunk) => shared.to_pull().with_prefix(vec![chunk]),
                None => shared.to_pull(),
            };
            f(first.value).run(input, scope).await
        })
    }

    /// On failure, run the recovery sink against the same upstream.
    /// Defects and interrupts are not recovered.
    pub fn or_else<F>(self, f: F) -> Self
    where
        F: FnOnce(Cause) -> Self + Send + 'static,
    {
        Sink::new(move |upstream, scope| async move {
            let shared = upstream.shared();
            match self.run(shared.to_pull(), scope.clone()).await {
                Ok(end) => Ok(end),
                Err(cause) if cause.is_failure() => f(cause).run(shared.to_pull(), scope).await,
                Err(cause) => Err(cause),
            }
        })
    }

    /// Fold every element into an accumulator until upstream halts. No
    /// leftover.
    pub fn fold<F>(init: A, mut f: F) -> Self
    where
        F: FnMut(A, In) -> A + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            let mut acc = init;
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        for value in chunk {
                            acc = f(acc, value);
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(acc)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }

    /// Fold whole chunks into an accumulator until upstream halts.
    pub fn fold_chunks<F>(init: A, mut f: F) -> Self
    where
        F: FnMut(A, Chunk<In>) -> A + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            let mut acc = init;
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => acc = f(acc, chunk),
                    Step::Halt(()) => return Ok(End::of(acc)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }

    /// Fold while the continuation predicate holds on the accumulator.
    /// The element that turns the predicate false is consumed; the rest
    /// of its chunk becomes the leftover.
    pub fn fold_while<C, F>(init: A, cont: C, mut f: F) -> Self
    where
        C: Fn(&A) -> bool + Send + 'static,
        F: FnMut(A, In) -> A + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            let mut acc = init;
            if !cont(&acc) {
                return Ok(End::of(acc));
            }
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        let mut iter = chunk.into_vec().into_iter();
                        while let Some(value) = iter.next() {
                            acc = f(acc, value);
                            if !cont(&acc) {
                                let rest: Vec<In> = iter.collect();
                                return Ok(End {
                                    value: acc,
                                    leftover: Chunk::from_vec(rest),
                                });
                            }
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(acc)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }

    /// Fold at most `max` elements; the unconsumed tail of the final
    /// chunk becomes the leftover.
    pub fn fold_until<F>(init: A, max: usize, mut f: F) -> Self
    where
        F: FnMut(A, In) -> A + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            let mut acc = init;
            let mut seen = 0usize;
            if max == 0 {
                return Ok(End::of(acc));
            }
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        let need = max - seen;
                        if chunk.len() <= need {
                            seen += chunk.len();
                            for value in chunk {
                                acc = f(acc, value);
                            }
                            if seen == max {
                                return Ok(End::of(acc));
                            }
                        } else {
                            let (head, rest) = chunk.split_at(need);
                            if let Some(head) = head {
                                for value in head {
                                    acc = f(acc, value);
                                }
                            }
                            return Ok(End {
                                value: acc,
                                leftover: rest,
                            });
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(acc)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }
}

impl<In> Sink<Vec<In>, In>
where
    In: Send + 'static,
{
    /// Collect the first `n` elements; the unconsumed tail of the final
    /// chunk becomes the leftover.
    pub fn take(n: usize) -> Self {
        Sink::new(move |mut pull, _scope| async move {
            let mut taken: Vec<In> = Vec::new();
            if n == 0 {
                return Ok(End::of(taken));
            }
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        let need = n - taken.len();
                        if chunk.len() <= need {
                            taken.extend(chunk);
                            if taken.len() == n {
                                return Ok(End::of(taken));
                            }
                        } else {
                            let (head, rest) = chunk.split_at(need);
                            if let Some(head) = head {
                                taken.extend(head);
                            }
                            return Ok(End {
                                value: taken,
                                leftover: rest,
                            });
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(taken)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }

    /// Collect every element until upstream halts.
    pub fn collect_all() -> Self {
        Sink::fold(Vec::new(), |mut acc, value| {
            acc.push(value);
            acc
        })
    }
}

impl<In> Sink<Option<In>, In>
where
    In: Send + 'static,
{
    /// The first element, with the rest of its chunk as leftover.
    pub fn head() -> Self {
        Sink::new(move |mut pull, _scope| async move {
            match pull.next().await {
                Step::Emit(chunk) => {
                    let (first, rest) = chunk.split_at(1);
                    Ok(End {
                        value: first.and_then(|head| head.into_iter().next()),
                        leftover: rest,
                    })
                }
                Step::Halt(()) => Ok(End::of(None)),
                Step::Fail(cause) => Err(cause),
            }
        })
    }

    /// The last element before upstream halts.
    pub fn last() -> Self {
        Sink::fold(None, |_, value| Some(value))
    }

    /// The first element matching the predicate, with the rest of its
    /// chunk as leftover.
    pub fn find<F>(mut pred: F) -> Self
    where
        F: FnMut(&In) -> bool + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        let mut values = chunk.into_vec();
                        if let Some(index) = values.iter().position(&mut pred) {
                            let rest = values.split_off(index + 1);
                            return Ok(End {
                                value: values.pop(),
                                leftover: Chunk::from_vec(rest),
                            });
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(None)),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }
}

impl<In> Sink<In, In>
where
    In: Default + std::ops::Add<Output = In> + Send + 'static,
{
    /// Sum every element, starting from the default value.
    pub fn sum() -> Self {
        Sink::fold(In::default(), |acc, value| acc + value)
    }
}

impl<In> Sink<usize, In>
where
    In: Send + 'static,
{
    /// Count the elements.
    pub fn count() -> Self {
        Sink::fold(0usize, |acc, _| acc + 1)
    }
}

impl<In> Sink<String, In>
where
    In: fmt::Display + Send + 'static,
{
    /// Render every element with a separator in between.
    pub fn mk_string(separator: impl Into<String>) -> Self {
        let separator = separator.into();
        Sink::fold(String::new(), move |mut acc, value: In| {
            if !acc.is_empty() {
                acc.push_str(&separator);
            }
            acc.push_str(&value.to_string());
            acc
        })
    }
}

impl<In> Sink<(), In>
where
    In: Send + 'static,
{
    /// Consume and discard everything.
    pub fn drain() -> Self {
        Sink::fold((), |_, _| ())
    }

    /// Bind an effect to every element.
    pub fn for_each<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(In) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        for value in chunk {
                            f(value).await?;
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(())),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }

    /// Bind an effect to every element until it returns false; the rest
    /// of that chunk becomes the leftover.
    pub fn for_each_while<F, Fut>(mut f: F) -> Self
    where
        F: FnMut(In) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<bool>> + Send + 'static,
    {
        Sink::new(move |mut pull, _scope| async move {
            loop {
                match pull.next().await {
                    Step::Emit(chunk) => {
                        let mut iter = chunk.into_vec().into_iter();
                        while let Some(value) = iter.next() {
                            if !f(value).await? {
                                let rest: Vec<In> = iter.collect();
                                return Ok(End {
                                    value: (),
                                    leftover: Chunk::from_vec(rest),
                                });
                            }
                        }
                    }
                    Step::Halt(()) => return Ok(End::of(())),
                    Step::Fail(cause) => return Err(cause),
                }
            }
        })
    }
}
