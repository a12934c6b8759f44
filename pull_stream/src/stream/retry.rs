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
use pull_scope::Scope;

use crate::channel::Channel;
use crate::stream::Stream;

impl<A> Stream<A>
where
    A: Send + 'static,
{
    /// Build the stream from a factory and re-run it from scratch on
    /// failure, sleeping the next backoff interval between attempts.
    ///
    /// The factory receives the attempt number, starting at 1. When the
    /// backoff iterator runs dry the last failure propagates. A retried
    /// stream restarts from its beginning, so elements emitted before
    /// the failure are emitted again; nothing retries implicitly
    /// anywhere else in the engine.
    pub fn retry<F, B>(make: F, backoff: B) -> Stream<A>
    where
        F: FnMut(usize) -> Stream<A> + Send + 'static,
        B: Iterator<Item = Duration> + Send + 'static,
    {
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            Ok(Pull::new(RetrySource {
                make,
                backoff,
                attempt: 0,
                current: None,
                parent: scope,
            }))
        }))
    }
}

struct RetrySource<A, F, B> {
    make: F,
    backoff: B,
    attempt: usize,
    current: Option<(Pull<Chunk<A>, ()>, Scope)>,
    parent: Scope,
}

impl<A, F, B> RetrySource<A, F, B>
where
    B: Iterator<Item = Duration> + Send,
{
    async fn pause(&mut self) -> Option<()> {
        match self.backoff.next() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Some(())
            }
            None => None,
        }
    }
}

impl<A, F, B> PullSource<Chunk<A>, ()> for RetrySource<A, F, B>
where
    A: Send + 'static,
    F: FnMut(usize) -> Stream<A> + Send,
    B: Iterator<Item = Duration> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<Chunk<A>, ()>>
    where
        Chunk<A>: 'a,
        (): 'a,
    {
        Box::pin(async move {
            loop {
                if self.current.is_none() {
                    self.attempt += 1;
                    let child = self.parent.fork().await;
                    match (self.make)(self.attempt)
                        .into_channel()
                        .into_pull(Pull::halt(()), child.clone())
                        .await
                    {
                        Ok(pull) => self.current = Some((pull, child)),
                        Err(cause) => {
                            child.close(Err(cause.clone())).await;
                            if self.pause().await.is_none() {
                                return Step::Fail(cause);
                            }
                            continue;
                        }
                    }
                }
                let step = match &mut self.current {
                    Some((pull, _)) => pull.next().await,
                    None => continue,
                };
                match step {
                    Step::Emit(chunk) => return Step::Emit(chunk),
                    Step::Halt(()) => {
                        if let Some((_, scope)) = self.current.take() {
                            scope.close(Ok(())).await;
                        }
                        return Step::Halt(());
                    }
                    Step::Fail(cause) => {
                        if let Some((_, scope)) = self.current.take() {
                            scope.close(Err(cause.clone())).await;
                        }
                        if self.pause().await.is_none() {
                            return Step::Fail(cause);
                        }
                    }
                }
            }
        })
    }
}
