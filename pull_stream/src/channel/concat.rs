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
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::SharedPull;
use pull_core::Step;
use pull_scope::Scope;

use crate::channel::Channel;
use crate::channel::MergeAllOptions;
use crate::DEFAULT_MERGE_BUFFER;

/// Options of `flat_map`: effective concurrency and, when concurrent, the
/// output buffer size.
#[derive(Copy, Clone, Debug)]
pub struct FlatMapOptions {
    /// Number of inner channels run at once; 1 is fully sequential.
    pub concurrency: usize,
    /// Output queue capacity used by the concurrent mode.
    pub buffer_size: usize,
}

impl Default for FlatMapOptions {
    fn default() -> Self {
        FlatMapOptions {
            concurrency: 1,
            buffer_size: DEFAULT_MERGE_BUFFER,
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
    /// When this channel halts, use its done value to build the channel
    /// that continues the output; its outputs and done are adopted.
    pub fn concat_with<OD2, F>(self, f: F) -> Channel<OA, OD2, IA, ID>
    where
        OD2: Clone + Send + 'static,
        F: FnOnce(OD) -> Channel<OA, OD2, IA, ID> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let shared = upstream.shared();
            let child = scope.fork().await;
            match self.into_pull(shared.to_pull(), child.clone()).await {
                Ok(pull) => Ok(Pull::new(ConcatSource {
                    state: Some(ConcatState::First { pull, scope: child }),
                    f: Some(f),
                    shared,
                    parent: scope,
                })),
                Err(cause) => {
                    child.close(Err(cause.clone())).await;
                    Err(cause)
                }
            }
        })
    }

    /// Emit everything from this channel, then everything from `that`.
    pub fn concat<OD2>(self, that: Channel<OA, OD2, IA, ID>) -> Channel<OA, OD2, IA, ID>
    where
        OD2: Clone + Send + 'static,
    {
        self.concat_with(move |_done| that)
    }

    /// For every output value, build an inner channel and emit its
    /// outputs. Sequential by default; with concurrency above 1 this
    /// delegates to `merge_all`.
    pub fn flat_map<OB, F>(self, f: F, options: FlatMapOptions) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> Channel<OB> + Send + 'static,
    {
        if options.concurrency > 1 {
            return self.map(f).merge_all(MergeAllOptions {
                concurrency: options.concurrency,
                buffer_size: options.buffer_size,
                switch: false,
            });
        }
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope.clone()).await?;
            Ok(Pull::new(FlatMapSource {
                upstream: pull,
                f,
                current: None,
                parent: scope,
            }))
        })
    }
}

enum ConcatState<OA, OD, OD2> {
    First { pull: Pull<OA, OD>, scope: Scope },
    Second { pull: Pull<OA, OD2>, scope: Scope },
    Spent(Cause),
}

struct ConcatSource<OA, OD, OD2, IA, ID, F> {
    state: Option<ConcatState<OA, OD, OD2>>,
    f: Option<F>,
    shared: SharedPull<IA, ID>,
    parent: Scope,
}

impl<OA, OD, OD2, IA, ID, F> PullSource<OA, OD2> for ConcatSource<OA, OD, OD2, IA, ID, F>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    OD2: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
    F: FnOnce(OD) -> Channel<OA, OD2, IA, ID> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, OD2>>
    where
        OA: 'a,
        OD2: 'a,
    {
        Box::pin(async move {
            loop {
                match self.state.take() {
                    Some(ConcatState::First { mut pull, scope }) => match pull.next().await {
                        Step::Emit(value) => {
                            self.state = Some(ConcatState::First { pull, scope });
                            return Step::Emit(value);
                        }
                        Step::Halt(done) => {
                            scope.close(Ok(())).await;
                            let f = match self.f.take() {
                                Some(f) => f,
                                None => {
                                    let cause =
                                        Cause::die(anyhow::anyhow!("continuation consumed twice"));
                                    self.state = Some(ConcatState::Spent(cause.clone()));
                                    return Step::Fail(cause);
                                }
                            };
                            let child = self.parent.fork().await;
                            match f(done)
                                .into_pull(self.shared.to_pull(), child.clone())
                                .await
                            {
                                Ok(pull) => {
                                    self.state = Some(ConcatState::Second { pull, scope: child });
                                }
                                Err(cause) => {
                                    child.close(Err(cause.clone())).await;
                                    self.state = Some(ConcatState::Spent(cause.clone()));
                                    return Step::Fail(cause);
                                }
                            }
                        }
                        Step::Fail(cause) => {
                            scope.close(Err(cause.clone())).await;
                            self.state = Some(ConcatState::Spent(cause.clone()));
                            return Step::Fail(cause);
                        }
                    },
                    Some(ConcatState::Second { mut pull, scope }) => match pull.next().await {
                        Step::Emit(value) => {
                            self.state = Some(ConcatState::Second { pull, scope });
                            return Step::Emit(value);
                        }
                        Step::Halt(done) => {
                            scope.close(Ok(())).await;
                            return Step::Halt(done);
                        }
                        Step::Fail(cause) => {
                            scope.close(Err(cause.clone())).await;
                            self.state = Some(ConcatState::Spent(cause.clone()));
                            return Step::Fail(cause);
                        }
                    },
                    Some(ConcatState::Spent(cause)) => {
                        self.state = Some(ConcatState::Spent(cause.clone()));
                        return Step::Fail(cause);
                    }
                    None => {
                        return Step::Fail(Cause::die(anyhow::anyhow!(
                            "concat pulled after its terminal step"
                        )))
                    }
                }
            }
        })
    }
}

struct FlatMapSource<OA, OB, OD, F> {
    upstream: Pull<OA, OD>,
    f: F,
    current: Option<(Pull<OB, ()>, Scope)>,
    parent: Scope,
}

impl<OA, OB, OD, F> PullSource<OB, OD> for FlatMapSource<OA, OB, OD, F>
where
    OA: Send + 'static,
    OB: Send + 'static,
    OD: Clone + Send + 'static,
    F: FnMut(OA) -> Channel<OB> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OB, OD>>
    where
        OB: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            loop {
                if let Some((pull, _)) = &mut self.current {
                    match pull.next().await {
                        Step::Emit(value) => return Step::Emit(value),
                        Step::Halt(()) => {
                            if let Some((_, scope)) = self.current.take() {
                                scope.close(Ok(())).await;
                            }
                        }
                        Step::Fail(cause) => {
                            if let Some((_, scope)) = self.current.take() {
                                scope.close(Err(cause.clone())).await;
                            }
                            return Step::Fail(cause);
                        }
                    }
                } else {
                    match self.upstream.next().await {
                        Step::Emit(value) => {
                            let child = self.parent.fork().await;
                            match (self.f)(value)
                                .into_pull(Pull::halt(()), child.clone())
                                .await
                            {
                                Ok(pull) => self.current = Some((pull, child)),
                                Err(cause) => {
                                    child.close(Err(cause.clone())).await;
                                    return Step::Fail(cause);
                                }
                            }
                        }
                        Step::Halt(done) => return Step::Halt(done),
                        Step::Fail(cause) => return Step::Fail(cause),
                    }
                }
            }
        })
    }
}
