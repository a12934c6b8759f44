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

use futures::future::BoxFuture;
use pull_core::Cause;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::SharedError;
use pull_core::SharedPull;
use pull_core::Step;
use pull_scope::Scope;

use crate::channel::Channel;

type Recover<OA, OD, IA, ID> =
    Box<dyn FnOnce(Cause) -> Result<Channel<OA, OD, IA, ID>, Cause> + Send>;

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Recover from a failure by switching to the channel built by `f`,
    /// which sees the same upstream and scope.
    ///
    /// Only ordinary failures are caught; defects and interrupts pass
    /// through, and halts never reach here at all.
    pub fn catch<F>(self, f: F) -> Self
    where
        F: FnOnce(SharedError) -> Self + Send + 'static,
    {
        self.catch_with(Box::new(move |cause| match cause {
            Cause::Fail(err) => Ok(f(err)),
            other => Err(other),
        }))
    }

    /// Recover from any cause, defects and interrupts included.
    pub fn catch_cause<F>(self, f: F) -> Self
    where
        F: FnOnce(Cause) -> Self + Send + 'static,
    {
        self.catch_with(Box::new(move |cause| Ok(f(cause))))
    }

    /// Recover only from causes matching the predicate.
    pub fn catch_filter<P, F>(self, pred: P, f: F) -> Self
    where
        P: FnOnce(&Cause) -> bool + Send + 'static,
        F: FnOnce(Cause) -> Self + Send + 'static,
    {
        self.catch_with(Box::new(move |cause| {
            if pred(&cause) {
                Ok(f(cause))
            } else {
                Err(cause)
            }
        }))
    }

    /// Recover only from failures whose error downcasts to `E`.
    pub fn catch_tag<E, F>(self, f: F) -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
        F: FnOnce(SharedError) -> Self + Send + 'static,
    {
        self.catch_with(Box::new(move |cause| match cause {
            Cause::Fail(err) if err.downcast_ref::<E>().is_some() => Ok(f(err)),
            other => Err(other),
        }))
    }

    fn catch_with(self, recover: Recover<OA, OD, IA, ID>) -> Self {
        Channel::new(move |upstream, scope| async move {
            let shared = upstream.shared();
            match self.into_pull(shared.to_pull(), scope.clone()).await {
                Ok(pull) => Ok(Pull::new(CatchSource {
                    pull,
                    recover: Some(recover),
                    shared,
                    scope,
                })),
                Err(cause) => match recover(cause) {
                    Ok(channel) => channel.into_pull(shared.to_pull(), scope).await,
                    Err(cause) => Err(cause),
                },
            }
        })
    }
}

struct CatchSource<OA, OD, IA, ID> {
    pull: Pull<OA, OD>,
    recover: Option<Recover<OA, OD, IA, ID>>,
    shared: SharedPull<IA, ID>,
    scope: Scope,
}

impl<OA, OD, IA, ID> PullSource<OA, OD> for CatchSource<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, OD>>
    where
        OA: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            loop {
                match self.pull.next().await {
                    Step::Fail(cause) => {
                        let recover = match self.recover.take() {
                            Some(recover) => recover,
                            None => return Step::Fail(cause),
                        };
                        match recover(cause) {
                            Ok(channel) => {
                                match channel
                                    .into_pull(self.shared.to_pull(), self.scope.clone())
                                    .await
                                {
                                    Ok(pull) => self.pull = pull,
                                    Err(cause) => return Step::Fail(cause),
                                }
                            }
                            Err(cause) => return Step::Fail(cause),
                        }
                    }
                    step => return step,
                }
            }
        })
    }
}
