/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use pull_core::Cause;
use pull_core::Pull;
use pull_core::SharedError;

use crate::channel::Channel;
use crate::channel::MapCauseSource;

/// Sentinel wrapper carrying an upstream cause across a transducer that
/// must not be able to observe it. Only defects that downcast to exactly
/// this type are unwrapped at the boundary.
#[derive(Debug, thiserror::Error)]
#[error("upstream failure crossing a transducer boundary: {0}")]
pub(crate) struct PipedFailure(pub(crate) Cause);

fn encode(cause: Cause) -> Cause {
    match cause {
        Cause::Fail(_) => Cause::Die(SharedError::new(PipedFailure(cause))),
        other => other,
    }
}

fn restore(cause: Cause) -> Cause {
    if let Cause::Die(err) = &cause {
        if let Some(piped) = err.downcast_ref::<PipedFailure>() {
            return piped.0.clone();
        }
    }
    cause
}

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Feed this channel's outputs into `other` as its upstream. Both
    /// share the parent scope.
    pub fn pipe_to<OB, OD2>(self, other: Channel<OB, OD2, OA, OD>) -> Channel<OB, OD2, IA, ID>
    where
        OB: Send + 'static,
        OD2: Clone + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let mid = self.into_pull(upstream, scope.clone()).await?;
            other.into_pull(mid, scope).await
        })
    }

    /// Like [`Channel::pipe_to`], but `other` cannot observe failures of
    /// `self`: they ride through its pull as sentinel-typed defects and
    /// are restored to ordinary failures at the composite's boundary.
    pub fn pipe_to_or_fail<OB, OD2>(
        self,
        other: Channel<OB, OD2, OA, OD>,
    ) -> Channel<OB, OD2, IA, ID>
    where
        OB: Send + 'static,
        OD2: Clone + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let mid = self.into_pull(upstream, scope.clone()).await?;
            let fenced = Pull::new(MapCauseSource {
                pull: mid,
                f: encode,
            });
            match other.into_pull(fenced, scope).await {
                Ok(pull) => Ok(Pull::new(MapCauseSource { pull, f: restore })),
                Err(cause) => Err(restore(cause)),
            }
        })
    }
}
