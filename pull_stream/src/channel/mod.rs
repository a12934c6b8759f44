/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

mod bracket;
mod catch;
mod concat;
mod map_effect;
mod merge;
mod merge_all;
mod pipe;
mod run;
mod signal;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use pull_core::Cause;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::PullSource;
use pull_core::Step;
use pull_queue::Queue;
use pull_queue::Strategy;
use pull_queue::Subscription;
use pull_scope::Scope;

pub use self::bracket::scoped_pull;
pub(crate) use self::run::drive;
pub use self::concat::FlatMapOptions;
pub use self::map_effect::MapEffectOptions;
pub use self::merge::HaltStrategy;
pub use self::merge::MergeOptions;
pub use self::merge_all::MergeAllOptions;

type BoxTransform<OA, OD, IA, ID> =
    Box<dyn FnOnce(Pull<IA, ID>, Scope) -> BoxFuture<'static, Exit<Pull<OA, OD>>> + Send>;

/// A producer or transducer, described by its transform.
///
/// The transform takes the upstream pull and a scope, and returns the
/// downstream pull producing `OA` values and terminating with an `OD`
/// done value. Building a channel runs no effects; the transform executes
/// when the channel is driven by a `run_*` method or composed into
/// another channel.
///
/// A channel is a one-shot value: composition and execution consume it.
/// Operators that need to instantiate a pipeline repeatedly take a
/// factory closure instead.
pub struct Channel<OA, OD = (), IA = (), ID = ()> {
    transform: BoxTransform<OA, OD, IA, ID>,
}

impl<OA, OD, IA, ID> Channel<OA, OD, IA, ID>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
    ID: Clone + Send + 'static,
{
    /// Build a channel from its transform.
    pub fn new<F, Fut>(transform: F) -> Self
    where
        F: FnOnce(Pull<IA, ID>, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<Pull<OA, OD>>> + Send + 'static,
    {
        Channel {
            transform: Box::new(move |upstream, scope| transform(upstream, scope).boxed()),
        }
    }

    /// Run the transform, producing the downstream pull.
    ///
    /// Resources acquired by the channel are finalized against `scope`
    /// (or a child forked from it); the caller owns closing the scope
    /// with the exit it observes.
    pub async fn into_pull(self, upstream: Pull<IA, ID>, scope: Scope) -> Exit<Pull<OA, OD>> {
        (self.transform)(upstream, scope).await
    }

    /// A channel that terminates immediately with `done`.
    pub fn end(done: OD) -> Self {
        Channel::new(move |_upstream, _scope| async move { Ok(Pull::halt(done)) })
    }

    /// A channel that suspends forever without producing anything.
    pub fn never() -> Self {
        Channel::new(move |_upstream, _scope| async move {
            Ok(Pull::new(NeverSource))
        })
    }

    /// A channel that fails with the given error.
    pub fn fail(err: impl Into<anyhow::Error> + Send + 'static) -> Self {
        Channel::fail_cause(Cause::fail(err))
    }

    /// A channel that fails with the given cause.
    pub fn fail_cause(cause: Cause) -> Self {
        Channel::new(move |_upstream, _scope| async move { Ok(Pull::fail(cause)) })
    }

    /// A channel that dies with the given defect.
    pub fn die(err: impl Into<anyhow::Error> + Send + 'static) -> Self {
        Channel::fail_cause(Cause::die(err))
    }

    /// Defer building the channel until it is run.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move { thunk().into_pull(upstream, scope).await })
    }

    /// Reify an effect producing a channel.
    pub fn unwrap<Fut>(effect: Fut) -> Self
    where
        Fut: Future<Output = Exit<Self>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            effect.await?.into_pull(upstream, scope).await
        })
    }

    /// A channel producing the elements of a queue, halting with the
    /// queue's terminal.
    pub fn from_queue(queue: Queue<OA, OD>) -> Self {
        Channel::new(move |_upstream, _scope| async move { Ok(queue.pull()) })
    }

    /// Hand a scoped queue to user code and produce whatever it offers.
    ///
    /// The queue is created against a forked scope and shut down when
    /// that scope closes. A failing callback fails the queue, and with it
    /// the channel.
    pub fn callback<F, Fut>(f: F, options: CallbackOptions) -> Self
    where
        F: FnOnce(Queue<OA, OD>) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Channel::new(move |_upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let queue: Queue<OA, OD> = Queue::with_capacity(options.capacity, options.strategy);
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
                Ok(queue.pull())
            })
            .await
        })
    }

    /// Acquire a resource, use it to build a channel, and release it
    /// exactly once when that channel's pull terminates (or the
    /// surrounding scope closes), with the exit observed there.
    pub fn acquire_release<R, AFut, U, Rel, RFut>(acquire: AFut, use_fn: U, release: Rel) -> Self
    where
        R: Send + Sync + 'static,
        AFut: Future<Output = Exit<R>> + Send + 'static,
        U: FnOnce(Arc<R>) -> Self + Send + 'static,
        Rel: FnOnce(Arc<R>, Exit<()>) -> RFut + Send + 'static,
        RFut: Future<Output = ()> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            scoped_pull(&scope, move |child| async move {
                let resource = Arc::new(acquire.await?);
                let shared = Arc::clone(&resource);
                child
                    .add_finalizer(move |exit| async move {
                        release(shared, exit).await;
                        Ok(())
                    })
                    .await;
                use_fn(resource).into_pull(upstream, child).await
            })
            .await
        })
    }

    /// Apply a function to every output value.
    pub fn map<OB, F>(self, f: F) -> Channel<OB, OD, IA, ID>
    where
        OB: Send + 'static,
        F: FnMut(OA) -> OB + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope).await?;
            Ok(Pull::new(MapSource { pull, f }))
        })
    }

    /// Apply a function to the done value.
    pub fn map_halt<OD2, F>(self, f: F) -> Channel<OA, OD2, IA, ID>
    where
        OD2: Clone + Send + 'static,
        F: FnOnce(OD) -> OD2 + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope).await?;
            Ok(Pull::new(MapHaltSource { pull, f: Some(f) }))
        })
    }

    /// Convert failures into defects, making them unrecoverable.
    pub fn or_die(self) -> Self {
        Channel::new(move |upstream, scope| async move {
            let pull = self.into_pull(upstream, scope).await.map_err(Cause::or_die)?;
            Ok(Pull::new(MapCauseSource {
                pull,
                f: Cause::or_die,
            }))
        })
    }
}

impl<OA> Channel<OA>
where
    OA: Send + 'static,
{
    /// A channel that emits one value and halts.
    pub fn succeed(value: OA) -> Self {
        Channel::sync(move || value)
    }

    /// A channel that halts immediately with unit.
    pub fn empty() -> Self {
        Channel::end(())
    }

    /// A channel that evaluates a thunk when run, emits the result, and
    /// halts.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> OA + Send + 'static,
    {
        Channel::new(move |_upstream, _scope| async move {
            Ok(Pull::new(OnceSource { f: Some(f) }))
        })
    }

    /// A channel producing every item of an iterator, one value per pull,
    /// halting with unit on exhaustion.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = OA>,
        I::IntoIter: Send + 'static,
    {
        let iter = iter.into_iter();
        Channel::new(move |_upstream, _scope| async move {
            Ok(Pull::new(IterSource { iter, emitted: 0 }))
        })
    }

    /// A channel producing the values delivered to a pubsub subscription.
    pub fn from_subscription(subscription: Subscription<OA>) -> Self {
        Channel::new(move |_upstream, _scope| async move { Ok(subscription.pull()) })
    }
}

impl<OA, OD, IA> Channel<OA, OD, IA, ()>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    IA: Send + 'static,
{
    /// Redirect this channel's input: `f` consumes the new upstream in a
    /// forked task, and the channel itself sees an upstream that halts
    /// immediately.
    ///
    /// `f` communicates with the channel through side effects (typically
    /// a queue the channel reads from); a failure in `f` is logged
    /// against the scope's logger.
    pub fn embed_input<IA2, ID2, F, Fut>(self, f: F) -> Channel<OA, OD, IA2, ID2>
    where
        IA2: Send + 'static,
        ID2: Clone + Send + 'static,
        F: FnOnce(Pull<IA2, ID2>) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<()>> + Send + 'static,
    {
        Channel::new(move |upstream, scope| async move {
            let child = scope.fork().await;
            let logger = child.logger().clone();
            child
                .spawn(async move {
                    if let Err(cause) = f(upstream).await {
                        slog::warn!(logger, "embedded input writer failed: {}", cause);
                    }
                })
                .await
                .detach();
            self.into_pull(Pull::halt(()), scope).await
        })
    }
}

/// Options of [`Channel::callback`]: the queue's capacity (`None` for
/// unbounded, the default) and back-pressure strategy.
#[derive(Copy, Clone, Debug)]
pub struct CallbackOptions {
    /// Queue capacity; `None` means unbounded.
    pub capacity: Option<usize>,
    /// Back-pressure strategy of the queue.
    pub strategy: Strategy,
}

impl Default for CallbackOptions {
    fn default() -> Self {
        CallbackOptions {
            capacity: None,
            strategy: Strategy::Suspend,
        }
    }
}

struct NeverSource;

impl<A: Send, D: Send> PullSource<A, D> for NeverSource {
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, D>>
    where
        A: 'a,
        D: 'a,
    {
        Box::pin(futures::future::pending())
    }
}

struct OnceSource<F> {
    f: Option<F>,
}

impl<A, F> PullSource<A, ()> for OnceSource<F>
where
    A: Send + 'static,
    F: FnOnce() -> A + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, ()>>
    where
        A: 'a,
        (): 'a,
    {
        Box::pin(async move {
            match self.f.take() {
                Some(f) => Step::Emit(f()),
                None => Step::Halt(()),
            }
        })
    }
}

struct IterSource<I> {
    iter: I,
    emitted: usize,
}

impl<A, I> PullSource<A, ()> for IterSource<I>
where
    A: Send + 'static,
    I: Iterator<Item = A> + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<A, ()>>
    where
        A: 'a,
        (): 'a,
    {
        Box::pin(async move {
            match self.iter.next() {
                Some(value) => {
                    self.emitted += 1;
                    // A tight synchronous producer must still yield so it
                    // cannot starve the runtime.
                    if self.emitted % 128 == 0 {
                        tokio::task::yield_now().await;
                    }
                    Step::Emit(value)
                }
                None => Step::Halt(()),
            }
        })
    }
}

pub(crate) struct MapSource<OA, OD, F> {
    pub(crate) pull: Pull<OA, OD>,
    pub(crate) f: F,
}

impl<OA, OB, OD, F> PullSource<OB, OD> for MapSource<OA, OD, F>
where
    OA: Send + 'static,
    OB: Send + 'static,
    OD: Clone + Send + 'static,
    F: FnMut(OA) -> OB + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OB, OD>>
    where
        OB: 'a,
        OD: 'a,
    {
        Box::pin(async move { self.pull.next().await.map(&mut self.f) })
    }
}

struct MapHaltSource<OA, OD, F> {
    pull: Pull<OA, OD>,
    f: Option<F>,
}

impl<OA, OD, OD2, F> PullSource<OA, OD2> for MapHaltSource<OA, OD, F>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    OD2: Clone + Send + 'static,
    F: FnOnce(OD) -> OD2 + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, OD2>>
    where
        OA: 'a,
        OD2: 'a,
    {
        Box::pin(async move {
            match self.pull.next().await {
                Step::Emit(value) => Step::Emit(value),
                Step::Fail(cause) => Step::Fail(cause),
                Step::Halt(done) => match self.f.take() {
                    Some(f) => Step::Halt(f(done)),
                    // The outer pull memoizes the first halt, so the
                    // mapper can only be consumed once.
                    None => Step::Fail(Cause::die(anyhow::anyhow!(
                        "halt mapper invoked twice"
                    ))),
                },
            }
        })
    }
}

pub(crate) struct MapCauseSource<OA, OD, F> {
    pub(crate) pull: Pull<OA, OD>,
    pub(crate) f: F,
}

impl<OA, OD, F> PullSource<OA, OD> for MapCauseSource<OA, OD, F>
where
    OA: Send + 'static,
    OD: Clone + Send + 'static,
    F: FnMut(Cause) -> Cause + Send,
{
    fn next<'a>(&'a mut self) -> BoxFuture<'a, Step<OA, OD>>
    where
        OA: 'a,
        OD: 'a,
    {
        Box::pin(async move {
            match self.pull.next().await {
                Step::Fail(cause) => Step::Fail((self.f)(cause)),
                step => step,
            }
        })
    }
}
