/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use pull_core::Chunk;
use pull_core::Pull;
use pull_core::Step;
use pull_queue::PubSub;
use pull_queue::Strategy;
use pull_scope::Scope;
use pull_scope::Task;

use crate::channel::Channel;
use crate::stream::Stream;
use crate::DEFAULT_MERGE_BUFFER;

impl<A> Stream<A>
where
    A: Clone + Send + 'static,
{
    /// Fan this stream out to `n` consumers.
    ///
    /// All subscriptions are taken before the pump starts, so every
    /// consumer observes the complete sequence in order, subject to the
    /// buffer strategy. The pump runs in a scope forked from `scope`.
    pub async fn broadcast(
        self,
        scope: &Scope,
        n: usize,
        capacity: usize,
        strategy: Strategy,
    ) -> Vec<Stream<A>> {
        let pubsub: PubSub<A> = PubSub::bounded(capacity, strategy);
        let mut consumers = Vec::with_capacity(n);
        for _ in 0..n {
            consumers.push(Stream::from_subscription(pubsub.subscribe(scope).await));
        }
        let pump_scope = scope.fork().await;
        let channel = self.channel;
        let target = pubsub.clone();
        let branch = pump_scope.clone();
        pump_scope
            .spawn(async move {
                pump(channel, branch, target).await;
            })
            .await
            .detach();
        consumers
    }

    /// Share one underlying pipeline between any number of subscribers.
    ///
    /// The pipeline is started when the first subscriber arrives and
    /// stopped after the last one unsubscribes (plus the idle timeout, if
    /// any); a later subscriber restarts it from the factory.
    pub fn share<F>(factory: F, options: ShareOptions) -> Share<A>
    where
        F: Fn() -> Stream<A> + Send + Sync + 'static,
    {
        Share {
            inner: Arc::new(ShareInner {
                factory: Box::new(factory),
                options,
                state: Mutex::new(ShareState {
                    pubsub: None,
                    pump_scope: None,
                    refcount: 0,
                    epoch: 0,
                }),
            }),
        }
    }
}

async fn pump<A>(channel: Channel<Chunk<A>>, scope: Scope, pubsub: PubSub<A>)
where
    A: Clone + Send + 'static,
{
    match channel.into_pull(Pull::halt(()), scope.clone()).await {
        Ok(mut pull) => loop {
            match pull.next().await {
                Step::Emit(chunk) => {
                    let mut closed = false;
                    for value in chunk {
                        if !pubsub.publish(value).await {
                            closed = true;
                            break;
                        }
                    }
                    if closed {
                        break;
                    }
                }
                Step::Halt(()) => {
                    pubsub.done(Ok(()));
                    break;
                }
                Step::Fail(cause) => {
                    pubsub.done(Err(cause));
                    break;
                }
            }
        },
        Err(cause) => {
            pubsub.done(Err(cause));
        }
    }
}

/// Options of [`Stream::share`].
#[derive(Copy, Clone, Debug)]
pub struct ShareOptions {
    /// Per-subscriber buffer capacity.
    pub capacity: usize,
    /// Per-subscriber back-pressure strategy.
    pub strategy: Strategy,
    /// How long the pipeline survives with zero subscribers before it is
    /// torn down. `None` tears it down immediately.
    pub idle_timeout: Option<Duration>,
}

impl Default for ShareOptions {
    fn default() -> Self {
        ShareOptions {
            capacity: DEFAULT_MERGE_BUFFER,
            strategy: Strategy::Suspend,
            idle_timeout: None,
        }
    }
}

struct ShareState<A> {
    pubsub: Option<PubSub<A>>,
    pump_scope: Option<Scope>,
    refcount: usize,
    epoch: u64,
}

struct ShareInner<A> {
    factory: Box<dyn Fn() -> Stream<A> + Send + Sync>,
    options: ShareOptions,
    state: Mutex<ShareState<A>>,
}

/// A refcounted handle to a shared pipeline; every call to
/// [`Share::stream`] is one subscriber.
pub struct Share<A> {
    inner: Arc<ShareInner<A>>,
}

impl<A> Clone for Share<A> {
    fn clone(&self) -> Self {
        Share {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Share<A>
where
    A: Clone + Send + 'static,
{
    /// A stream that subscribes to the shared pipeline when run and
    /// unsubscribes when its scope closes.
    pub fn stream(&self) -> Stream<A> {
        let inner = Arc::clone(&self.inner);
        Stream::from_channel(Channel::new(move |_upstream, scope| async move {
            let (pubsub, fresh) = {
                let mut state = inner.state.lock().expect("lock poisoned");
                state.refcount += 1;
                match &state.pubsub {
                    Some(pubsub) => (pubsub.clone(), None),
                    None => {
                        let pubsub: PubSub<A> = PubSub::bounded(
                            inner.options.capacity,
                            inner.options.strategy,
                        );
                        let pump_scope = Scope::root_with_logger(scope.logger().clone());
                        state.pubsub = Some(pubsub.clone());
                        state.pump_scope = Some(pump_scope.clone());
                        state.epoch += 1;
                        (pubsub.clone(), Some(pump_scope))
                    }
                }
            };
            // Subscribe before the pump starts so the first subscriber
            // cannot miss elements.
            let subscription = pubsub.subscribe(&scope).await;
            if let Some(pump_scope) = fresh {
                let channel = (inner.factory)().into_channel();
                let branch = pump_scope.clone();
                let target = pubsub.clone();
                pump_scope
                    .spawn(async move {
                        pump(channel, branch, target).await;
                    })
                    .await
                    .detach();
            }
            let release = Arc::clone(&inner);
            scope
                .add_finalizer(move |_exit| async move {
                    unsubscribe(release).await;
                    Ok(())
                })
                .await;
            Ok(subscription.chunk_pull())
        }))
    }
}

async fn unsubscribe<A>(inner: Arc<ShareInner<A>>)
where
    A: Clone + Send + 'static,
{
    let idle = {
        let mut state = inner.state.lock().expect("lock poisoned");
        state.refcount -= 1;
        if state.refcount > 0 {
            return;
        }
        state.epoch
    };
    match inner.options.idle_timeout {
        None => stop_if_idle(&inner, idle).await,
        Some(timeout) => {
            let handle = Arc::clone(&inner);
            Task::spawn(async move {
                tokio::time::sleep(timeout).await;
                stop_if_idle(&handle, idle).await;
            })
            .detach();
        }
    }
}

async fn stop_if_idle<A>(inner: &Arc<ShareInner<A>>, epoch: u64)
where
    A: Clone + Send + 'static,
{
    let stopped = {
        let mut state = inner.state.lock().expect("lock poisoned");
        if state.refcount == 0 && state.epoch == epoch {
            state.pubsub = None;
            state.pump_scope.take()
        } else {
            None
        }
    };
    if let Some(scope) = stopped {
        scope.close(Ok(())).await;
    }
}
