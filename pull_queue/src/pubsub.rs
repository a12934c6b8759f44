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
use std::sync::Arc;
use std::sync::Mutex;

use pull_core::Chunk;
use pull_core::Exit;
use pull_core::Pull;
use pull_core::Step;
use pull_scope::Scope;

use crate::queue::Queue;
use crate::queue::Strategy;

struct PsState<A> {
    subscribers: Vec<(u64, Queue<A, ()>)>,
    next_id: u64,
    replay_buffer: VecDeque<A>,
    terminal: Option<Exit<()>>,
}

struct PsInner<A> {
    state: Mutex<PsState<A>>,
    capacity: Option<usize>,
    strategy: Strategy,
    replay: usize,
}

/// A broadcaster: every published value is delivered to every subscriber,
/// in publish order per subscriber.
///
/// Each subscriber owns a queue configured with the pubsub's capacity and
/// strategy. Publishing under [`Strategy::Suspend`] awaits every
/// subscriber in turn, so the pubsub's back-pressure is its slowest
/// subscriber. A replay depth of `n` re-delivers the last `n` published
/// values to late subscribers.
pub struct PubSub<A> {
    inner: Arc<PsInner<A>>,
}

impl<A> Clone for PubSub<A> {
    fn clone(&self) -> Self {
        PubSub {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> PubSub<A>
where
    A: Clone + Send + 'static,
{
    /// A pubsub whose subscribers buffer at most `capacity` values.
    pub fn bounded(capacity: usize, strategy: Strategy) -> Self {
        Self::new(Some(capacity), strategy, 0)
    }

    /// A pubsub with unbounded subscriber buffers.
    pub fn unbounded() -> Self {
        Self::new(None, Strategy::Suspend, 0)
    }

    /// Full constructor.
    pub fn new(capacity: Option<usize>, strategy: Strategy, replay: usize) -> Self {
        PubSub {
            inner: Arc::new(PsInner {
                state: Mutex::new(PsState {
                    subscribers: Vec::new(),
                    next_id: 0,
                    replay_buffer: VecDeque::new(),
                    terminal: None,
                }),
                capacity,
                strategy,
                replay,
            }),
        }
    }

    /// The per-subscriber buffer capacity, `None` for unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// The per-subscriber back-pressure strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("lock poisoned")
            .subscribers
            .len()
    }

    /// Publish one value to every subscriber. Returns false once the
    /// pubsub is done.
    pub async fn publish(&self, value: A) -> bool {
        let subscribers = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.terminal.is_some() {
                return false;
            }
            if self.inner.replay > 0 {
                state.replay_buffer.push_back(value.clone());
                while state.replay_buffer.len() > self.inner.replay {
                    state.replay_buffer.pop_front();
                }
            }
            state
                .subscribers
                .iter()
                .map(|(_, queue)| queue.clone())
                .collect::<Vec<_>>()
        };
        for queue in subscribers {
            queue.offer(value.clone()).await;
        }
        true
    }

    /// Publish a batch of values in order.
    pub async fn publish_all(&self, values: impl IntoIterator<Item = A>) -> bool {
        for value in values {
            if !self.publish(value).await {
                return false;
            }
        }
        true
    }

    /// Subscribe, binding the subscription's lifetime to `scope`.
    ///
    /// When the scope closes, the subscriber is removed and its queue is
    /// shut down. Subscribing after the pubsub is done yields a
    /// subscription that observes only the replayed values and the
    /// terminal.
    pub async fn subscribe(&self, scope: &Scope) -> Subscription<A> {
        let queue: Queue<A, ()> = Queue::with_capacity(self.inner.capacity, self.inner.strategy);
        let id = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            let id = state.next_id;
            state.next_id += 1;
            for value in state.replay_buffer.iter() {
                queue.offer_now(value.clone());
            }
            match &state.terminal {
                Some(Ok(())) => {
                    queue.end(());
                }
                Some(Err(cause)) => {
                    queue.fail_cause(cause.clone());
                }
                None => state.subscribers.push((id, queue.clone())),
            }
            id
        };
        let inner = Arc::clone(&self.inner);
        let handle = queue.clone();
        scope
            .add_finalizer(move |_exit| async move {
                inner
                    .state
                    .lock()
                    .expect("lock poisoned")
                    .subscribers
                    .retain(|(sid, _)| *sid != id);
                handle.shutdown();
                Ok(())
            })
            .await;
        Subscription { queue }
    }

    /// Attach the terminal exit. Every subscriber observes it after
    /// draining its buffered values. The first terminal wins.
    pub fn done(&self, exit: Exit<()>) -> bool {
        let subscribers = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(exit.clone());
            std::mem::take(&mut state.subscribers)
        };
        for (_, queue) in subscribers {
            match &exit {
                Ok(()) => {
                    queue.end(());
                }
                Err(cause) => {
                    queue.fail_cause(cause.clone());
                }
            }
        }
        true
    }
}

/// One subscriber's view of a [`PubSub`].
pub struct Subscription<A> {
    queue: Queue<A, ()>,
}

impl<A> Subscription<A>
where
    A: Send + 'static,
{
    /// Take the next delivered value, or the pubsub's terminal.
    pub async fn take(&self) -> Step<A, ()> {
        self.queue.take().await
    }

    /// Take everything currently delivered as one non-empty chunk.
    pub async fn take_all(&self) -> Step<Chunk<A>, ()> {
        self.queue.take_all().await
    }

    /// A pull over this subscription's values.
    pub fn pull(&self) -> Pull<A, ()> {
        self.queue.pull()
    }

    /// A chunked pull over this subscription's values.
    pub fn chunk_pull(&self) -> Pull<Chunk<A>, ()> {
        self.queue.chunk_pull()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use pull_core::Cause;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_the_full_sequence_in_order() {
        let pubsub: PubSub<u32> = PubSub::unbounded();
        let scope = Scope::root();
        let subs = vec![
            pubsub.subscribe(&scope).await,
            pubsub.subscribe(&scope).await,
            pubsub.subscribe(&scope).await,
        ];
        pubsub.publish_all(1..=5).await;
        pubsub.done(Ok(()));
        for sub in subs {
            let mut seen = Vec::new();
            loop {
                match sub.take().await {
                    Step::Emit(n) => seen.push(n),
                    Step::Halt(()) => break,
                    Step::Fail(cause) => panic!("pubsub failed: {}", cause),
                }
            }
            assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        }
        scope.close(Ok(())).await;
    }

    #[tokio::test]
    async fn replay_redelivers_to_late_subscribers() {
        let pubsub: PubSub<u32> = PubSub::new(None, Strategy::Suspend, 2);
        let scope = Scope::root();
        pubsub.publish_all(vec![1, 2, 3]).await;
        let sub = pubsub.subscribe(&scope).await;
        assert_matches!(sub.take().await, Step::Emit(2));
        assert_matches!(sub.take().await, Step::Emit(3));
        scope.close(Ok(())).await;
    }

    #[tokio::test]
    async fn failure_exits_propagate_to_subscribers() {
        let pubsub: PubSub<u32> = PubSub::unbounded();
        let scope = Scope::root();
        let sub = pubsub.subscribe(&scope).await;
        pubsub.publish(1).await;
        pubsub.done(Err(Cause::fail(anyhow::anyhow!("upstream broke"))));
        assert_matches!(sub.take().await, Step::Emit(1));
        assert_matches!(sub.take().await, Step::Fail(Cause::Fail(_)));
        scope.close(Ok(())).await;
    }

    #[tokio::test]
    async fn closing_the_scope_unsubscribes() {
        let pubsub: PubSub<u32> = PubSub::unbounded();
        let scope = Scope::root();
        let _sub = pubsub.subscribe(&scope).await;
        assert_eq!(pubsub.subscriber_count(), 1);
        scope.close(Ok(())).await;
        assert_eq!(pubsub.subscriber_count(), 0);
        assert!(pubsub.publish(1).await);
    }

    #[tokio::test]
    async fn subscribing_after_done_observes_the_terminal() {
        let pubsub: PubSub<u32> = PubSub::unbounded();
        let scope = Scope::root();
        pubsub.done(Ok(()));
        let sub = pubsub.subscribe(&scope).await;
        assert_matches!(sub.take().await, Step::Halt(()));
        scope.close(Ok(())).await;
    }
}
